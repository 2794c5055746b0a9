//! TCP header parsing/encoding and the pseudo-header checksum.

use std::net::Ipv4Addr;

use crate::checksum::{internet_checksum_parts, tcp_pseudo_header};
use crate::error::{CoreError, CoreResult};

pub const MIN_HEADER_LEN: usize = 20;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8, // in 32-bit words, like IHL
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }
}

/// Parses a TCP segment into its header and payload slice.
pub fn parse(data: &[u8]) -> CoreResult<(TcpHeader, &[u8])> {
    if data.len() < MIN_HEADER_LEN {
        return Err(CoreError::parse("TCP segment shorter than 20 bytes"));
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let data_offset = data[12] >> 4;
    if (data_offset as usize) < 5 {
        return Err(CoreError::parse("TCP data offset below minimum of 5"));
    }
    let header_len = data_offset as usize * 4;
    if data.len() < header_len {
        return Err(CoreError::parse("buffer shorter than TCP data offset*4"));
    }
    let flags = data[13];
    let window = u16::from_be_bytes([data[14], data[15]]);
    let checksum = u16::from_be_bytes([data[16], data[17]]);
    let urgent_ptr = u16::from_be_bytes([data[18], data[19]]);
    let options = data[MIN_HEADER_LEN..header_len].to_vec();
    let payload = &data[header_len..];

    Ok((
        TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset,
            flags,
            window,
            checksum,
            urgent_ptr,
            options,
        },
        payload,
    ))
}

/// Builds a full TCP segment (header + payload) with a correct checksum,
/// computed against the given IPv4 endpoints per the pseudo-header rule.
pub fn build(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let header_len = MIN_HEADER_LEN;
    let mut segment = vec![0u8; header_len + payload.len()];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = ((header_len / 4) as u8) << 4;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&window.to_be_bytes());
    segment[16..18].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    segment[18..20].copy_from_slice(&0u16.to_be_bytes()); // urgent ptr
    segment[header_len..].copy_from_slice(payload);

    let pseudo = tcp_pseudo_header(src_ip.octets(), dst_ip.octets(), segment.len() as u16);
    let checksum = internet_checksum_parts(&[&pseudo, &segment]);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let raw = build(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            443,
            40000,
            1000,
            2000,
            flags::SYN | flags::ACK,
            65535,
            b"hi",
        );
        let (header, payload) = parse(&raw).unwrap();
        assert_eq!(header.src_port, 443);
        assert_eq!(header.dst_port, 40000);
        assert_eq!(header.seq, 1000);
        assert_eq!(header.ack, 2000);
        assert!(header.has_flag(flags::SYN));
        assert!(header.has_flag(flags::ACK));
        assert!(!header.has_flag(flags::FIN));
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn checksum_verifies() {
        let raw = build(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            80,
            12345,
            1,
            1,
            flags::ACK,
            4096,
            &[],
        );
        let pseudo = tcp_pseudo_header(
            [192, 168, 1, 1],
            [192, 168, 1, 2],
            raw.len() as u16,
        );
        assert_eq!(internet_checksum_parts(&[&pseudo, &raw]), 0);
    }
}
