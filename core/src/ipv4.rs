//! IPv4 header parsing/encoding and the protocol dispatcher.

use std::net::Ipv4Addr;

use rand::Rng;
use tracing::warn;

use crate::checksum::internet_checksum;
use crate::error::{CoreError, CoreResult};

pub const MIN_HEADER_LEN: usize = 20;
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// A fresh header for an outgoing datagram: IHL=5, TTL=64, DF set, a
    /// random ID, checksum left at 0 until `encode` fills it in.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: u16) -> Self {
        let id: u16 = rand::thread_rng().gen();
        Ipv4Header {
            ihl: 5,
            tos: 0,
            total_length: MIN_HEADER_LEN as u16 + payload_len,
            identification: id,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            src,
            dst,
            options: Vec::new(),
        }
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Encodes the header with its checksum recomputed over the header
    /// bytes (checksum field zeroed during computation).
    pub fn encode(&self) -> Vec<u8> {
        let len = self.header_len();
        let mut buf = vec![0u8; len];
        buf[0] = (4 << 4) | self.ihl;
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let mut flags_frag: u16 = self.fragment_offset & 0x1FFF;
        if self.dont_fragment {
            flags_frag |= 0x4000;
        }
        if self.more_fragments {
            flags_frag |= 0x2000;
        }
        buf[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[10..12].copy_from_slice(&0u16.to_be_bytes());
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
        if len > MIN_HEADER_LEN {
            let opt_len = len - MIN_HEADER_LEN;
            buf[MIN_HEADER_LEN..].copy_from_slice(&self.options[..opt_len]);
        }
        let checksum = internet_checksum(&buf);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Builds a full datagram (header + payload) ready for the wire.
    pub fn build(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let header = Ipv4Header::new(src, dst, protocol, payload.len() as u16);
        let mut out = header.encode();
        out.extend_from_slice(payload);
        out
    }
}

/// Parses the 20-byte-or-larger fixed/options header from `data`. Does not
/// validate `total_length` against the buffer — that's the dispatcher's
/// job, since a short buffer is a truncation, not necessarily malformed.
pub fn parse_header(data: &[u8]) -> CoreResult<Ipv4Header> {
    if data.len() < MIN_HEADER_LEN {
        return Err(CoreError::parse("IPv4 datagram shorter than 20 bytes"));
    }
    let version = data[0] >> 4;
    let ihl = data[0] & 0x0F;
    if version != 4 {
        return Err(CoreError::parse(format!("unsupported IP version {version}")));
    }
    if ihl < 5 {
        return Err(CoreError::parse(format!("IHL {ihl} below minimum of 5")));
    }
    if data.len() < ihl as usize * 4 {
        return Err(CoreError::parse("buffer shorter than IHL*4"));
    }
    let tos = data[1];
    let total_length = u16::from_be_bytes([data[2], data[3]]);
    if total_length < ihl as u16 * 4 {
        return Err(CoreError::parse("total_length below IHL*4"));
    }
    let identification = u16::from_be_bytes([data[4], data[5]]);
    let flags_frag = u16::from_be_bytes([data[6], data[7]]);
    let ttl = data[8];
    let protocol = data[9];
    let checksum = u16::from_be_bytes([data[10], data[11]]);
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let options = data[MIN_HEADER_LEN..(ihl as usize * 4)].to_vec();

    Ok(Ipv4Header {
        ihl,
        tos,
        total_length,
        identification,
        dont_fragment: flags_frag & 0x4000 != 0,
        more_fragments: flags_frag & 0x2000 != 0,
        fragment_offset: flags_frag & 0x1FFF,
        ttl,
        protocol,
        checksum,
        src,
        dst,
        options,
    })
}

/// The result of routing a datagram by protocol.
pub enum Routed<'a> {
    Icmp(Ipv4Header, &'a [u8]),
    Tcp(Ipv4Header, &'a [u8]),
    Ignored(Ipv4Header),
}

/// Validates and routes a received IPv4 datagram. Truncates the payload to
/// `total_length` when the buffer holds extra trailing bytes, and warns
/// when it does — this is a boundary condition, not a parse failure.
pub fn dispatch<'a>(datagram: &'a [u8]) -> CoreResult<Routed<'a>> {
    let header = parse_header(datagram)?;
    let header_len = header.header_len();

    let declared_payload = header.total_length as usize - header_len;
    let available_payload = datagram.len() - header_len;
    let payload_len = declared_payload.min(available_payload);
    if available_payload > declared_payload {
        warn!(
            total_length = header.total_length,
            buffer_len = datagram.len(),
            "IPv4 buffer exceeds declared total_length; truncating payload"
        );
    }
    let payload = &datagram[header_len..header_len + payload_len];

    Ok(match header.protocol {
        PROTO_ICMP => Routed::Icmp(header, payload),
        PROTO_TCP => Routed::Tcp(header, payload),
        _ => Routed::Ignored(header),
    })
}
