//! ICMP Echo responder. Only Echo Request/Reply are handled;
//! every other ICMP type is silently ignored.

use crate::checksum::internet_checksum;
use crate::error::{CoreError, CoreResult};
use crate::ipv4::{Ipv4Header, PROTO_ICMP};

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;
const HEADER_LEN: usize = 8;

/// Builds the full IPv4 datagram for an Echo Reply, if `icmp_payload` (the
/// IPv4 payload already routed to us as protocol=1) is an Echo Request.
/// Returns `Ok(None)` for any other ICMP type.
pub fn handle(ip_header: &Ipv4Header, icmp_payload: &[u8]) -> CoreResult<Option<Vec<u8>>> {
    if icmp_payload.len() < HEADER_LEN {
        return Err(CoreError::parse("ICMP message shorter than 8 bytes"));
    }
    let icmp_type = icmp_payload[0];
    if icmp_type != TYPE_ECHO_REQUEST {
        return Ok(None);
    }
    let identifier = [icmp_payload[4], icmp_payload[5]];
    let sequence = [icmp_payload[6], icmp_payload[7]];
    let data = &icmp_payload[HEADER_LEN..];

    let mut reply = Vec::with_capacity(HEADER_LEN + data.len());
    reply.push(TYPE_ECHO_REPLY);
    reply.push(0); // code
    reply.extend_from_slice(&[0, 0]); // checksum placeholder
    reply.extend_from_slice(&identifier);
    reply.extend_from_slice(&sequence);
    reply.extend_from_slice(data);

    let checksum = internet_checksum(&reply);
    reply[2..4].copy_from_slice(&checksum.to_be_bytes());

    let datagram = Ipv4Header::build(ip_header.dst, ip_header.src, PROTO_ICMP, &reply);
    Ok(Some(datagram))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn echo_reply_preserves_id_seq_and_payload() {
        // 08 00 f7 ff 00 01 00 01: type=8 (request), code=0, id=1, seq=1
        let request = [0x08, 0x00, 0xf7, 0xff, 0x00, 0x01, 0x00, 0x01];
        let ip_header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            PROTO_ICMP,
            request.len() as u16,
        );
        let datagram = handle(&ip_header, &request).unwrap().unwrap();
        let reply = &datagram[ip_header.header_len()..];
        assert_eq!(reply[0], TYPE_ECHO_REPLY);
        assert_eq!(reply[1], 0);
        assert_eq!(&reply[4..6], &[0x00, 0x01]);
        assert_eq!(&reply[6..8], &[0x00, 0x01]);
        // The checksum field, whatever its value, must make the message
        // verify to zero under the same algorithm that produced it.
        assert_eq!(internet_checksum(reply), 0);
    }

    #[test]
    fn non_echo_types_ignored() {
        let other = [0x03, 0x01, 0, 0, 0, 0, 0, 0]; // destination unreachable
        let ip_header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            PROTO_ICMP,
            other.len() as u16,
        );
        assert!(handle(&ip_header, &other).unwrap().is_none());
    }
}
