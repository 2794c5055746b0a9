//! TLS record layer framing: splitting a byte stream into
//! `ContentType || 0x03 0x03 || u16 length || fragment` records, and
//! re-assembling handshake messages that straddle more than one record.

use crate::error::{CoreError, CoreResult};

pub const HEADER_LEN: usize = 5;
pub const MAX_FRAGMENT_LEN: usize = 16384;

pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
}

pub struct RawRecord {
    pub content_type: u8,
    pub fragment: Vec<u8>,
}

/// Prepends the 5-byte record header for `fragment` (TLS 1.2, i.e. legacy
/// version 0x0303 in the header regardless of content).
pub fn encode(content_type: u8, fragment: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + fragment.len());
    out.push(content_type);
    out.extend_from_slice(&[0x03, 0x03]);
    out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
    out.extend_from_slice(fragment);
    out
}

/// Drains as many complete records as `buffer` currently holds, leaving any
/// trailing partial record in place for the next call. A record whose
/// declared length exceeds `MAX_FRAGMENT_LEN` is a framing error.
pub fn drain_records(buffer: &mut Vec<u8>) -> CoreResult<Vec<RawRecord>> {
    let mut records = Vec::new();
    let mut consumed = 0usize;

    loop {
        let remaining = &buffer[consumed..];
        if remaining.len() < HEADER_LEN {
            break;
        }
        let content_type = remaining[0];
        let length = u16::from_be_bytes([remaining[3], remaining[4]]) as usize;
        if length > MAX_FRAGMENT_LEN {
            return Err(CoreError::protocol("TLS record exceeds maximum fragment length"));
        }
        if remaining.len() < HEADER_LEN + length {
            break;
        }
        let fragment = remaining[HEADER_LEN..HEADER_LEN + length].to_vec();
        records.push(RawRecord { content_type, fragment });
        consumed += HEADER_LEN + length;
    }

    buffer.drain(0..consumed);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_one_complete_record() {
        let mut buf = encode(content_type::HANDSHAKE, b"hello");
        let records = drain_records(&mut buf).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_type, content_type::HANDSHAKE);
        assert_eq!(records[0].fragment, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn leaves_partial_record_buffered() {
        let full = encode(content_type::APPLICATION_DATA, b"0123456789");
        let mut buf = full[..full.len() - 3].to_vec();
        let records = drain_records(&mut buf).unwrap();
        assert!(records.is_empty());
        assert_eq!(buf.len(), full.len() - 3);
    }

    #[test]
    fn drains_two_back_to_back_records() {
        let mut buf = encode(content_type::HANDSHAKE, b"first");
        buf.extend_from_slice(&encode(content_type::HANDSHAKE, b"second"));
        let records = drain_records(&mut buf).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fragment, b"first");
        assert_eq!(records[1].fragment, b"second");
    }

    #[test]
    fn oversized_length_is_a_framing_error() {
        let mut buf = vec![content_type::HANDSHAKE, 0x03, 0x03, 0xFF, 0xFF];
        buf.extend_from_slice(&[0u8; 10]);
        assert!(drain_records(&mut buf).is_err());
    }
}
