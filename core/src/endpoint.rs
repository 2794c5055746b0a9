//! The dual endpoint abstraction: a served
//! connection is backed either by raw IPv4 datagrams synthesized over a
//! TUN-style device (`PacketEndpoint`), or by an already-established host
//! TCP stream (`StreamEndpoint`). Both expose the same job to the rest of
//! the core — hand a TLS record's wire bytes to the peer — so callers above
//! this module never branch on which backend they're talking to.

use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::CoreResult;
use crate::ipv4::Ipv4Header;
use crate::tcp::connection::FlowKey;
use crate::tcp::{self, header as tcp_header};

/// Writes raw IPv4 datagrams out to whatever carries them on a packet-mode
/// deployment — a TUN device in production, an in-memory channel in tests.
/// Reading is the caller's job (the single reader thread owns the TUN
/// device); this trait only covers the write side the core needs.
pub trait RawIpWriter: Send + Sync {
    fn write_datagram(&self, datagram: &[u8]) -> CoreResult<()>;
}

/// A TUN-style backend: every send synthesizes one TCP segment (PSH|ACK)
/// wrapped in an IPv4 datagram, and advances the connection's
/// `server_next_seq` by the TLS record's length.
pub struct PacketEndpoint {
    writer: Arc<dyn RawIpWriter>,
}

const DEFAULT_WINDOW: u16 = 65535;

impl PacketEndpoint {
    pub fn new(writer: Arc<dyn RawIpWriter>) -> Self {
        PacketEndpoint { writer }
    }

    /// Exposes the underlying writer for call sites (like the ICMP
    /// responder) that send a datagram without going through a
    /// `Connection`.
    pub fn writer(&self) -> Arc<dyn RawIpWriter> {
        self.writer.clone()
    }

    /// Sends `record_bytes` as this flow's next data segment, returning the
    /// segment actually sent's sequence number (mostly useful to tests).
    pub fn send_tls_record(&self, conn: &mut crate::tcp::connection::Connection, record_bytes: &[u8]) -> CoreResult<u32> {
        let segment = tcp::send_data(conn, record_bytes.to_vec());
        let seq = segment.seq;
        self.send_segment(&conn.key, &segment)?;
        Ok(seq)
    }

    /// Writes a bare control/data segment (used for SYN-ACK, ACK, RST, FIN —
    /// anything the TCP state machine itself produces, not just TLS
    /// records).
    pub fn send_segment(&self, key: &FlowKey, segment: &tcp::Segment) -> CoreResult<()> {
        let tcp_bytes = tcp_header::build(
            key.local_addr,
            key.remote_addr,
            key.local_port,
            key.remote_port,
            segment.seq,
            segment.ack,
            segment.flags,
            DEFAULT_WINDOW,
            &segment.payload,
        );
        let datagram = Ipv4Header::build(key.local_addr, key.remote_addr, crate::ipv4::PROTO_TCP, &tcp_bytes);
        self.writer.write_datagram(&datagram)
    }
}

/// Some hosts prefix packets read from / written to a TUN device with a
/// 4-byte protocol-family header. `strip_af_inet_prefix` undoes that on
/// read; the core never re-adds it on write — strip if present, omit on
/// write.
pub const AF_INET_PREFIX: [u8; 4] = [0x00, 0x00, 0x00, 0x02];

pub fn strip_af_inet_prefix(buf: &[u8]) -> &[u8] {
    if buf.len() >= 4 && buf[0..4] == AF_INET_PREFIX {
        &buf[4..]
    } else {
        buf
    }
}

/// A host-TCP backend: the kernel has already handshaken TCP, so this is
/// TLS-only — every send writes the record bytes straight to the stream.
pub struct StreamEndpoint<S> {
    stream: S,
    pub peer_addr: Ipv4Addr,
}

impl<S: Write> StreamEndpoint<S> {
    pub fn new(stream: S, peer_addr: Ipv4Addr) -> Self {
        StreamEndpoint { stream, peer_addr }
    }

    pub fn send_tls_record(&mut self, record_bytes: &[u8]) -> CoreResult<()> {
        self.stream.write_all(record_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn strips_af_inet_prefix_when_present() {
        let mut datagram = AF_INET_PREFIX.to_vec();
        datagram.extend_from_slice(&[0x45, 0x00]);
        assert_eq!(strip_af_inet_prefix(&datagram), &[0x45, 0x00]);
    }

    #[test]
    fn leaves_unprefixed_datagram_untouched() {
        let datagram = [0x45, 0x00, 0x00, 0x14];
        assert_eq!(strip_af_inet_prefix(&datagram), &datagram);
    }

    struct RecordingWriter {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl RawIpWriter for RecordingWriter {
        fn write_datagram(&self, datagram: &[u8]) -> CoreResult<()> {
            self.sent.lock().unwrap().push(datagram.to_vec());
            Ok(())
        }
    }

    #[test]
    fn send_tls_record_advances_server_next_seq_by_record_length() {
        use crate::tcp::connection::{Connection, TcpState};

        let key = FlowKey {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 443,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 50000,
        };
        let mut conn = Connection::new(key, 1000, 500);
        conn.state = TcpState::Established;

        let writer = Arc::new(RecordingWriter { sent: Mutex::new(Vec::new()) });
        let endpoint = PacketEndpoint::new(writer.clone());
        let record = vec![0u8; 37];
        let seq = endpoint.send_tls_record(&mut conn, &record).unwrap();

        assert_eq!(seq, 501);
        assert_eq!(conn.server_next_seq, 501 + 37);
        assert_eq!(writer.sent.lock().unwrap().len(), 1);
    }
}
