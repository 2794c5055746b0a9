//! Per-flow TCP connection state.

use std::net::Ipv4Addr;

use crate::tls::TlsState;

/// A flow's TCP state. The core only ever performs passive
/// opens; there is no `SynSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Identifies a flow by its four-tuple, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

/// One TCP connection's full state: sequence-number bookkeeping, the
/// reassembly buffer that record framing reads from, and — once the flow
/// starts a TLS handshake — the handshake/key-schedule state.
pub struct Connection {
    pub key: FlowKey,
    pub state: TcpState,
    pub client_isn: u32,
    pub server_isn: u32,
    pub client_next_seq: u32,
    pub server_next_seq: u32,
    /// Bytes received in order but not yet consumed by the TLS record
    /// layer. Out-of-order segments are discarded, not queued here.
    pub receive_buffer: Vec<u8>,
    pub tls: Option<TlsState>,
}

impl Connection {
    pub fn new(key: FlowKey, client_isn: u32, server_isn: u32) -> Self {
        Connection {
            key,
            state: TcpState::SynReceived,
            client_isn,
            server_isn,
            client_next_seq: client_isn.wrapping_add(1),
            server_next_seq: server_isn.wrapping_add(1),
            receive_buffer: Vec::new(),
            tls: None,
        }
    }

    /// Advances `client_next_seq` past newly-received in-order payload
    /// bytes. Does not touch `receive_buffer`: that buffer is the TLS record
    /// layer's reassembly area, filled by `tls::session::ingest`
    /// itself once the payload is handed upward — appending it here too
    /// would double it up.
    pub fn advance_received(&mut self, payload_len: usize) {
        self.client_next_seq = self.client_next_seq.wrapping_add(payload_len as u32);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TcpState::TimeWait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 443,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 50000,
        }
    }

    #[test]
    fn new_connection_starts_synreceived_with_isn_plus_one() {
        let c = Connection::new(key(), 100, 500);
        assert_eq!(c.state, TcpState::SynReceived);
        assert_eq!(c.client_next_seq, 101);
        assert_eq!(c.server_next_seq, 501);
    }

    #[test]
    fn advance_received_moves_client_next_seq_without_touching_receive_buffer() {
        let mut c = Connection::new(key(), 100, 500);
        c.advance_received(5);
        assert_eq!(c.client_next_seq, 101 + 5);
        assert!(c.receive_buffer.is_empty());
    }
}
