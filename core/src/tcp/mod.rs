//! The TCP connection state machine: a passive-open-only FSM
//! driven by incoming segments, producing the segments the core sends
//! back. Out-of-order segments are discarded rather than queued — the
//! core expects to serve well-behaved clients over a TUN/loopback path,
//! not to recover from real WAN loss and reordering.

pub mod connection;
pub mod header;
pub mod table;

use std::net::Ipv4Addr;

use rand::Rng;

use self::connection::{Connection, FlowKey, TcpState};
use self::header::{flags, TcpHeader};
use self::table::ConnectionTable;

/// An outgoing segment, described in terms a caller can hand straight to
/// `header::build` (with this flow's IP addresses) to get wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Segment {
    fn control(seq: u32, ack: u32, flags: u8) -> Self {
        Segment { seq, ack, flags, payload: Vec::new() }
    }
}

/// What happened as a result of processing one incoming segment.
pub enum Event {
    /// A new connection was admitted (SYN accepted).
    Opened,
    /// The segment didn't belong to a valid flow, or the table is full:
    /// the caller sends the paired RST segment and moves on.
    Reset,
    /// In-order application payload arrived on an established connection.
    DataReceived(Vec<u8>),
    /// The flow finished closing and was removed from the table.
    Closed,
    /// Nothing actionable (duplicate ACK, retransmitted segment, etc).
    None,
}

/// Processes one incoming TCP segment against `table`, mutating the
/// matching connection (or creating/removing it) and reporting what
/// happened plus the segments (if any) to send back immediately, in order.
pub fn handle_segment(
    table: &ConnectionTable,
    local_addr: Ipv4Addr,
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    header: &TcpHeader,
    payload: &[u8],
) -> (Event, Vec<Segment>) {
    let key = FlowKey {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
    };

    let Some(entry) = table.get(&key) else {
        return handle_unknown_flow(table, key, header);
    };

    let mut conn = entry.lock().unwrap();

    if header.has_flag(flags::RST) {
        drop(conn);
        table.remove(&key);
        return (Event::Closed, Vec::new());
    }

    match conn.state {
        TcpState::SynReceived => handle_syn_received(&mut conn, header),
        TcpState::Established => handle_established(&mut conn, header, payload),
        TcpState::FinWait1 => handle_fin_wait1(&mut conn, header),
        TcpState::FinWait2 => handle_fin_wait2(&mut conn, header),
        TcpState::CloseWait => (Event::None, Vec::new()),
        TcpState::Closing => handle_closing(&mut conn, header),
        TcpState::LastAck => handle_last_ack(&mut conn, header, &key, table),
        TcpState::TimeWait => {
            drop(conn);
            table.remove(&key);
            (Event::Closed, Vec::new())
        }
    }
}

fn handle_unknown_flow(table: &ConnectionTable, key: FlowKey, header: &TcpHeader) -> (Event, Vec<Segment>) {
    if header.has_flag(flags::SYN) && !header.has_flag(flags::ACK) {
        let server_isn: u32 = rand::thread_rng().gen();
        let connection = Connection::new(key, header.seq, server_isn);
        let client_next_seq = connection.client_next_seq;
        match table.insert(connection) {
            Ok(_) => {
                let syn_ack = Segment::control(server_isn, client_next_seq, flags::SYN | flags::ACK);
                (Event::Opened, vec![syn_ack])
            }
            // Table full: the connection never existed, so respond the
            // same way an unknown flow would.
            Err(_) => (Event::Reset, reset_for(header).into_iter().collect()),
        }
    } else if header.has_flag(flags::RST) {
        (Event::None, Vec::new())
    } else {
        (Event::Reset, reset_for(header).into_iter().collect())
    }
}

fn reset_for(header: &TcpHeader) -> Option<Segment> {
    let seq = if header.has_flag(flags::ACK) { header.ack } else { 0 };
    let ack = header.seq.wrapping_add(payload_plus_control_len(header));
    Some(Segment::control(seq, ack, flags::RST | flags::ACK))
}

fn payload_plus_control_len(header: &TcpHeader) -> u32 {
    let mut len = 0u32;
    if header.has_flag(flags::SYN) {
        len += 1;
    }
    if header.has_flag(flags::FIN) {
        len += 1;
    }
    len
}

fn handle_syn_received(conn: &mut Connection, header: &TcpHeader) -> (Event, Vec<Segment>) {
    if !header.has_flag(flags::ACK) {
        return (Event::None, Vec::new());
    }
    if header.ack != conn.server_next_seq {
        return (Event::Reset, reset_for(header).into_iter().collect());
    }
    conn.state = TcpState::Established;
    (Event::Opened, Vec::new())
}

fn handle_established(conn: &mut Connection, header: &TcpHeader, payload: &[u8]) -> (Event, Vec<Segment>) {
    if header.seq != conn.client_next_seq {
        // Out of order (or a retransmit already accounted for): drop it.
        return (Event::None, Vec::new());
    }

    if header.has_flag(flags::FIN) {
        // Two separate segments: a bare ACK of the client's FIN first, then
        // the server's own FIN+ACK starting the passive-close half. The FSM
        // has no transition out of CloseWait, so Established+FIN goes
        // straight to LastAck once the server's FIN is queued.
        conn.advance_received(payload.len());
        conn.client_next_seq = conn.client_next_seq.wrapping_add(1); // FIN consumes a sequence number
        let ack = Segment::control(conn.server_next_seq, conn.client_next_seq, flags::ACK);
        let fin_ack = Segment::control(conn.server_next_seq, conn.client_next_seq, flags::FIN | flags::ACK);
        conn.server_next_seq = conn.server_next_seq.wrapping_add(1);
        conn.state = TcpState::LastAck;
        return (Event::DataReceived(payload.to_vec()), vec![ack, fin_ack]);
    }

    if payload.is_empty() {
        // Pure ACK. A prior revision of this logic set server_next_seq to
        // whatever the client's ACK number claimed, even past what the
        // server had actually sent — fixed here to only ever accept an ACK
        // that doesn't claim more was sent than it was.
        if header.has_flag(flags::ACK) && !ack_claims_beyond_sent(header.ack, conn.server_next_seq) {
            conn.server_next_seq = header.ack;
        }
        return (Event::None, Vec::new());
    }

    // Immediately ACK in-order data: ack = client_next_seq + len,
    // seq = server_next_seq as it stood before this ACK. The payload is
    // delivered upward in the same event; client_next_seq then advances.
    let ack = Segment::control(conn.server_next_seq, conn.client_next_seq.wrapping_add(payload.len() as u32), flags::ACK);
    conn.advance_received(payload.len());
    (Event::DataReceived(payload.to_vec()), vec![ack])
}

/// True if `ack` is strictly ahead of `current` in sequence space (mod
/// 2^32) — i.e. it acknowledges bytes the server never sent.
fn ack_claims_beyond_sent(ack: u32, current: u32) -> bool {
    ack != current && ack.wrapping_sub(current) < (1 << 31)
}

fn handle_fin_wait1(conn: &mut Connection, header: &TcpHeader) -> (Event, Vec<Segment>) {
    let our_fin_acked = header.has_flag(flags::ACK) && header.ack == conn.server_next_seq;
    let client_fin = header.has_flag(flags::FIN);

    match (our_fin_acked, client_fin) {
        (true, true) => {
            conn.client_next_seq = conn.client_next_seq.wrapping_add(1);
            conn.state = TcpState::TimeWait;
            let ack = Segment::control(conn.server_next_seq, conn.client_next_seq, flags::ACK);
            (Event::None, vec![ack])
        }
        (true, false) => {
            conn.state = TcpState::FinWait2;
            (Event::None, Vec::new())
        }
        (false, true) => {
            conn.client_next_seq = conn.client_next_seq.wrapping_add(1);
            conn.state = TcpState::Closing;
            let ack = Segment::control(conn.server_next_seq, conn.client_next_seq, flags::ACK);
            (Event::None, vec![ack])
        }
        (false, false) => (Event::None, Vec::new()),
    }
}

fn handle_fin_wait2(conn: &mut Connection, header: &TcpHeader) -> (Event, Vec<Segment>) {
    if !header.has_flag(flags::FIN) {
        return (Event::None, Vec::new());
    }
    conn.client_next_seq = conn.client_next_seq.wrapping_add(1);
    conn.state = TcpState::TimeWait;
    let ack = Segment::control(conn.server_next_seq, conn.client_next_seq, flags::ACK);
    (Event::None, vec![ack])
}

fn handle_closing(conn: &mut Connection, header: &TcpHeader) -> (Event, Vec<Segment>) {
    if header.has_flag(flags::ACK) && header.ack == conn.server_next_seq {
        conn.state = TcpState::TimeWait;
    }
    (Event::None, Vec::new())
}

fn handle_last_ack(conn: &mut Connection, header: &TcpHeader, key: &FlowKey, table: &ConnectionTable) -> (Event, Vec<Segment>) {
    if header.has_flag(flags::ACK) && header.ack == conn.server_next_seq {
        drop_and_remove(conn, key, table);
        return (Event::Closed, Vec::new());
    }
    (Event::None, Vec::new())
}

fn drop_and_remove(_conn: &mut Connection, key: &FlowKey, table: &ConnectionTable) {
    table.remove(key);
}

/// Called by the application layer once it has nothing further to send on
/// an established (or already client-half-closed) connection: emits this
/// server's FIN and advances to the appropriate closing state.
pub fn close_connection(conn: &mut Connection) -> Segment {
    let fin = Segment::control(conn.server_next_seq, conn.client_next_seq, flags::FIN | flags::ACK);
    conn.server_next_seq = conn.server_next_seq.wrapping_add(1);
    conn.state = match conn.state {
        TcpState::CloseWait => TcpState::LastAck,
        _ => TcpState::FinWait1,
    };
    fin
}

/// Called by the application layer to send a data segment (PSH+ACK) on an
/// established connection, advancing `server_next_seq` by the payload length.
pub fn send_data(conn: &mut Connection, payload: Vec<u8>) -> Segment {
    let seq = conn.server_next_seq;
    conn.server_next_seq = conn.server_next_seq.wrapping_add(payload.len() as u32);
    Segment {
        seq,
        ack: conn.client_next_seq,
        flags: flags::PSH | flags::ACK,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (Ipv4Addr, u16, Ipv4Addr, u16) {
        (Ipv4Addr::new(10, 0, 0, 1), 443, Ipv4Addr::new(10, 0, 0, 2), 50000)
    }

    #[test]
    fn syn_opens_connection_and_returns_syn_ack() {
        let table = ConnectionTable::new(table::DEFAULT_MAX_CONNECTIONS);
        let (local, lport, remote, rport) = addrs();
        let syn = TcpHeader {
            src_port: rport,
            dst_port: lport,
            seq: 1000,
            ack: 0,
            data_offset: 5,
            flags: flags::SYN,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (event, segments) = handle_segment(&table, local, lport, remote, rport, &syn, &[]);
        assert!(matches!(event, Event::Opened));
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert_eq!(segment.flags, flags::SYN | flags::ACK);
        assert_eq!(segment.ack, 1001);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_non_syn_flow_is_reset() {
        let table = ConnectionTable::new(table::DEFAULT_MAX_CONNECTIONS);
        let (local, lport, remote, rport) = addrs();
        let ack = TcpHeader {
            src_port: rport,
            dst_port: lport,
            seq: 50,
            ack: 10,
            data_offset: 5,
            flags: flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (event, segments) = handle_segment(&table, local, lport, remote, rport, &ack, &[]);
        assert!(matches!(event, Event::Reset));
        assert_eq!(segments.len(), 1);
        assert!(segments[0].flags & flags::RST != 0);
    }

    #[test]
    fn full_three_way_handshake_then_data() {
        let table = ConnectionTable::new(table::DEFAULT_MAX_CONNECTIONS);
        let (local, lport, remote, rport) = addrs();
        let syn = TcpHeader {
            src_port: rport,
            dst_port: lport,
            seq: 1000,
            ack: 0,
            data_offset: 5,
            flags: flags::SYN,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (_, syn_ack) = handle_segment(&table, local, lport, remote, rport, &syn, &[]);
        let syn_ack = syn_ack.into_iter().next().unwrap();

        let final_ack = TcpHeader {
            src_port: rport,
            dst_port: lport,
            seq: 1001,
            ack: syn_ack.seq + 1,
            data_offset: 5,
            flags: flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (event, segments) = handle_segment(&table, local, lport, remote, rport, &final_ack, &[]);
        assert!(matches!(event, Event::Opened));
        assert!(segments.is_empty());

        let data = TcpHeader {
            src_port: rport,
            dst_port: lport,
            seq: 1001,
            ack: syn_ack.seq + 1,
            data_offset: 5,
            flags: flags::PSH | flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (event, segments) = handle_segment(&table, local, lport, remote, rport, &data, b"hi");
        match event {
            Event::DataReceived(bytes) => assert_eq!(bytes, b"hi"),
            _ => panic!("expected DataReceived"),
        }
        assert_eq!(segments.len(), 1, "in-order data must be ACKed immediately");
        let ack = &segments[0];
        assert_eq!(ack.flags, flags::ACK);
        assert_eq!(ack.seq, syn_ack.seq + 1);
        assert_eq!(ack.ack, data.seq + 2);
    }

    #[test]
    fn pure_ack_never_advances_server_next_seq_past_sent_value() {
        let table = ConnectionTable::new(table::DEFAULT_MAX_CONNECTIONS);
        let key = FlowKey {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 443,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 50000,
        };
        let mut connection = Connection::new(key, 999, 500);
        connection.state = TcpState::Established;
        table.insert(connection).unwrap();

        let bogus_ack = TcpHeader {
            src_port: 50000,
            dst_port: 443,
            seq: 1000,
            ack: 99999, // far beyond anything actually sent
            data_offset: 5,
            flags: flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        handle_segment(
            &table,
            Ipv4Addr::new(10, 0, 0, 1),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            50000,
            &bogus_ack,
            &[],
        );
        let entry = table.get(&key).unwrap();
        let conn = entry.lock().unwrap();
        assert_eq!(conn.server_next_seq, 501);
    }

    #[test]
    fn synreceived_with_wrong_ack_is_reset_not_silently_dropped() {
        let table = ConnectionTable::new(table::DEFAULT_MAX_CONNECTIONS);
        let key = FlowKey {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 443,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 50000,
        };
        let mut connection = Connection::new(key, 1000, 500);
        connection.state = TcpState::SynReceived;
        table.insert(connection).unwrap();

        let wrong_ack = TcpHeader {
            src_port: 50000,
            dst_port: 443,
            seq: 1001,
            ack: 12345, // not server_isn + 1 (501)
            data_offset: 5,
            flags: flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (event, segments) = handle_segment(
            &table,
            Ipv4Addr::new(10, 0, 0, 1),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            50000,
            &wrong_ack,
            &[],
        );
        assert!(matches!(event, Event::Reset));
        assert_eq!(segments.len(), 1);
        let reset = &segments[0];
        assert_eq!(reset.flags, flags::RST | flags::ACK);
        assert_eq!(reset.seq, 12345);
    }

    #[test]
    fn reset_for_non_ack_segment_uses_seq_zero() {
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 777,
            ack: 0xDEAD, // garbage: must be ignored since ACK isn't set
            data_offset: 5,
            flags: flags::FIN,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let reset = reset_for(&header).unwrap();
        assert_eq!(reset.seq, 0);
        assert_eq!(reset.ack, 778); // incoming seq + 1 for the FIN
    }

    #[test]
    fn client_fin_on_established_connection_tears_the_flow_down() {
        let table = ConnectionTable::new(table::DEFAULT_MAX_CONNECTIONS);
        let key = FlowKey {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 443,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 50000,
        };
        let mut connection = Connection::new(key, 1000, 500);
        connection.state = TcpState::Established;
        table.insert(connection).unwrap();

        let fin = TcpHeader {
            src_port: 50000,
            dst_port: 443,
            seq: 1001,
            ack: 501,
            data_offset: 5,
            flags: flags::FIN | flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (_, segments) = handle_segment(
            &table,
            Ipv4Addr::new(10, 0, 0, 1),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            50000,
            &fin,
            &[],
        );
        assert_eq!(segments.len(), 2, "client FIN must get a bare ACK, then a separate FIN+ACK");
        let ack = &segments[0];
        assert_eq!(ack.flags, flags::ACK);
        assert_eq!(ack.seq, 501);
        assert_eq!(ack.ack, 1002);
        let fin_ack = &segments[1];
        assert_eq!(fin_ack.flags, flags::FIN | flags::ACK);
        assert_eq!(fin_ack.seq, 501);
        assert_eq!(fin_ack.ack, 1002);
        {
            let entry = table.get(&key).unwrap();
            assert_eq!(entry.lock().unwrap().state, TcpState::LastAck);
        }

        let final_ack = TcpHeader {
            src_port: 50000,
            dst_port: 443,
            seq: 1002,
            ack: 502, // acks the server's FIN at seq 501
            data_offset: 5,
            flags: flags::ACK,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: Vec::new(),
        };
        let (event, _) = handle_segment(
            &table,
            Ipv4Addr::new(10, 0, 0, 1),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            50000,
            &final_ack,
            &[],
        );
        assert!(matches!(event, Event::Closed));
        assert!(table.get(&key).is_none(), "connection table must not contain the 4-tuple after teardown");
    }
}
