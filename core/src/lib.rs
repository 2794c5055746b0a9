//! `rawhttpd_core`: a userspace TCP/IP + TLS 1.2 + HTTP/1.1 stack (see the
//! project README for the layering this implements). This crate is the
//! vertical slice — IPv4/TCP framing and connection-state management, the
//! TLS 1.2 server handshake and AEAD record layer, and the glue dispatcher
//! that hands decrypted bytes to an HTTP/1.1 responder. Device creation,
//! CLI parsing, and PEM loading plumbing live in the `rawhttpd` binary
//! crate; this crate only consumes the abstractions they produce
//! (`endpoint::RawIpWriter`, `certificate::Certificate`).

pub mod certificate;
pub mod checksum;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod icmp;
pub mod ipv4;
pub mod pause;
pub mod tcp;
pub mod tls;

use std::net::Ipv4Addr;

use ring::rand::SystemRandom;
use tracing::{debug, info, warn};

use crate::certificate::Certificate;
use crate::dispatch::{ApplicationHandler, Http11Handler};
use crate::endpoint::PacketEndpoint;
use crate::error::CoreResult;
use crate::ipv4::Routed;
use crate::pause::{Layer, LayerPause};
use crate::tcp::connection::FlowKey;
use crate::tcp::table::ConnectionTable;
use crate::tcp::{header as tcp_header, Event};
use crate::tls::handshake::TlsState;

/// Owns the server's global mutable state: the connection table, the loaded
/// certificate, and the pause hook. Handlers borrow from this rather than
/// reaching for statics.
pub struct Server {
    pub table: ConnectionTable,
    pub certificate: Certificate,
    pub handler: Box<dyn ApplicationHandler + Send + Sync>,
    pub pause: Box<dyn LayerPause>,
    rng: SystemRandom,
    served_ports: Vec<u16>,
}

impl Server {
    pub fn new(certificate: Certificate, max_connections: usize, served_ports: Vec<u16>) -> Self {
        Server {
            table: ConnectionTable::new(max_connections),
            certificate,
            handler: Box::new(Http11Handler),
            pause: pause::from_env(),
            rng: SystemRandom::new(),
            served_ports,
        }
    }

    fn is_served_port(&self, port: u16) -> bool {
        self.served_ports.contains(&port)
    }

    /// Exposes the shared cryptographic RNG — one crypto RNG for ECDHE keys,
    /// server_random, and signature blinding — so a stream-mode
    /// caller driving TLS directly — without going through `handle_payload`
    /// — can thread it into `tls::ingest` itself.
    pub fn rng(&self) -> &SystemRandom {
        &self.rng
    }

    /// Processes one received IPv4 datagram in packet-endpoint mode: routes
    /// it to ICMP or TCP, drives the TCP state machine, and — for payload
    /// that lands on an established flow — feeds it through TLS (port 443)
    /// or straight to HTTP (port 80). Writes every reply datagram through
    /// `endpoint` before returning.
    pub fn handle_datagram(&self, endpoint: &PacketEndpoint, datagram: &[u8]) -> CoreResult<()> {
        self.pause.maybe_pause(Layer::Ip);
        match ipv4::dispatch(datagram)? {
            Routed::Icmp(header, payload) => {
                self.pause.maybe_pause(Layer::Tcp);
                if let Some(reply) = icmp::handle(&header, payload)? {
                    endpoint.writer().write_datagram(&reply)?;
                }
                Ok(())
            }
            Routed::Tcp(header, payload) => {
                self.pause.maybe_pause(Layer::Tcp);
                self.handle_tcp(endpoint, &header, payload)
            }
            Routed::Ignored(_) => Ok(()),
        }
    }

    fn handle_tcp(&self, endpoint: &PacketEndpoint, ip_header: &ipv4::Ipv4Header, segment_bytes: &[u8]) -> CoreResult<()> {
        let (tcp_hdr, payload) = tcp_header::parse(segment_bytes)?;

        if !self.table.get(&key_for(ip_header.dst, tcp_hdr.dst_port, ip_header.src, tcp_hdr.src_port)).is_some()
            && tcp_hdr.has_flag(tcp_header::flags::SYN)
            && !tcp_hdr.has_flag(tcp_header::flags::ACK)
            && !self.is_served_port(tcp_hdr.dst_port)
        {
            // Not one of our ports: ignore rather than admit a connection
            // nothing upstream of the TCP layer would ever service.
            return Ok(());
        }

        let (event, segments) = tcp::handle_segment(
            &self.table,
            ip_header.dst,
            tcp_hdr.dst_port,
            ip_header.src,
            tcp_hdr.src_port,
            &tcp_hdr,
            payload,
        );

        let key = key_for(ip_header.dst, tcp_hdr.dst_port, ip_header.src, tcp_hdr.src_port);
        for segment in &segments {
            endpoint.send_segment(&key, segment)?;
        }

        match event {
            Event::Opened if tcp_hdr.has_flag(tcp_header::flags::SYN) && !tcp_hdr.has_flag(tcp_header::flags::ACK) => {
                // Fresh SYN admitted: seed tls_state iff this is the TLS port.
                let key = key_for(ip_header.dst, tcp_hdr.dst_port, ip_header.src, tcp_hdr.src_port);
                if tcp_hdr.dst_port == 443 {
                    if let Some(entry) = self.table.get(&key) {
                        let mut conn = entry.lock().unwrap();
                        let server_random = fresh_server_random(&self.rng);
                        conn.tls = Some(TlsState::new(server_random));
                    }
                }
                info!(port = tcp_hdr.dst_port, "admitted new connection");
                Ok(())
            }
            Event::DataReceived(payload) => {
                let key = key_for(ip_header.dst, tcp_hdr.dst_port, ip_header.src, tcp_hdr.src_port);
                self.handle_payload(endpoint, &key, tcp_hdr.dst_port, &payload)
            }
            Event::Closed => {
                debug!("connection closed");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_payload(&self, endpoint: &PacketEndpoint, key: &FlowKey, local_port: u16, payload: &[u8]) -> CoreResult<()> {
        let Some(entry) = self.table.get(key) else {
            return Ok(());
        };
        let mut conn = entry.lock().unwrap();

        if local_port == 80 {
            self.pause.maybe_pause(Layer::Http);
            let response = http::handle(payload);
            endpoint.send_tls_record(&mut conn, &response)?;
            let fin = tcp::close_connection(&mut conn);
            drop(conn);
            return endpoint.send_segment(key, &fin);
        }

        self.pause.maybe_pause(Layer::Tls);
        let Some(mut tls) = conn.tls.take() else {
            warn!("ApplicationData on port 443 flow with no TLS state; dropping");
            return Ok(());
        };
        let outcome = tls::ingest(&mut tls, &mut conn.receive_buffer, &self.certificate, &self.rng, payload);

        if outcome.fatal {
            // Best-effort: get the alert onto the wire before tearing the
            // flow down. A write failure here doesn't change the outcome —
            // the connection is going away either way. Nothing to send for
            // a fatal condition triggered by the peer's own Alert record.
            if !outcome.to_send.is_empty() {
                let _ = endpoint.send_tls_record(&mut conn, &outcome.to_send);
            }
            conn.tls = Some(tls);
            drop(conn);
            warn!("fatal TLS error; tearing down connection");
            self.table.remove(key);
            return Ok(());
        }

        if !outcome.to_send.is_empty() {
            endpoint.send_tls_record(&mut conn, &outcome.to_send)?;
        }

        self.pause.maybe_pause(Layer::Http);
        for app_data in outcome.application_data {
            if let Some(reply) = dispatch::dispatch(self.handler.as_ref(), &mut tls, &app_data) {
                endpoint.send_tls_record(&mut conn, &reply)?;
            }
        }

        conn.tls = Some(tls);
        Ok(())
    }
}

fn key_for(local_addr: Ipv4Addr, local_port: u16, remote_addr: Ipv4Addr, remote_port: u16) -> FlowKey {
    FlowKey { local_addr, local_port, remote_addr, remote_port }
}

fn fresh_server_random(rng: &SystemRandom) -> [u8; 32] {
    let mut out = [0u8; 32];
    // server_random shares the same crypto RNG as ECDHE keys and signature
    // blinding rather than a non-cryptographic generator.
    ring::rand::SecureRandom::fill(rng, &mut out).expect("system RNG failure");
    out
}
