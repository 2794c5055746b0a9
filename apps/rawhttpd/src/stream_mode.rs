//! The stream-endpoint driver: each accepted stream-endpoint connection
//! runs one dedicated handler thread. The kernel has already
//! done the TCP handshake by the time `accept` returns, so this loop only
//! ever drives TLS — there is no IPv4/TCP framing here at all, unlike the
//! TUN-mode driver in `main.rs`.

use std::io::Read;
use std::net::{Ipv4Addr, IpAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use rawhttpd_core::dispatch;
use rawhttpd_core::endpoint::StreamEndpoint;
use rawhttpd_core::tls::handshake::TlsState;
use rawhttpd_core::tls::session;
use rawhttpd_core::Server;
use tracing::{info, warn};

const READ_BUFFER_SIZE: usize = 16384;

pub fn serve(server: Arc<Server>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).context("failed to bind TCP listener")?;
    info!(port, "listening for TLS connections");

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let server = Arc::clone(&server);
        thread::spawn(move || {
            let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_else(|_| "unknown".to_string());
            if let Err(err) = handle_connection(&server, stream) {
                warn!(peer, %err, "connection terminated");
            }
        });
    }
    Ok(())
}

fn handle_connection(server: &Server, stream: TcpStream) -> Result<()> {
    let peer_addr = match stream.peer_addr()?.ip() {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let writer = stream.try_clone().context("failed to clone the TCP stream for the writer side")?;
    let mut endpoint = StreamEndpoint::new(writer, peer_addr);

    let mut reader = stream;
    let mut receive_buffer = Vec::new();
    let mut tls = TlsState::new(fresh_server_random(server.rng()));
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        let outcome = session::ingest(&mut tls, &mut receive_buffer, &server.certificate, server.rng(), &buf[..n]);
        if !outcome.to_send.is_empty() {
            endpoint.send_tls_record(&outcome.to_send)?;
        }
        if outcome.fatal {
            break;
        }
        for app_data in outcome.application_data {
            if let Some(reply) = dispatch::dispatch(server.handler.as_ref(), &mut tls, &app_data) {
                endpoint.send_tls_record(&reply)?;
            }
        }
    }
    Ok(())
}

fn fresh_server_random(rng: &ring::rand::SystemRandom) -> [u8; 32] {
    let mut out = [0u8; 32];
    // Same crypto RNG used for ECDHE keys and signature blinding, rather
    // than a non-cryptographic generator.
    ring::rand::SecureRandom::fill(rng, &mut out).expect("system RNG failure");
    out
}
