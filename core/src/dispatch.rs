//! The application dispatcher: routes decrypted ApplicationData
//! to an `ApplicationHandler` and wraps the reply back up as one or more
//! ApplicationData records. What runs behind the trait is the HTTP/1.1
//! responder in `crate::http`, but the seam exists so a different
//! application layer could be dropped in without touching the TLS plumbing.

use crate::http;
use crate::tls::handshake::{HandshakeState, TlsState};
use crate::tls::session;

/// Given plaintext bytes delivered over an established connection, produce
/// the plaintext bytes to send back. The core's only implementation is the
/// fixed HTTP/1.1 responder.
pub trait ApplicationHandler {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

pub struct Http11Handler;

impl ApplicationHandler for Http11Handler {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        http::handle(request)
    }
}

/// Runs one piece of decrypted ApplicationData through `handler` and seals
/// the reply as a single ApplicationData record (the reply bodies this core
/// produces are always far under the 2^14 fragment limit, so no splitting
/// across multiple records is needed). Returns `None` if the handshake
/// hasn't completed yet — the TUN-mode caller must not reach this with an
/// incomplete handshake; this makes that precondition explicit rather than
/// sealing garbage with a not-yet-derived key.
pub fn dispatch(handler: &dyn ApplicationHandler, tls: &mut TlsState, plaintext: &[u8]) -> Option<Vec<u8>> {
    if tls.state != HandshakeState::Complete {
        return None;
    }
    let response = handler.handle(plaintext);
    Some(session::seal_application_data(tls, &response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_tls() -> TlsState {
        let mut tls = TlsState::new([0u8; 32]);
        tls.state = HandshakeState::Complete;
        tls.master_secret = Some([0u8; 48]);
        tls.key_block = Some(crate::tls::handshake::KeyBlockMaterial {
            client_write_key: [1u8; 16],
            server_write_key: [2u8; 16],
            client_write_iv: [3u8; 4],
            server_write_iv: [4u8; 4],
        });
        tls
    }

    #[test]
    fn refuses_to_dispatch_before_handshake_complete() {
        let mut tls = TlsState::new([0u8; 32]);
        assert!(dispatch(&Http11Handler, &mut tls, b"GET / HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn dispatches_and_seals_a_record_once_complete() {
        let mut tls = completed_tls();
        let record = dispatch(&Http11Handler, &mut tls, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(record[0], crate::tls::record::content_type::APPLICATION_DATA);
        assert_eq!(tls.server_seq, 1);
    }
}
