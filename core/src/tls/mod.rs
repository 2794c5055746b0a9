//! TLS 1.2 server implementation: record framing, handshake state machine,
//! key schedule/AEAD, and alerts.

pub mod alert;
pub mod crypto;
pub mod handshake;
pub mod record;
pub mod session;

pub use handshake::{HandshakeState, TlsState};
pub use session::{ingest, seal_application_data, IngestOutcome};
