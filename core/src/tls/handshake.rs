//! TLS 1.2 server handshake: message parsing/encoding and the state machine
//! that drives ClientHello through Finished. ECDHE-RSA with
//! P-256 and AES-128-GCM is the only cipher suite this core ever selects.

use ring::agreement::EphemeralPrivateKey;
use ring::digest::{self, SHA256};
use ring::rand::SystemRandom;

use crate::certificate::Certificate;
use crate::error::{CoreError, CoreResult};
use crate::tls::crypto::{self, KeyBlock};

pub const CIPHER_SUITE_ECDHE_RSA_AES128_GCM_SHA256: u16 = 0xC02F;
const NAMED_CURVE_SECP256R1: u16 = 0x0017;
const SIGNATURE_SCHEME_RSA_PKCS1_SHA256: u16 = 0x0401;
const EXTENSION_ALPN: u16 = 0x0010;

pub mod msg_type {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
}

/// Where a connection's handshake stands. The server emits ServerHello
/// through ServerHelloDone as one flight, so the states in between are
/// transient bookkeeping rather than points where the core waits on the
/// network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    ExpectingClientHello,
    ExpectingClientKeyExchange,
    ExpectingChangeCipherSpec,
    ExpectingFinished,
    Complete,
}

pub struct ClientHello {
    pub client_random: [u8; 32],
    pub cipher_suites: Vec<u16>,
    pub alpn_offered: Vec<String>,
}

fn read_u16(data: &[u8], at: usize) -> CoreResult<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| CoreError::parse("truncated while reading u16"))
}

/// Parses a ClientHello handshake body (the bytes after the 4-byte
/// handshake header), extracting only what the core needs to respond:
/// the client random, offered cipher suites, and offered ALPN protocols.
pub fn parse_client_hello(body: &[u8]) -> CoreResult<ClientHello> {
    if body.len() < 2 + 32 + 1 {
        return Err(CoreError::parse("ClientHello shorter than fixed prefix"));
    }
    let mut cursor = 2; // client_version, unused: TLS 1.2 is assumed
    let mut client_random = [0u8; 32];
    client_random.copy_from_slice(&body[cursor..cursor + 32]);
    cursor += 32;

    let session_id_len = body[cursor] as usize;
    cursor += 1 + session_id_len;

    let cipher_suites_len = read_u16(body, cursor)? as usize;
    cursor += 2;
    if cipher_suites_len % 2 != 0 {
        return Err(CoreError::parse("cipher_suites length is odd"));
    }
    let mut cipher_suites = Vec::with_capacity(cipher_suites_len / 2);
    for chunk in body
        .get(cursor..cursor + cipher_suites_len)
        .ok_or_else(|| CoreError::parse("truncated cipher_suites"))?
        .chunks_exact(2)
    {
        cipher_suites.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    cursor += cipher_suites_len;

    let compression_len = *body.get(cursor).ok_or_else(|| CoreError::parse("truncated compression_methods"))? as usize;
    cursor += 1 + compression_len;

    let mut alpn_offered = Vec::new();
    if cursor + 2 <= body.len() {
        let extensions_len = read_u16(body, cursor)? as usize;
        cursor += 2;
        let extensions_end = (cursor + extensions_len).min(body.len());
        while cursor + 4 <= extensions_end {
            let ext_type = read_u16(body, cursor)?;
            let ext_len = read_u16(body, cursor + 2)? as usize;
            cursor += 4;
            let ext_data = body
                .get(cursor..cursor + ext_len)
                .ok_or_else(|| CoreError::parse("truncated extension data"))?;
            if ext_type == EXTENSION_ALPN {
                alpn_offered = parse_alpn_protocol_list(ext_data)?;
            }
            cursor += ext_len;
        }
    }

    Ok(ClientHello {
        client_random,
        cipher_suites,
        alpn_offered,
    })
}

fn parse_alpn_protocol_list(ext_data: &[u8]) -> CoreResult<Vec<String>> {
    if ext_data.len() < 2 {
        return Err(CoreError::parse("truncated ALPN extension"));
    }
    let list_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
    let mut cursor = 2;
    let end = (2 + list_len).min(ext_data.len());
    let mut protocols = Vec::new();
    while cursor < end {
        let name_len = ext_data[cursor] as usize;
        cursor += 1;
        let name = ext_data
            .get(cursor..cursor + name_len)
            .ok_or_else(|| CoreError::parse("truncated ALPN protocol name"))?;
        protocols.push(String::from_utf8_lossy(name).into_owned());
        cursor += name_len;
    }
    Ok(protocols)
}

/// Picks the ALPN protocol to advertise back to the client. The core only
/// ever speaks HTTP/1.1 over this connection; "h2" is never selected even
/// if offered, since nothing past this handshake understands HTTP/2 framing.
pub fn select_alpn(offered: &[String]) -> Option<String> {
    offered.iter().find(|p| p.as_str() == "http/1.1").cloned()
}

fn handshake_header(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(msg_type);
    let len = body.len() as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..4]);
    out.extend_from_slice(body);
    out
}

pub fn build_server_hello(server_random: &[u8; 32], cipher_suite: u16, alpn_selected: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // server_version
    body.extend_from_slice(server_random);
    body.push(0); // session_id_length = 0, no session resumption
    body.extend_from_slice(&cipher_suite.to_be_bytes());
    body.push(0); // compression_method = null

    let mut extensions = Vec::new();
    if let Some(proto) = alpn_selected {
        let mut alpn_ext = Vec::new();
        let name = proto.as_bytes();
        alpn_ext.extend_from_slice(&((1 + name.len()) as u16).to_be_bytes());
        alpn_ext.push(name.len() as u8);
        alpn_ext.extend_from_slice(name);

        extensions.extend_from_slice(&EXTENSION_ALPN.to_be_bytes());
        extensions.extend_from_slice(&(alpn_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&alpn_ext);
    }
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    handshake_header(msg_type::SERVER_HELLO, &body)
}

pub fn build_certificate(chain_der: &[Vec<u8>]) -> Vec<u8> {
    let mut cert_list = Vec::new();
    for cert in chain_der {
        cert_list.extend_from_slice(&(cert.len() as u32).to_be_bytes()[1..4]);
        cert_list.extend_from_slice(cert);
    }
    let mut body = Vec::with_capacity(3 + cert_list.len());
    body.extend_from_slice(&(cert_list.len() as u32).to_be_bytes()[1..4]);
    body.extend_from_slice(&cert_list);
    handshake_header(msg_type::CERTIFICATE, &body)
}

/// Encodes the `ServerECDHParams` structure (`curve_type || named_curve ||
/// pubkey_len || pubkey`) — the exact bytes that get signed, and that are
/// then transmitted verbatim ahead of the signature field.
pub fn encode_server_ecdh_params(ecdhe_point: &[u8; 65]) -> Vec<u8> {
    let mut params = Vec::with_capacity(4 + ecdhe_point.len());
    params.push(3); // curve_type = named_curve
    params.extend_from_slice(&NAMED_CURVE_SECP256R1.to_be_bytes());
    params.push(ecdhe_point.len() as u8);
    params.extend_from_slice(ecdhe_point);
    params
}

pub fn build_server_key_exchange(ecdhe_params: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(ecdhe_params.len() + 4 + signature.len());
    body.extend_from_slice(ecdhe_params);
    body.extend_from_slice(&SIGNATURE_SCHEME_RSA_PKCS1_SHA256.to_be_bytes());
    body.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    body.extend_from_slice(signature);
    handshake_header(msg_type::SERVER_KEY_EXCHANGE, &body)
}

pub fn build_server_hello_done() -> Vec<u8> {
    handshake_header(msg_type::SERVER_HELLO_DONE, &[])
}

pub fn build_finished(verify_data: &[u8; crypto::VERIFY_DATA_LEN]) -> Vec<u8> {
    handshake_header(msg_type::FINISHED, verify_data)
}

/// Parses a ClientKeyExchange body (ECDHE_RSA): a length-prefixed raw
/// public EC point.
pub fn parse_client_key_exchange(body: &[u8]) -> CoreResult<Vec<u8>> {
    let len = *body.first().ok_or_else(|| CoreError::parse("empty ClientKeyExchange"))? as usize;
    body.get(1..1 + len)
        .map(|p| p.to_vec())
        .ok_or_else(|| CoreError::parse("truncated ClientKeyExchange public point"))
}

fn transcript_hash(transcript: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&SHA256, transcript);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// `PRF(master_secret, label, transcript_hash)[0..12]`.
pub fn verify_data(master_secret: &[u8; crypto::MASTER_SECRET_LEN], label: &str, transcript: &[u8]) -> [u8; crypto::VERIFY_DATA_LEN] {
    let hash = transcript_hash(transcript);
    let derived = crypto::prf(master_secret, label, &hash, crypto::VERIFY_DATA_LEN);
    let mut out = [0u8; crypto::VERIFY_DATA_LEN];
    out.copy_from_slice(&derived);
    out
}

/// Per-connection handshake and key-schedule state. Lives inside the TCP
/// `Connection` for as long as the flow carries TLS; all secret material
/// is zeroed on drop.
pub struct TlsState {
    pub state: HandshakeState,
    pub transcript: Vec<u8>,
    pub negotiated_alpn: Option<String>,
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    server_ecdh_priv: Option<EphemeralPrivateKey>,
    pub master_secret: Option<[u8; crypto::MASTER_SECRET_LEN]>,
    pub key_block: Option<KeyBlockMaterial>,
    pub client_seq: u64,
    pub server_seq: u64,
}

pub struct KeyBlockMaterial {
    pub client_write_key: [u8; crypto::AEAD_KEY_LEN],
    pub server_write_key: [u8; crypto::AEAD_KEY_LEN],
    pub client_write_iv: [u8; crypto::AEAD_IV_LEN],
    pub server_write_iv: [u8; crypto::AEAD_IV_LEN],
}

impl From<KeyBlock> for KeyBlockMaterial {
    fn from(kb: KeyBlock) -> Self {
        KeyBlockMaterial {
            client_write_key: kb.client_write_key,
            server_write_key: kb.server_write_key,
            client_write_iv: kb.client_write_iv,
            server_write_iv: kb.server_write_iv,
        }
    }
}

impl Drop for TlsState {
    fn drop(&mut self) {
        if let Some(ms) = self.master_secret.as_mut() {
            ms.fill(0);
        }
        if let Some(kb) = self.key_block.as_mut() {
            kb.client_write_key.fill(0);
            kb.server_write_key.fill(0);
        }
    }
}

impl TlsState {
    pub fn new(server_random: [u8; 32]) -> Self {
        TlsState {
            state: HandshakeState::ExpectingClientHello,
            transcript: Vec::new(),
            negotiated_alpn: None,
            client_random: [0u8; 32],
            server_random,
            server_ecdh_priv: None,
            master_secret: None,
            key_block: None,
            client_seq: 0,
            server_seq: 0,
        }
    }

    fn append_transcript(&mut self, message: &[u8]) {
        self.transcript.extend_from_slice(message);
    }

    /// Handles a ClientHello: records the client random and ALPN choice,
    /// generates the server's ephemeral ECDHE keypair, and returns the
    /// four handshake messages to send back in one flight.
    pub fn handle_client_hello(
        &mut self,
        client_hello_msg: &[u8],
        parsed: &ClientHello,
        certificate: &Certificate,
        rng: &SystemRandom,
    ) -> CoreResult<Vec<u8>> {
        if self.state != HandshakeState::ExpectingClientHello {
            return Err(CoreError::protocol("ClientHello received out of order"));
        }
        if !parsed
            .cipher_suites
            .contains(&CIPHER_SUITE_ECDHE_RSA_AES128_GCM_SHA256)
        {
            return Err(CoreError::protocol("client did not offer ECDHE-RSA-AES128-GCM-SHA256"));
        }
        self.client_random = parsed.client_random;
        self.negotiated_alpn = select_alpn(&parsed.alpn_offered);
        self.append_transcript(client_hello_msg);

        let (server_priv, server_pub) = crypto::generate_server_ecdhe(rng)?;
        self.server_ecdh_priv = Some(server_priv);

        let server_hello = build_server_hello(
            &self.server_random,
            CIPHER_SUITE_ECDHE_RSA_AES128_GCM_SHA256,
            self.negotiated_alpn.as_deref(),
        );
        let certificate_msg = build_certificate(&certificate.chain_der);
        // Sign the full ServerECDHParams wire structure, not just the bare
        // point, since that's what a client reconstructs and verifies against.
        let ecdhe_params = encode_server_ecdh_params(&server_pub);
        let signature = crypto::sign_server_key_exchange(
            &certificate.key_pair,
            rng,
            &self.client_random,
            &self.server_random,
            &ecdhe_params,
        )?;
        let server_key_exchange = build_server_key_exchange(&ecdhe_params, &signature);
        let server_hello_done = build_server_hello_done();

        for msg in [&server_hello, &certificate_msg, &server_key_exchange, &server_hello_done] {
            self.append_transcript(msg);
        }

        self.state = HandshakeState::ExpectingClientKeyExchange;

        let mut flight = Vec::new();
        flight.extend_from_slice(&server_hello);
        flight.extend_from_slice(&certificate_msg);
        flight.extend_from_slice(&server_key_exchange);
        flight.extend_from_slice(&server_hello_done);
        Ok(flight)
    }

    /// Handles ClientKeyExchange: derives pre_master, master_secret, and
    /// the AEAD key block from the client's ECDHE public point.
    pub fn handle_client_key_exchange(&mut self, msg: &[u8], client_pub: &[u8]) -> CoreResult<()> {
        if self.state != HandshakeState::ExpectingClientKeyExchange {
            return Err(CoreError::protocol("ClientKeyExchange received out of order"));
        }
        let server_priv = self
            .server_ecdh_priv
            .take()
            .ok_or_else(|| CoreError::protocol("ECDHE private key missing"))?;
        let pre_master = crypto::derive_pre_master(server_priv, client_pub)?;
        let master_secret = crypto::master_secret(&pre_master, &self.client_random, &self.server_random);
        let key_block = crypto::key_block(&master_secret, &self.client_random, &self.server_random);

        self.master_secret = Some(master_secret);
        self.key_block = Some(key_block.into());
        self.append_transcript(msg);
        self.state = HandshakeState::ExpectingChangeCipherSpec;
        Ok(())
    }

    /// Handles the client's ChangeCipherSpec: resets the read-direction
    /// sequence number to 0 and enables decryption for subsequent records.
    /// ChangeCipherSpec is not a handshake message and is never added to
    /// the transcript.
    pub fn handle_change_cipher_spec(&mut self) -> CoreResult<()> {
        if self.state != HandshakeState::ExpectingChangeCipherSpec {
            return Err(CoreError::protocol("ChangeCipherSpec received out of order"));
        }
        self.client_seq = 0;
        self.state = HandshakeState::ExpectingFinished;
        Ok(())
    }

    /// Handles the client's Finished: verifies its `verify_data` against
    /// the transcript up to (but not including) Finished, then returns the
    /// server's own ChangeCipherSpec + Finished flight.
    pub fn handle_client_finished(&mut self, msg: &[u8], client_verify_data: &[u8]) -> CoreResult<Vec<u8>> {
        if self.state != HandshakeState::ExpectingFinished {
            return Err(CoreError::protocol("Finished received out of order"));
        }
        let master_secret = self
            .master_secret
            .ok_or_else(|| CoreError::protocol("master secret missing at Finished"))?;
        let expected = verify_data(&master_secret, "client finished", &self.transcript);
        if expected.as_slice() != client_verify_data {
            return Err(CoreError::protocol("client Finished verify_data mismatch"));
        }
        self.append_transcript(msg);

        let server_verify_data = verify_data(&master_secret, "server finished", &self.transcript);
        let server_finished = build_finished(&server_verify_data);
        self.append_transcript(&server_finished);

        self.server_seq = 0;
        self.state = HandshakeState::Complete;
        Ok(server_finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0xAA; 32]);
        body.push(0); // session_id_length
        let suites = [CIPHER_SUITE_ECDHE_RSA_AES128_GCM_SHA256, 0x002F];
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for s in suites {
            body.extend_from_slice(&s.to_be_bytes());
        }
        body.push(1); // compression_methods length
        body.push(0); // null compression

        let mut alpn_ext = Vec::new();
        let protocols: [&[u8]; 2] = [b"h2", b"http/1.1"];
        let mut list = Vec::new();
        for p in protocols {
            list.push(p.len() as u8);
            list.extend_from_slice(p);
        }
        alpn_ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
        alpn_ext.extend_from_slice(&list);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&EXTENSION_ALPN.to_be_bytes());
        extensions.extend_from_slice(&(alpn_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&alpn_ext);

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);
        body
    }

    #[test]
    fn parses_cipher_suites_and_alpn() {
        let body = sample_client_hello_body();
        let hello = parse_client_hello(&body).unwrap();
        assert_eq!(hello.client_random, [0xAA; 32]);
        assert!(hello
            .cipher_suites
            .contains(&CIPHER_SUITE_ECDHE_RSA_AES128_GCM_SHA256));
        assert_eq!(hello.alpn_offered, vec!["h2".to_string(), "http/1.1".to_string()]);
    }

    #[test]
    fn never_selects_h2_even_when_offered_first() {
        let offered = vec!["h2".to_string(), "http/1.1".to_string()];
        assert_eq!(select_alpn(&offered), Some("http/1.1".to_string()));
    }

    #[test]
    fn selects_none_when_http11_not_offered() {
        let offered = vec!["h2".to_string(), "spdy/3".to_string()];
        assert_eq!(select_alpn(&offered), None);
    }

    #[test]
    fn server_hello_round_trips_through_handshake_header() {
        let msg = build_server_hello(&[0x55; 32], CIPHER_SUITE_ECDHE_RSA_AES128_GCM_SHA256, Some("http/1.1"));
        assert_eq!(msg[0], msg_type::SERVER_HELLO);
        let len = u32::from_be_bytes([0, msg[1], msg[2], msg[3]]) as usize;
        assert_eq!(msg.len(), 4 + len);
    }
}
