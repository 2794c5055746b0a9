//! TLS 1.2 key schedule (PRF, master secret, key block) and AEAD record
//! protection. All hashing/HMAC/AEAD/ECDH primitives come from `ring`,
//! building the handshake directly on top of it rather than delegating
//! to a TLS library.

use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::hmac;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};

use crate::error::{CoreError, CoreResult};

pub const VERIFY_DATA_LEN: usize = 12;
pub const MASTER_SECRET_LEN: usize = 48;
pub const AEAD_KEY_LEN: usize = 16;
pub const AEAD_IV_LEN: usize = 4;
pub const AEAD_TAG_LEN: usize = 16;
pub const EXPLICIT_NONCE_LEN: usize = 8;

/// `P_SHA256(secret, seed)`, iterating `A(0)=seed, A(i)=HMAC(secret, A(i-1))`
/// and concatenating `HMAC(secret, A(i) || seed)`, truncated to `out_len`.
fn p_sha256(secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut a = hmac::sign(&key, seed).as_ref().to_vec();
    let mut out = Vec::with_capacity(out_len + 32);
    while out.len() < out_len {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        out.extend_from_slice(hmac::sign(&key, &input).as_ref());
        a = hmac::sign(&key, &a).as_ref().to_vec();
    }
    out.truncate(out_len);
    out
}

/// `PRF(secret, label, seed) = P_SHA256(secret, label || seed)`.
pub fn prf(secret: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);
    p_sha256(secret, &full_seed, out_len)
}

/// Generates the server's ephemeral ECDHE keypair and its uncompressed
/// public point (0x04 || X || Y, 65 bytes) for ServerKeyExchange.
pub fn generate_server_ecdhe(rng: &SystemRandom) -> CoreResult<(EphemeralPrivateKey, [u8; 65])> {
    let private_key = EphemeralPrivateKey::generate(&ECDH_P256, rng)
        .map_err(|_| CoreError::crypto("failed to generate ECDHE keypair"))?;
    let public_key = private_key
        .compute_public_key()
        .map_err(|_| CoreError::crypto("failed to compute ECDHE public key"))?;
    let mut out = [0u8; 65];
    out.copy_from_slice(public_key.as_ref());
    Ok((private_key, out))
}

/// `pre_master = ECDH(server_priv, client_pub)`. Fails (point-off-curve or
/// otherwise invalid) and is surfaced as a crypto error on ClientKeyExchange.
pub fn derive_pre_master(
    server_priv: EphemeralPrivateKey,
    client_pub: &[u8],
) -> CoreResult<Vec<u8>> {
    let peer = UnparsedPublicKey::new(&ECDH_P256, client_pub);
    agreement::agree_ephemeral(server_priv, &peer, |shared_secret| shared_secret.to_vec())
        .map_err(|_| CoreError::crypto("ECDHE key agreement failed (invalid peer point?)"))
}

pub fn master_secret(pre_master: &[u8], client_random: &[u8; 32], server_random: &[u8; 32]) -> [u8; MASTER_SECRET_LEN] {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    let derived = prf(pre_master, "master secret", &seed, MASTER_SECRET_LEN);
    let mut out = [0u8; MASTER_SECRET_LEN];
    out.copy_from_slice(&derived);
    out
}

pub struct KeyBlock {
    pub client_write_key: [u8; AEAD_KEY_LEN],
    pub server_write_key: [u8; AEAD_KEY_LEN],
    pub client_write_iv: [u8; AEAD_IV_LEN],
    pub server_write_iv: [u8; AEAD_IV_LEN],
}

/// `key_block = PRF(master_secret, "key expansion", server_random || client_random)`,
/// 40 bytes sliced into the four AEAD key/IV material fields. No MAC keys —
/// AES-128-GCM is an AEAD cipher.
pub fn key_block(master_secret: &[u8; MASTER_SECRET_LEN], client_random: &[u8; 32], server_random: &[u8; 32]) -> KeyBlock {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    let out = prf(master_secret, "key expansion", &seed, 2 * AEAD_KEY_LEN + 2 * AEAD_IV_LEN);

    let mut client_write_key = [0u8; AEAD_KEY_LEN];
    let mut server_write_key = [0u8; AEAD_KEY_LEN];
    let mut client_write_iv = [0u8; AEAD_IV_LEN];
    let mut server_write_iv = [0u8; AEAD_IV_LEN];
    let mut cursor = 0;
    client_write_key.copy_from_slice(&out[cursor..cursor + AEAD_KEY_LEN]);
    cursor += AEAD_KEY_LEN;
    server_write_key.copy_from_slice(&out[cursor..cursor + AEAD_KEY_LEN]);
    cursor += AEAD_KEY_LEN;
    client_write_iv.copy_from_slice(&out[cursor..cursor + AEAD_IV_LEN]);
    cursor += AEAD_IV_LEN;
    server_write_iv.copy_from_slice(&out[cursor..cursor + AEAD_IV_LEN]);

    KeyBlock {
        client_write_key,
        server_write_key,
        client_write_iv,
        server_write_iv,
    }
}

pub fn aead_key(key_bytes: &[u8; AEAD_KEY_LEN]) -> LessSafeKey {
    LessSafeKey::new(UnboundKey::new(&AES_128_GCM, key_bytes).expect("AES-128-GCM key length is fixed"))
}

fn aead_aad(seq: u64, record_type: u8, plaintext_len: u16) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[0..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = record_type;
    aad[9..11].copy_from_slice(&0x0303u16.to_be_bytes());
    aad[11..13].copy_from_slice(&plaintext_len.to_be_bytes());
    aad
}

fn aead_nonce(write_iv: &[u8; AEAD_IV_LEN], seq: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[0..4].copy_from_slice(write_iv);
    nonce_bytes[4..12].copy_from_slice(&seq.to_be_bytes());
    Nonce::assume_unique_for_key(nonce_bytes)
}

/// Seals `plaintext` for the wire: returns `explicit_nonce(8) || ciphertext || tag(16)`.
/// `seq` is this direction's current record sequence number (the explicit nonce).
pub fn seal(key: &LessSafeKey, write_iv: &[u8; AEAD_IV_LEN], seq: u64, record_type: u8, plaintext: &[u8]) -> Vec<u8> {
    let aad = aead_aad(seq, record_type, plaintext.len() as u16);
    let nonce = aead_nonce(write_iv, seq);
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .expect("AES-128-GCM sealing does not fail for valid inputs");

    let mut wire = Vec::with_capacity(EXPLICIT_NONCE_LEN + in_out.len());
    wire.extend_from_slice(&seq.to_be_bytes());
    wire.extend_from_slice(&in_out);
    wire
}

/// Opens a sealed record body (`explicit_nonce(8) || ciphertext || tag(16)`),
/// verifying the AEAD tag under the AAD derived from `seq`/`record_type`/
/// the recomputed plaintext length. A failed tag is always fatal.
pub fn open(key: &LessSafeKey, write_iv: &[u8; AEAD_IV_LEN], seq: u64, record_type: u8, sealed: &[u8]) -> CoreResult<Vec<u8>> {
    if sealed.len() < EXPLICIT_NONCE_LEN + AEAD_TAG_LEN {
        return Err(CoreError::parse("AEAD record shorter than explicit_nonce+tag"));
    }
    let plaintext_len = (sealed.len() - EXPLICIT_NONCE_LEN - AEAD_TAG_LEN) as u16;
    let aad = aead_aad(seq, record_type, plaintext_len);
    let nonce = aead_nonce(write_iv, seq);
    let mut ciphertext_and_tag = sealed[EXPLICIT_NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::from(aad), &mut ciphertext_and_tag)
        .map_err(|_| CoreError::crypto("AEAD authentication failed"))?;
    Ok(plaintext.to_vec())
}

/// `RSASSA-PKCS1-v1_5(server_key, SHA256(client_random || server_random || ecdhe_params))`,
/// for ServerKeyExchange. `ecdhe_params` must be the full `ServerECDHParams`
/// wire structure (curve_type || named_curve || pubkey_len || pubkey) as
/// produced by `encode_server_ecdh_params`, not the bare point — that's the
/// exact byte string a client reconstructs from the wire and verifies the
/// signature against. `ring`'s `RSA_PKCS1_SHA256` scheme hashes the message
/// itself, so the caller passes the unhashed concatenation.
pub fn sign_server_key_exchange(
    key_pair: &RsaKeyPair,
    rng: &SystemRandom,
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    ecdhe_params: &[u8],
) -> CoreResult<Vec<u8>> {
    let mut message = Vec::with_capacity(64 + ecdhe_params.len());
    message.extend_from_slice(client_random);
    message.extend_from_slice(server_random);
    message.extend_from_slice(ecdhe_params);

    let mut signature = vec![0u8; key_pair.public_modulus_len()];
    key_pair
        .sign(&RSA_PKCS1_SHA256, rng, &message, &mut signature)
        .map_err(|_| CoreError::crypto("RSA signing failed"))?;
    Ok(signature)
}
