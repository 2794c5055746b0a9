//! Loading the server's certificate chain and RSA signing key from PEM
//! files. The operator supplies `cert.pem`/`key.pem`; the core only reads
//! them.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ring::signature::RsaKeyPair;

use crate::error::{CoreError, CoreResult};

pub struct Certificate {
    pub chain_der: Vec<Vec<u8>>,
    pub key_pair: RsaKeyPair,
}

impl Certificate {
    /// Loads a DER certificate chain from `cert_path` (PEM, possibly
    /// several certificates) and an RSA private key from `key_path` (PEM,
    /// PKCS#8 or PKCS#1).
    pub fn load(cert_path: &Path, key_path: &Path) -> CoreResult<Self> {
        let chain_der = load_cert_chain(cert_path)?;
        if chain_der.is_empty() {
            return Err(CoreError::parse(format!("{}: no certificates found", cert_path.display())));
        }
        let key_pair = load_rsa_key_pair(key_path)?;
        Ok(Certificate { chain_der, key_pair })
    }
}

fn load_cert_chain(path: &Path) -> CoreResult<Vec<Vec<u8>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .map(|result| result.map(|cert| cert.to_vec()).map_err(CoreError::from))
        .collect()
}

fn load_rsa_key_pair(path: &Path) -> CoreResult<RsaKeyPair> {
    let pkcs8_der = {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map(|r| r.map_err(CoreError::from))
            .collect::<CoreResult<Vec<_>>>()?
    };
    if let Some(key) = pkcs8_der.into_iter().next() {
        return RsaKeyPair::from_pkcs8(key.secret_pkcs8_der())
            .map_err(|e| CoreError::crypto(format!("invalid PKCS#8 RSA key: {e}")));
    }

    let pkcs1_der = {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::rsa_private_keys(&mut reader)
            .map(|r| r.map_err(CoreError::from))
            .collect::<CoreResult<Vec<_>>>()?
    };
    let key = pkcs1_der
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::parse(format!("{}: no RSA private key found", path.display())))?;
    RsaKeyPair::from_der(key.secret_pkcs1_der()).map_err(|e| CoreError::crypto(format!("invalid PKCS#1 RSA key: {e}")))
}
