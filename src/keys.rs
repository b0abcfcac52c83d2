//! Oracle key material.
//!
//! Loaded once at startup and shared read-only (`Arc<KeyMaterial>`) by every
//! connection worker. Nothing mutates it after construction.

use anyhow::{bail, Context, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use std::fmt;
use std::path::Path;

pub struct KeyMaterial {
    key: RsaPrivateKey,
    rsa_length: usize,
}

impl KeyMaterial {
    pub fn new(key: RsaPrivateKey) -> Self {
        let rsa_length = (key.n().bits() + 7) / 8;
        Self { key, rsa_length }
    }

    /// Accepts PKCS#1 (`BEGIN RSA PRIVATE KEY`) or PKCS#8 PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = match RsaPrivateKey::from_pkcs1_pem(pem) {
            Ok(k) => k,
            Err(_) => RsaPrivateKey::from_pkcs8_pem(pem).context("parse RSA private key")?,
        };
        Ok(Self::new(key))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("read RSA key {}", path.display()))?;
        Self::from_pem(&pem).with_context(|| format!("load RSA key {}", path.display()))
    }

    /// Framing desynchronizes if peers disagree on the element width, so a
    /// mismatch with the configured RSA_LENGTH is fatal.
    pub fn check_rsa_length(&self, configured: usize) -> Result<()> {
        if configured != self.rsa_length {
            bail!(
                "configured rsa_length {} does not match the {}-byte modulus ({} bits)",
                configured,
                self.rsa_length,
                self.key.n().bits()
            );
        }
        Ok(())
    }

    pub fn rsa_length(&self) -> usize {
        self.rsa_length
    }

    pub fn modulus(&self) -> &BigUint {
        self.key.n()
    }

    pub fn public_exponent(&self) -> &BigUint {
        self.key.e()
    }

    #[cfg(test)]
    pub(crate) fn private_exponent(&self) -> &BigUint {
        self.key.d()
    }

    /// `v^d mod n`
    pub(crate) fn exponentiate(&self, v: &BigUint) -> BigUint {
        v.modpow(self.key.d(), self.key.n())
    }
}

impl fmt::Debug for KeyMaterial {
    // the private exponent never reaches logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("modulus_bits", &self.key.n().bits())
            .field("rsa_length", &self.rsa_length)
            .finish_non_exhaustive()
    }
}
