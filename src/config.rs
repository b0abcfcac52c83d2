//! TOML settings for the daemon and the client.
//!
//! Resolution order: command-line flags → config file → defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::oracle::OracleSettings;
use crate::protocol::{DEFAULT_PORT, DEFAULT_RSA_LENGTH, MAX_BATCH_ELEMENTS, MAX_CHUNK_SIZE};
use crate::tls::{config_dir, TlsPaths};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address (host:port)
    pub bind: String,
    pub tls: TlsPaths,
    /// RSA private key (PKCS#1 or PKCS#8 PEM)
    pub rsa_key: PathBuf,
    /// Element width in bytes; must equal the modulus byte length
    pub rsa_length: usize,
    pub max_batch: usize,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// 0 = one detached task per connection, unbounded
    pub max_connections: usize,
    pub audit_log: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            tls: TlsPaths::default_server(),
            rsa_key: config_dir().join("private.pem"),
            rsa_length: DEFAULT_RSA_LENGTH,
            max_batch: MAX_BATCH_ELEMENTS,
            idle_timeout_secs: 0,
            handshake_timeout_secs: 10,
            max_connections: 0,
            audit_log: None,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.rsa_length == 0 {
            bail!("rsa_length must be positive");
        }
        if self.max_batch == 0 {
            bail!("max_batch must be positive");
        }
        if self.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn oracle_settings(&self) -> OracleSettings {
        OracleSettings {
            max_batch: self.max_batch,
            idle_timeout: (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs)),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub user_id: u32,
    pub tls: TlsPaths,
    pub rsa_length: usize,
    pub max_chunk: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user_id: 0,
            tls: TlsPaths::default_client(),
            rsa_length: DEFAULT_RSA_LENGTH,
            max_chunk: MAX_CHUNK_SIZE,
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<()> {
        if self.rsa_length == 0 {
            bail!("rsa_length must be positive");
        }
        if self.max_chunk == 0 || self.max_chunk > i32::MAX as usize {
            bail!("max_chunk must be between 1 and {}", i32::MAX);
        }
        Ok(())
    }
}

/// Load settings from `path`, or defaults when no file is given
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match path {
        None => Ok(T::default()),
        Some(p) => {
            let data = std::fs::read_to_string(p)
                .with_context(|| format!("read config {}", p.display()))?;
            toml::from_str(&data).with_context(|| format!("parse config {}", p.display()))
        }
    }
}
