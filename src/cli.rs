//! Shared CLI option structs for blindkeyd and blindkey

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ClientSettings, ServerSettings};
use crate::log::LogFormat;

/// Key oracle daemon options. Flags override the config file.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "RSA blind-signing key oracle (mutual TLS)")]
pub struct DaemonOpts {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Trusted root certificate (PEM)
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Server certificate (PEM)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Server TLS private key (PEM)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// RSA signing key (PKCS#1 or PKCS#8 PEM)
    #[arg(long)]
    pub rsa_key: Option<PathBuf>,

    /// Element width in bytes; must equal the modulus length
    #[arg(long)]
    pub rsa_length: Option<usize>,

    /// Largest batch accepted, in elements
    #[arg(long)]
    pub max_batch: Option<usize>,

    /// Close sessions idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Limit concurrent sessions (0 = unbounded)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Append a per-session audit trail to this file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn apply(&self, s: &mut ServerSettings) {
        if let Some(v) = &self.bind { s.bind = v.clone(); }
        if let Some(v) = &self.ca_cert { s.tls.ca_cert = v.clone(); }
        if let Some(v) = &self.tls_cert { s.tls.cert = v.clone(); }
        if let Some(v) = &self.tls_key { s.tls.key = v.clone(); }
        if let Some(v) = &self.rsa_key { s.rsa_key = v.clone(); }
        if let Some(v) = self.rsa_length { s.rsa_length = v; }
        if let Some(v) = self.max_batch { s.max_batch = v; }
        if let Some(v) = self.idle_timeout_secs { s.idle_timeout_secs = v; }
        if let Some(v) = self.max_connections { s.max_connections = v; }
        if let Some(v) = &self.audit_log { s.audit_log = Some(v.clone()); }
    }
}

/// Key oracle client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Client for the blindkey oracle")]
pub struct ClientOpts {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Numeric user identity announced after the handshake
    #[arg(long)]
    pub user: Option<u32>,

    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Client TLS private key (PEM)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    #[arg(long)]
    pub rsa_length: Option<usize>,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Sign blinded values (hex, big-endian); prints one signature per line
    Sign {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Download a file from a cooperating peer
    Fetch {
        path: String,
        /// Total file size in bytes
        #[arg(long)]
        size: u64,
        /// Output file
        #[arg(long)]
        out: PathBuf,
    },
}

impl ClientOpts {
    pub fn apply(&self, s: &mut ClientSettings) {
        if let Some(v) = &self.host { s.host = v.clone(); }
        if let Some(v) = self.port { s.port = v; }
        if let Some(v) = self.user { s.user_id = v; }
        if let Some(v) = &self.ca_cert { s.tls.ca_cert = v.clone(); }
        if let Some(v) = &self.tls_cert { s.tls.cert = v.clone(); }
        if let Some(v) = &self.tls_key { s.tls.key = v.clone(); }
        if let Some(v) = self.rsa_length { s.rsa_length = v; }
    }
}
