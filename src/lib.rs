//! Blindkey library
//!
//! Mutually-authenticated RSA blind-signing key oracle: the server signs
//! blinded content hashes with a private exponent it never reveals, giving
//! clients convergent encryption keys that need the server's cooperation.

pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod log;
pub mod logger;
pub mod oracle;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod tls;

pub use error::{Error, Result};
