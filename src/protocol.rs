//! Shared protocol constants for the key oracle framed transport

// Every integer field on the wire is a signed 32-bit big-endian value
pub const INT_FIELD_LEN: usize = 4;

// Element width for a 1024-bit modulus; must equal the modulus byte length
pub const DEFAULT_RSA_LENGTH: usize = 128;

// Maximum blinded values accepted in one batch - bounds the allocation made
// before the batch payload is read
pub const MAX_BATCH_ELEMENTS: usize = 4096;

// Maximum chunk payload accepted by the download client (16MB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// Maximum download path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

// Listen backlog for the dispatcher socket
pub const LISTEN_BACKLOG: u32 = 10;

// Chain depth accepted during certificate verification: CA certificates
// allowed between the peer's leaf and the trusted root
pub const VERIFY_DEPTH: usize = 1;

pub const DEFAULT_PORT: u16 = 9040;

// Control values carried in the leading int field of a message
pub mod control {
    /// Download-init indicator, followed by path length and path bytes.
    pub const INIT_DOWNLOAD: i32 = -1;
    /// Explicit application-level session termination.
    pub const CLOSE_SENTINEL: i32 = -7;
}

// Centralized timeout constants
pub mod timeouts {
    // TCP connection establishment (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // TLS handshake, client and server side (ms)
    pub const HANDSHAKE_MS: u64 = 10_000;

    // Pause after a failed accept, doubling up to the cap (ms)
    pub const ACCEPT_BACKOFF_MS: u64 = 10;
    pub const ACCEPT_BACKOFF_MAX_MS: u64 = 1_000;
}
