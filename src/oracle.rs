//! Blind-signature oracle: the per-connection worker.
//!
//! Session shape after the handshake:
//!   identity (int) then repeated { count N | N x RSA_LENGTH bytes }
//! answered by N x RSA_LENGTH signed bytes per batch. A zero-length read on
//! the count field or the close sentinel ends the session cleanly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rsa::BigUint;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::channel::SecureChannel;
use crate::error::{Error, Result};
use crate::keys::KeyMaterial;
use crate::logger::{AuditLog, NoopAuditLog};
use crate::protocol::MAX_BATCH_ELEMENTS;
use crate::protocol_core::{batch_payload_len, decode_int, pad_to_width, parse_batch_header, BatchHeader};

/// Sign one fixed-width element: `v^d mod n`, left-padded to RSA_LENGTH.
pub fn sign_element(keys: &KeyMaterial, element: &[u8]) -> Result<Vec<u8>> {
    let width = keys.rsa_length();
    if element.len() != width {
        return Err(Error::protocol(format!(
            "element is {} bytes, expected {width}",
            element.len()
        )));
    }
    let v = BigUint::from_bytes_be(element);
    if &v >= keys.modulus() {
        return Err(Error::protocol("batch element is not less than the modulus"));
    }
    let s = keys.exponentiate(&v);
    pad_to_width(&s.to_bytes_be(), width)
}

/// Sign a whole batch payload; output order matches input order.
pub fn sign_batch(keys: &KeyMaterial, payload: &[u8]) -> Result<Vec<u8>> {
    let width = keys.rsa_length();
    if payload.len() % width != 0 {
        return Err(Error::protocol(format!(
            "batch payload of {} bytes is not a multiple of {width}",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(payload.len());
    for element in payload.chunks_exact(width) {
        out.extend_from_slice(&sign_element(keys, element)?);
    }
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct OracleSettings {
    pub max_batch: usize,
    /// Bound on how long a session may sit idle between batches
    pub idle_timeout: Option<Duration>,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self { max_batch: MAX_BATCH_ELEMENTS, idle_timeout: None }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub user: Option<u32>,
    pub batches: u64,
    pub elements: u64,
}

pub struct Oracle {
    keys: Arc<KeyMaterial>,
    settings: OracleSettings,
    audit: Arc<dyn AuditLog>,
}

impl Oracle {
    pub fn new(keys: Arc<KeyMaterial>, settings: OracleSettings) -> Self {
        Self { keys, settings, audit: Arc::new(NoopAuditLog) }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn keys(&self) -> &Arc<KeyMaterial> {
        &self.keys
    }

    /// Run one session to completion. The channel is closed on every exit
    /// path; `Ok` means the peer ended the session the way it is meant to.
    pub async fn serve<S>(&self, mut channel: SecureChannel<S>) -> Result<SessionStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stats = SessionStats::default();
        let result = self.run_session(&mut channel, &mut stats).await;
        channel.close().await;
        self.audit.session_end(channel.peer(), stats.user, stats.batches, stats.elements);
        info!(
            peer = channel.peer(),
            user = ?stats.user,
            batches = stats.batches,
            elements = stats.elements,
            ok = result.is_ok(),
            "session closed"
        );
        result.map(|_| stats)
    }

    async fn run_session<S>(&self, channel: &mut SecureChannel<S>, stats: &mut SessionStats) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let user = match channel.recv_int_raw(self.settings.idle_timeout).await {
            Ok(raw) => decode_int(raw) as u32,
            // connected and left without identifying
            Err(Error::EndOfStream) => return Ok(()),
            Err(e) => return Err(e),
        };
        stats.user = Some(user);
        info!(peer = channel.peer(), user, "connection from user");
        self.audit.session_start(channel.peer(), user);

        let width = self.keys.rsa_length();
        loop {
            let header = match channel.recv_int_raw(self.settings.idle_timeout).await {
                Ok(raw) => parse_batch_header(raw, self.settings.max_batch)?,
                Err(Error::EndOfStream) => return Ok(()),
                Err(e) => return Err(e),
            };
            let count = match header {
                BatchHeader::Close => {
                    debug!(peer = channel.peer(), user, "close sentinel received");
                    return Ok(());
                }
                BatchHeader::Count(n) => n,
            };

            let payload = match channel.recv_exact(batch_payload_len(count, width)?).await {
                Ok(p) => p,
                Err(Error::EndOfStream) => {
                    return Err(Error::protocol(format!(
                        "stream closed before {count}-element batch was delivered"
                    )))
                }
                Err(e) => return Err(e),
            };

            let started = Instant::now();
            let keys = Arc::clone(&self.keys);
            let signed = tokio::task::spawn_blocking(move || sign_batch(&keys, &payload))
                .await
                .map_err(|e| Error::Signing(e.to_string()))??;
            let elapsed = started.elapsed();
            debug!(
                peer = channel.peer(),
                user,
                elements = count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "server compute"
            );
            self.audit.batch(channel.peer(), user, count, elapsed.as_secs_f64());

            channel.send_exact(&signed).await?;
            stats.batches += 1;
            stats.elements += count as u64;
        }
    }
}
