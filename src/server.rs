//! Connection dispatcher: accept loop, one detached task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::channel::{new_socket, SecureChannel};
use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::keys::KeyMaterial;
use crate::logger::{AuditLog, NoopAuditLog, TextAuditLog};
use crate::oracle::Oracle;
use crate::protocol::timeouts::{ACCEPT_BACKOFF_MAX_MS, ACCEPT_BACKOFF_MS};
use crate::protocol::LISTEN_BACKLOG;

/// Delay between failed accepts. Running out of descriptors makes accept
/// fail immediately and repeatedly, so each failure waits twice as long.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self { next: Duration::from_millis(ACCEPT_BACKOFF_MS) }
    }

    fn failed(&mut self) -> Duration {
        let wait = self.next;
        self.next = (self.next * 2).min(Duration::from_millis(ACCEPT_BACKOFF_MAX_MS));
        wait
    }

    fn reset(&mut self) {
        self.next = Duration::from_millis(ACCEPT_BACKOFF_MS);
    }
}

pub struct Dispatcher {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    oracle: Arc<Oracle>,
    audit: Arc<dyn AuditLog>,
    handshake_timeout: Duration,
    // None: unbounded thread-per-connection model
    limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    /// Bind with address reuse and keep-alive, listen with a backlog of 10.
    pub async fn listen(bind: &str, tls: Arc<rustls::ServerConfig>, oracle: Oracle) -> Result<Self> {
        let addr = tokio::net::lookup_host(bind).await?.next().ok_or_else(|| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {bind}"),
            ))
        })?;
        let socket = new_socket(&addr)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            oracle: Arc::new(oracle),
            audit: Arc::new(NoopAuditLog),
            handshake_timeout: Duration::from_millis(crate::protocol::timeouts::HANDSHAKE_MS),
            limit: None,
        })
    }

    pub fn with_handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }

    /// Bound concurrent sessions. Excess connections wait in the backlog.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.limit = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accept until `shutdown` resolves. Sessions already running are left
    /// to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(addr = %self.local_addr()?, "key oracle listening");
        let mut backoff = AcceptBackoff::new();
        loop {
            let permit = match &self.limit {
                Some(sem) => tokio::select! {
                    _ = &mut shutdown => break,
                    p = Arc::clone(sem).acquire_owned() => match p {
                        Ok(p) => Some(p),
                        Err(_) => break,
                    },
                },
                None => None,
            };
            let (tcp, peer) = tokio::select! {
                _ = &mut shutdown => break,
                res = self.listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        let wait = backoff.failed();
                        warn!(error = %e, retry_ms = wait.as_millis() as u64, "accept failed");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                        continue;
                    }
                },
            };
            backoff.reset();
            info!(%peer, "received connection");

            let acceptor = self.acceptor.clone();
            let oracle = Arc::clone(&self.oracle);
            let audit = Arc::clone(&self.audit);
            let handshake_timeout = self.handshake_timeout;
            // detached: the task cleans up after itself
            tokio::spawn(async move {
                let _permit = permit;
                let channel = match timeout(handshake_timeout, SecureChannel::accept(tcp, peer, &acceptor)).await {
                    Ok(Ok(ch)) => ch,
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "handshake rejected");
                        audit.rejected(&peer.to_string(), &e.to_string());
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "handshake timed out");
                        audit.rejected(&peer.to_string(), "handshake timeout");
                        return;
                    }
                };
                if let Err(e) = oracle.serve(channel).await {
                    warn!(%peer, error = %e, "connection terminated");
                }
            });
        }
        info!("key oracle stopped accepting");
        Ok(())
    }
}

/// Build everything from settings. Any failure here is a fatal
/// configuration error: nothing has been accepted yet.
pub async fn bind(settings: &ServerSettings) -> anyhow::Result<Dispatcher> {
    settings.validate()?;
    let keys = KeyMaterial::load(&settings.rsa_key)?;
    keys.check_rsa_length(settings.rsa_length)?;
    let tls = crate::tls::build_server_config(&settings.tls).context("TLS configuration")?;

    let audit: Arc<dyn AuditLog> = match &settings.audit_log {
        Some(p) => Arc::new(
            TextAuditLog::new(p).with_context(|| format!("open audit log {}", p.display()))?,
        ),
        None => Arc::new(NoopAuditLog),
    };
    let oracle = Oracle::new(Arc::new(keys), settings.oracle_settings()).with_audit(Arc::clone(&audit));
    let dispatcher = Dispatcher::listen(&settings.bind, Arc::new(tls), oracle)
        .await
        .with_context(|| format!("bind {}", settings.bind))?
        .with_handshake_timeout(settings.handshake_timeout())
        .with_max_connections(settings.max_connections)
        .with_audit(audit);
    Ok(dispatcher)
}
