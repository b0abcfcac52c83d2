//! Secure channel: one TCP socket, one TLS session, exact-length transfer.
//!
//! Every higher protocol assumes "send N bytes" and "receive exactly N bytes"
//! either complete or fail. The retry loops live here and nowhere else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::timeouts::{CONNECT_MS, HANDSHAKE_MS};
use crate::protocol::INT_FIELD_LEN;
use crate::protocol_core::{decode_int, encode_int};

pub struct SecureChannel<S = TlsStream<TcpStream>> {
    stream: Option<S>,
    peer: String,
}

/// Socket options applied on both sides: address reuse and keep-alive
pub(crate) fn new_socket(addr: &SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    Ok(socket)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port)).await?.next().ok_or_else(|| {
        Error::Transport(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {host}:{port}"),
        ))
    })
}

impl SecureChannel<TlsStream<TcpStream>> {
    /// Connect, run the client handshake, then announce `identity`.
    pub async fn connect(
        host: &str,
        port: u16,
        identity: u32,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let server_name = crate::tls::server_name_for(host).map_err(|e| {
            Error::Handshake(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        let addr = resolve(host, port).await?;
        let socket = new_socket(&addr)?;
        let tcp = match timeout(Duration::from_millis(CONNECT_MS), socket.connect(addr)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::connect_timeout(CONNECT_MS)),
        };
        let _ = tcp.set_nodelay(true);

        let connector = TlsConnector::from(tls);
        let stream = match timeout(
            Duration::from_millis(HANDSHAKE_MS),
            connector.connect(server_name, tcp),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(Error::Handshake(e)),
            Err(_) => return Err(Error::handshake_timeout(HANDSHAKE_MS)),
        };
        debug!(peer = %addr, "TLS session established");

        let mut channel = SecureChannel::new(TlsStream::from(stream), addr.to_string());
        channel.send_int(identity as i32).await?;
        Ok(channel)
    }

    /// Server side handshake. The verifier in the acceptor's config demands a
    /// client certificate chaining directly to the trusted root.
    pub async fn accept(tcp: TcpStream, peer: SocketAddr, acceptor: &TlsAcceptor) -> Result<Self> {
        let _ = tcp.set_nodelay(true);
        let stream = acceptor.accept(tcp).await.map_err(Error::Handshake)?;
        Ok(SecureChannel::new(TlsStream::from(stream), peer.to_string()))
    }
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self { stream: Some(stream), peer: peer.into() }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or_else(|| {
            Error::Transport(std::io::Error::new(std::io::ErrorKind::NotConnected, "channel closed"))
        })
    }

    /// Write the whole buffer or fail. Returns the number of bytes sent,
    /// which is always `buf.len()`.
    pub async fn send_exact(&mut self, buf: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(buf.len())
    }

    /// Read into `buf` until it is full. A zero-length read before that is
    /// an orderly shutdown and surfaces as `EndOfStream`.
    pub async fn recv_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let stream = self.stream()?;
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]).await {
                Ok(0) => return Err(Error::EndOfStream),
                Ok(n) => filled += n,
                // rustls: TCP closed without close_notify
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::EndOfStream)
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.recv_exact_into(&mut buf).await?;
        Ok(buf)
    }

    /// `recv_exact` bounded by an optional idle timeout
    pub async fn recv_exact_timed(&mut self, len: usize, idle: Option<Duration>) -> Result<Vec<u8>> {
        match idle {
            None => self.recv_exact(len).await,
            Some(d) => match timeout(d, self.recv_exact(len)).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout { op: "idle read", ms: d.as_millis() as u64 }),
            },
        }
    }

    pub async fn send_int(&mut self, v: i32) -> Result<usize> {
        self.send_exact(&encode_int(v)).await
    }

    pub async fn recv_int_raw(&mut self, idle: Option<Duration>) -> Result<[u8; INT_FIELD_LEN]> {
        let raw = self.recv_exact_timed(INT_FIELD_LEN, idle).await?;
        let mut field = [0u8; INT_FIELD_LEN];
        field.copy_from_slice(&raw);
        Ok(field)
    }

    pub async fn recv_int(&mut self) -> Result<i32> {
        Ok(decode_int(self.recv_int_raw(None).await?))
    }

    /// Shut down the session and release the socket. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_recv_exact_reassembles_fragmented_writes() {
        let (a, mut b) = duplex(4);
        let mut ch = SecureChannel::new(a, "test");
        let writer = tokio::spawn(async move {
            for part in [&b"abc"[..], b"de", b"fghij"] {
                b.write_all(part).await.unwrap();
            }
            b
        });
        let got = ch.recv_exact(10).await.unwrap();
        assert_eq!(got, b"abcdefghij");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_recv_exact_reports_end_of_stream() {
        let (a, mut b) = duplex(64);
        let mut ch = SecureChannel::new(a, "test");
        b.write_all(b"xy").await.unwrap();
        drop(b);
        // short read: peer closed before the length was satisfied
        assert!(ch.recv_exact(4).await.unwrap_err().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_recv_zero_length_does_not_block() {
        let (a, _b) = duplex(64);
        let mut ch = SecureChannel::new(a, "test");
        assert!(ch.recv_exact(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_exact_and_int_fields() {
        let (a, b) = duplex(1024);
        let mut tx = SecureChannel::new(a, "tx");
        let mut rx = SecureChannel::new(b, "rx");
        assert_eq!(tx.send_int(-7).await.unwrap(), 4);
        assert_eq!(tx.send_exact(&[9u8; 100]).await.unwrap(), 100);
        assert_eq!(rx.recv_int().await.unwrap(), -7);
        assert_eq!(rx.recv_exact(100).await.unwrap(), vec![9u8; 100]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals_peer() {
        let (a, b) = duplex(64);
        let mut tx = SecureChannel::new(a, "tx");
        let mut rx = SecureChannel::new(b, "rx");
        tx.close().await;
        tx.close().await;
        assert!(tx.is_closed());
        assert!(tx.send_exact(b"late").await.is_err());
        assert!(rx.recv_int().await.unwrap_err().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (a, _b) = duplex(64);
        let mut ch = SecureChannel::new(a, "idle");
        let err = ch
            .recv_exact_timed(4, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
