//! Key client: identity, batch signing and chunked file download over one
//! secure channel.
//!
//! Session states: Identified → {Signing | Downloading} → Closed. Signing and
//! downloading are never interleaved on the same channel.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use tracing::debug;

use crate::channel::SecureChannel;
use crate::error::{Error, Result};
use crate::protocol::control::CLOSE_SENTINEL;
use crate::protocol::MAX_CHUNK_SIZE;
use crate::protocol_core::{
    batch_payload_len, encode_batch, encode_download_init, parse_chunk_size, split_batch,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Identified,
    Signing,
    Downloading,
    Closed,
}

pub struct KeyClient<S = TlsStream<TcpStream>> {
    channel: SecureChannel<S>,
    rsa_length: usize,
    max_chunk: usize,
    state: SessionState,
}

impl KeyClient<TlsStream<TcpStream>> {
    pub async fn connect(
        host: &str,
        port: u16,
        identity: u32,
        tls: Arc<rustls::ClientConfig>,
        rsa_length: usize,
    ) -> Result<Self> {
        let channel = SecureChannel::connect(host, port, identity, tls).await?;
        debug!(host, port, identity, "identified to key oracle");
        Ok(Self::from_channel(channel, rsa_length))
    }
}

impl<S> KeyClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a channel whose identity has already been sent
    pub fn from_channel(channel: SecureChannel<S>, rsa_length: usize) -> Self {
        Self { channel, rsa_length, max_chunk: MAX_CHUNK_SIZE, state: SessionState::Identified }
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, next: SessionState) -> Result<()> {
        match (self.state, next) {
            (SessionState::Closed, _) => Err(Error::protocol("session is closed")),
            (SessionState::Signing, SessionState::Downloading)
            | (SessionState::Downloading, SessionState::Signing) => Err(Error::protocol(format!(
                "cannot switch from {:?} to {:?} on one channel",
                self.state, next
            ))),
            _ => {
                self.state = next;
                Ok(())
            }
        }
    }

    /// Send blinded values (big-endian, at most RSA_LENGTH bytes each) and
    /// return the oracle's signed values in the same order.
    pub async fn sign_batch(&mut self, blinded: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        self.enter(SessionState::Signing)?;
        let request = encode_batch(blinded, self.rsa_length)?;
        self.channel.send_exact(&request).await?;
        let len = batch_payload_len(blinded.len(), self.rsa_length)?;
        let response = self
            .channel
            .recv_exact(len)
            .await
            .map_err(|e| e.eof_as_truncation("a sign-batch response"))?;
        split_batch(&response, self.rsa_length)
    }

    /// Announce a download. No reply is expected before chunks flow.
    pub async fn init_download(&mut self, path: &str) -> Result<()> {
        self.enter(SessionState::Downloading)?;
        let msg = encode_download_init(path)?;
        self.channel.send_exact(&msg).await?;
        debug!(path, "download initiated");
        Ok(())
    }

    /// Read one size-prefixed chunk into `buf`. The declared size must fit
    /// in `buf`; the number of payload bytes read is returned.
    pub async fn download_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state != SessionState::Downloading {
            return Err(Error::protocol("no download in progress"));
        }
        let raw = self
            .channel
            .recv_int_raw(None)
            .await
            .map_err(|e| e.eof_as_truncation("a chunk header"))?;
        let size = parse_chunk_size(raw, buf.len().min(self.max_chunk))?;
        self.channel
            .recv_exact_into(&mut buf[..size])
            .await
            .map_err(|e| e.eof_as_truncation("a chunk payload"))?;
        Ok(size)
    }

    /// Download `path` of `total` bytes into `sink`, chunk by chunk.
    pub async fn download<W>(&mut self, path: &str, total: u64, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        self.init_download(path).await?;
        let mut buf = vec![0u8; (total.min(self.max_chunk as u64)) as usize];
        let mut received = 0u64;
        while received < total {
            let room = (total - received).min(buf.len() as u64) as usize;
            let n = self.download_chunk(&mut buf[..room]).await?;
            if n == 0 {
                return Err(Error::protocol(format!(
                    "empty chunk with {} bytes outstanding",
                    total - received
                )));
            }
            sink.write_all(&buf[..n]).await?;
            received += n as u64;
        }
        sink.flush().await?;
        debug!(path, bytes = received, "download complete");
        self.state = SessionState::Identified;
        Ok(received)
    }

    /// Send the explicit close sentinel, then close the channel.
    pub async fn close_conn(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let res = self.channel.send_int(CLOSE_SENTINEL).await.map(|_| ());
        self.close().await;
        res
    }

    /// Close without the sentinel; the peer sees end-of-stream.
    pub async fn close(&mut self) {
        self.channel.close().await;
        self.state = SessionState::Closed;
    }
}
