//! # Peeking I/O for connection classification.
//!
//! [`Peek`] gives matchers a read-only, budget-bounded view of a
//! connection's initial bytes. Everything a matcher reads is retained in
//! a shared buffer; after classification the buffer is replayed in front
//! of the raw stream by [`SniffedStream`], so the winning sub-listener
//! observes the connection's entire byte stream intact.
//!
//! ## Rules
//! - Matchers never consume from the underlying connection; they only
//!   grow and cursor over the retained buffer.
//! - Reads past the byte budget fail; the matcher is expected to give up.
//! - [`PeekWrite`] additionally lets a matcher write framing bytes to the
//!   peer (HTTP/2 SETTINGS before the client talks). Writes bypass the
//!   buffer; they are not part of the rewind.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Byte-stream bound for matchers: read + write + the marker traits the
/// muxer needs to move connections between tasks.
pub trait SniffIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SniffIo for T {}

/// Read-only cursor over a connection's initial bytes.
///
/// The cursor starts at zero for every matcher; the retained buffer is
/// shared across matchers of one connection so bytes are pulled from the
/// socket at most once.
pub struct Peek<'a> {
    io: &'a mut dyn SniffIo,
    buf: &'a mut Vec<u8>,
    pos: usize,
    budget: usize,
}

impl<'a> Peek<'a> {
    pub(crate) fn new(io: &'a mut dyn SniffIo, buf: &'a mut Vec<u8>, budget: usize) -> Self {
        Self {
            io,
            buf,
            pos: 0,
            budget,
        }
    }

    /// Ensures at least `upto` bytes are buffered (or EOF / budget hit).
    /// Returns the number of buffered bytes.
    ///
    /// Never reads past the budget, so no byte can be pulled from the
    /// socket without being retained for the rewind.
    async fn fill(&mut self, upto: usize) -> io::Result<usize> {
        let want = upto.min(self.budget);
        while self.buf.len() < want {
            let room = self.budget - self.buf.len();
            let mut chunk = [0u8; 512];
            let cap = room.min(chunk.len());
            let n = self.io.read(&mut chunk[..cap]).await?;
            if n == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(self.buf.len())
    }

    /// Returns `n` bytes starting at the cursor without advancing it.
    /// Fails with `UnexpectedEof` when the stream ends (or the budget is
    /// exhausted) first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "peek overflow"))?;
        if self.fill(end).await? < end {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(&self.buf[self.pos..end])
    }

    /// Returns `n` bytes at the cursor and advances past them.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<&[u8]> {
        let end = self.pos + n;
        if self.fill(end).await? < end {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Reads bytes until (and including) the first `\r\n`, bounded by the
    /// budget. Used by request-line matchers.
    pub async fn read_line(&mut self) -> io::Result<&[u8]> {
        let start = self.pos;
        loop {
            if let Some(rel) = self.buf[self.pos..]
                .windows(2)
                .position(|w| w == b"\r\n")
            {
                let end = self.pos + rel + 2;
                self.pos = end;
                return Ok(&self.buf[start..end]);
            }
            let len = self.buf.len();
            if len >= self.budget {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill(len + 128).await? == len {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Moves the cursor back to the first byte.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

/// A [`Peek`] that may also write framing bytes back to the peer.
pub struct PeekWrite<'a> {
    peek: Peek<'a>,
}

impl<'a> PeekWrite<'a> {
    pub(crate) fn new(peek: Peek<'a>) -> Self {
        Self { peek }
    }

    /// The read-only view, for matchers that do not write.
    pub fn reader(&mut self) -> &mut Peek<'a> {
        &mut self.peek
    }

    /// Writes `bytes` directly to the peer and flushes.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.peek.io.write_all(bytes).await?;
        self.peek.io.flush().await
    }
}

impl<'a> std::ops::Deref for PeekWrite<'a> {
    type Target = Peek<'a>;

    fn deref(&self) -> &Self::Target {
        &self.peek
    }
}

impl<'a> std::ops::DerefMut for PeekWrite<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.peek
    }
}

/// A classified connection: the sniffed prefix replayed ahead of the raw
/// TCP stream, so downstream servers see every byte the peer sent.
#[derive(Debug)]
pub struct SniffedStream {
    prefix: Bytes,
    io: TcpStream,
    peer: SocketAddr,
}

impl SniffedStream {
    pub(crate) fn new(prefix: Bytes, io: TcpStream, peer: SocketAddr) -> Self {
        Self { prefix, io, peer }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for SniffedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.remaining().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for SniffedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Peer-address connect info attached to gRPC requests served over a
/// sniffed connection.
#[derive(Debug, Clone)]
pub struct SniffedConnectInfo {
    /// Remote address of the peer.
    pub remote_addr: SocketAddr,
}

impl tonic::transport::server::Connected for SniffedStream {
    type ConnectInfo = SniffedConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        SniffedConnectInfo {
            remote_addr: self.peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_does_not_consume_and_rewinds() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"GET /api HTTP/1.1\r\n").await.unwrap();

        let mut buf = Vec::new();
        let mut peek = Peek::new(&mut server, &mut buf, 4096);
        assert_eq!(peek.peek(4).await.unwrap(), b"GET ");
        assert_eq!(peek.read_exact(4).await.unwrap(), b"GET ");
        peek.rewind();
        assert_eq!(peek.read_exact(4).await.unwrap(), b"GET ");
        assert_eq!(buf.len(), 4);
    }

    #[tokio::test]
    async fn budget_is_enforced() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[0u8; 64]).await.unwrap();

        let mut buf = Vec::new();
        let mut peek = Peek::new(&mut server, &mut buf, 16);
        assert!(peek.peek(32).await.is_err());
    }

    #[tokio::test]
    async fn read_line_stops_at_crlf() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"POST /x HTTP/1.1\r\nHost: a\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut peek = Peek::new(&mut server, &mut buf, 4096);
        assert_eq!(peek.read_line().await.unwrap(), b"POST /x HTTP/1.1\r\n");
    }
}
