//! # Muxer: one TCP listener, many protocol sub-listeners.
//!
//! The [`Muxer`] owns the root listener. Each accepted connection is
//! classified by matchers in registration order and handed to the first
//! sub-listener whose matcher votes yes, with every sniffed byte
//! replayed in front of the stream.
//!
//! ## Rules
//! - Registration order is dispatch order; the first registered winner
//!   takes the connection.
//! - A connection that matches nothing is closed; the muxer keeps
//!   serving.
//! - A failed sniff closes only that connection.
//! - [`Muxer::close`] closes every sub-listener and releases the root
//!   listener; [`Muxer::serve`] then returns `Ok(())`.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::{is_listener_closed, listener_closed};
use crate::mux::matchers::{MatchWriter, Matcher};
use crate::mux::sniff::{Peek, PeekWrite, SniffedStream};

/// Most bytes a connection may be peeked for during classification.
const SNIFF_BUDGET: usize = 8 * 1024;

/// Classification deadline per connection.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept queue depth per sub-listener.
const ACCEPT_BACKLOG: usize = 64;

enum AnyMatcher {
    Read(Box<dyn Matcher>),
    Write(Box<dyn MatchWriter>),
}

impl AnyMatcher {
    async fn matches(&self, io: &mut PeekWrite<'_>) -> bool {
        match self {
            AnyMatcher::Read(m) => m.matches(io.reader()).await,
            AnyMatcher::Write(m) => m.matches(io).await,
        }
    }
}

struct Entry {
    matchers: Vec<AnyMatcher>,
    tx: mpsc::Sender<SniffedStream>,
}

/// Protocol multiplexer over a single bound TCP listener.
pub struct Muxer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    entries: Mutex<Vec<Arc<Entry>>>,
    shutdown: CancellationToken,
}

impl Muxer {
    /// Wraps an already bound listener.
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            entries: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the root listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a sub-listener accepting connections for which any of
    /// the matchers votes yes.
    pub fn match_to(&self, matchers: Vec<Box<dyn Matcher>>) -> Arc<SubListener> {
        self.register(matchers.into_iter().map(AnyMatcher::Read).collect())
    }

    /// Like [`match_to`](Muxer::match_to) for matchers that write
    /// framing bytes to the peer before voting.
    pub fn match_with_writer(&self, matchers: Vec<Box<dyn MatchWriter>>) -> Arc<SubListener> {
        self.register(matchers.into_iter().map(AnyMatcher::Write).collect())
    }

    fn register(&self, matchers: Vec<AnyMatcher>) -> Arc<SubListener> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.entries
            .lock()
            .expect("muxer entries lock")
            .push(Arc::new(Entry { matchers, tx }));
        Arc::new(SubListener {
            rx: tokio::sync::Mutex::new(rx),
            addr: self.local_addr,
        })
    }

    /// Accepts and dispatches until the listener fails or the muxer is
    /// closed. Classification runs concurrently per connection; a slow
    /// or unmatched peer never stalls the accept loop.
    ///
    /// Returns `Ok(())` when closed via [`close`](Muxer::close).
    pub async fn serve(&self) -> io::Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("muxer listener lock")
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "muxer already served"))?;

        loop {
            tokio::select! {
                // Returning drops the listener, releasing the port
                // before the serve mount reports completion.
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let entries = self.entries.lock().expect("muxer entries lock").clone();
                        tokio::spawn(dispatch(stream, peer, entries));
                    }
                    Err(err) if is_listener_closed(&err) => return Ok(()),
                    Err(err) => {
                        tracing::error!(error = %err, "muxer accept failed");
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Closes all sub-listeners and stops the serve loop. Subsequent
    /// `accept` calls on any sub-listener fail with a closed-listener
    /// error. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
        // Dropping the senders ends every sub-listener's accept stream.
        self.entries.lock().expect("muxer entries lock").clear();
        // Release the port even if serve was never started.
        self.listener.lock().expect("muxer listener lock").take();
    }
}

async fn dispatch(mut stream: TcpStream, peer: SocketAddr, entries: Vec<Arc<Entry>>) {
    let mut buf = Vec::with_capacity(512);

    let winner = time::timeout(SNIFF_TIMEOUT, async {
        for entry in &entries {
            for matcher in &entry.matchers {
                let peek = Peek::new(&mut stream, &mut buf, SNIFF_BUDGET);
                let mut io = PeekWrite::new(peek);
                if matcher.matches(&mut io).await {
                    return Some(Arc::clone(entry));
                }
            }
        }
        None
    })
    .await;

    match winner {
        Ok(Some(entry)) => {
            let conn = SniffedStream::new(Bytes::from(buf), stream, peer);
            if entry.tx.send(conn).await.is_err() {
                tracing::debug!(%peer, "sub-listener closed, dropping connection");
            }
        }
        Ok(None) => {
            tracing::debug!(%peer, "no matcher claimed connection, closing");
        }
        Err(_) => {
            tracing::debug!(%peer, "classification timed out, closing");
        }
    }
}

/// Accept-only view over the muxer for one protocol class.
pub struct SubListener {
    rx: tokio::sync::Mutex<mpsc::Receiver<SniffedStream>>,
    addr: SocketAddr,
}

impl SubListener {
    /// Waits for the next classified connection.
    ///
    /// Fails with a closed-listener error once the muxer is closed.
    pub async fn accept(&self) -> io::Result<SniffedStream> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(listener_closed)
    }

    /// Address of the root listener this view is derived from.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Adapts the listener into a connection stream; the stream ends
    /// when the muxer closes. Used to feed tonic's incoming.
    pub fn incoming(self: &Arc<Self>) -> impl Stream<Item = io::Result<SniffedStream>> {
        futures::stream::unfold(Arc::clone(self), |listener| async move {
            match listener.accept().await {
                Ok(conn) => Some((Ok(conn), listener)),
                Err(_) => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::matchers::{Http1Fast, Http2HeaderField, HttpPathPrefix};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn muxer_on_localhost() -> Arc<Muxer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Arc::new(Muxer::new(listener).unwrap())
    }

    fn serve(muxer: &Arc<Muxer>) {
        let muxer = Arc::clone(muxer);
        tokio::spawn(async move { muxer.serve().await });
    }

    #[tokio::test]
    async fn dispatches_to_first_registered_winner() {
        let muxer = muxer_on_localhost().await;
        let debug = muxer.match_to(vec![Box::new(HttpPathPrefix::new("/debug"))]);
        let http = muxer.match_to(vec![Box::new(Http1Fast)]);
        serve(&muxer);

        let mut client = TcpStream::connect(muxer.local_addr()).await.unwrap();
        let request = b"GET /debug/pprof/ HTTP/1.1\r\nHost: x\r\n\r\n";
        client.write_all(request).await.unwrap();

        // /debug registered first, so it wins even though Http1Fast
        // also matches.
        let mut conn = debug.accept().await.unwrap();

        // The sub-listener sees the entire byte stream (request line
        // included), none of it eaten by the sniff.
        let mut seen = vec![0u8; request.len()];
        conn.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, request);
        drop(http);
    }

    #[tokio::test]
    async fn routes_http1_and_grpc_separately() {
        let muxer = muxer_on_localhost().await;
        let grpc = muxer.match_with_writer(vec![Box::new(Http2HeaderField::new(
            "content-type",
            "application/grpc",
        ))]);
        let http = muxer.match_with_writer(vec![
            Box::new(Http1Fast),
            Box::new(Http2HeaderField::exclude("content-type", "application/grpc")),
        ]);
        serve(&muxer);

        // Plain HTTP/1 goes to the http sub-listener.
        let mut h1 = TcpStream::connect(muxer.local_addr()).await.unwrap();
        h1.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let conn = http.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), h1.local_addr().unwrap());

        // A gRPC-shaped HTTP/2 connection goes to the grpc sub-listener.
        let mut g = TcpStream::connect(muxer.local_addr()).await.unwrap();
        g.write_all(crate::mux::http2::PREFACE).await.unwrap();
        // SETTINGS, then HEADERS with content-type: application/grpc.
        g.write_all(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0]).await.unwrap();
        let mut block = vec![0x83u8, 0x0f, 0x10, 16];
        block.extend_from_slice(b"application/grpc");
        let mut frame = vec![0u8, 0, block.len() as u8, 0x1, 0x4, 0, 0, 0, 1];
        frame.extend_from_slice(&block);
        g.write_all(&frame).await.unwrap();

        let conn = grpc.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), g.local_addr().unwrap());
    }

    #[tokio::test]
    async fn close_fails_pending_accepts() {
        let muxer = muxer_on_localhost().await;
        let sub = muxer.match_to(vec![Box::new(Http1Fast)]);
        serve(&muxer);

        let pending = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.accept().await })
        };
        tokio::task::yield_now().await;
        muxer.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(is_listener_closed(&err));
        assert!(is_listener_closed(&sub.accept().await.unwrap_err()));
    }
}
