//! # Connection matchers.
//!
//! A matcher inspects a connection's initial bytes through a [`Peek`]
//! and votes on whether its sub-listener should take the connection.
//!
//! ## Rules
//! - Deterministic: the same bytes always produce the same vote.
//! - Non-consuming: matchers only cursor over the retained buffer; the
//!   muxer rewinds between matchers and replays everything downstream.
//! - Bounded: reads are capped by the muxer's sniff budget; a matcher
//!   that cannot decide within it votes no.
//!
//! [`Matcher`] is the read-only form. [`MatchWriter`] may additionally
//! write framing bytes to the peer, which HTTP/2 classification needs:
//! a server SETTINGS frame is sent so the client produces the HEADERS
//! frame that separates gRPC from other HTTP/2 traffic.

use async_trait::async_trait;

use crate::mux::http2;
use crate::mux::sniff::{Peek, PeekWrite};

/// Read-only connection matcher.
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Votes on the connection. Errors are expressed as `false`.
    async fn matches(&self, peek: &mut Peek<'_>) -> bool;
}

/// Matcher that may write framing bytes to the peer before voting.
#[async_trait]
pub trait MatchWriter: Send + Sync {
    /// Votes on the connection, optionally writing to the peer.
    async fn matches(&self, io: &mut PeekWrite<'_>) -> bool;
}

/// Matches a plausible HTTP/1 request line: a known method token, a
/// space, and at least one request-target byte.
pub struct Http1Fast;

const HTTP1_METHODS: [&str; 9] = [
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT", "PATCH",
];

// Writer-side adapters: the HTTP sub-listener mixes read-only matchers
// with the SETTINGS-writing HTTP/2 matcher in one registration, so the
// read-only ones also speak the writer interface (and never write).
#[async_trait]
impl MatchWriter for Http1Fast {
    async fn matches(&self, io: &mut PeekWrite<'_>) -> bool {
        Matcher::matches(self, io.reader()).await
    }
}

#[async_trait]
impl MatchWriter for Http2Preface {
    async fn matches(&self, io: &mut PeekWrite<'_>) -> bool {
        Matcher::matches(self, io.reader()).await
    }
}

#[async_trait]
impl Matcher for Http1Fast {
    async fn matches(&self, peek: &mut Peek<'_>) -> bool {
        // Longest method plus the mandatory space and one target byte.
        let head = match peek.peek(9).await {
            Ok(head) => head,
            Err(_) => return false,
        };
        HTTP1_METHODS.iter().any(|method| {
            head.len() > method.len()
                && head.starts_with(method.as_bytes())
                && head[method.len()] == b' '
        })
    }
}

/// Matches the 24-octet HTTP/2 client preface.
pub struct Http2Preface;

#[async_trait]
impl Matcher for Http2Preface {
    async fn matches(&self, peek: &mut Peek<'_>) -> bool {
        http2::has_preface(peek).await
    }
}

/// Matches an HTTP/2 connection whose first request carries (or, in the
/// negated form, does not carry) the given header field.
///
/// Sends an empty server SETTINGS frame before reading, so clients that
/// wait for the server preface still produce their HEADERS in time.
pub struct Http2HeaderField {
    name: String,
    value: String,
    negate: bool,
}

impl Http2HeaderField {
    /// Matches HTTP/2 with `name: value` on the first request.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            negate: false,
        }
    }

    /// The logical negation: matches every connection that does NOT
    /// carry `name: value`, including non-HTTP/2 connections. Intended
    /// as the catch-all side of an either/or split, OR-ed with more
    /// specific matchers on the same sub-listener.
    pub fn exclude(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            negate: true,
        }
    }
}

#[async_trait]
impl MatchWriter for Http2HeaderField {
    async fn matches(&self, io: &mut PeekWrite<'_>) -> bool {
        let found = match http2::first_request_headers(io).await {
            Some(headers) => headers
                .iter()
                .any(|(n, v)| n.eq_ignore_ascii_case(&self.name) && v == &self.value),
            None => false,
        };
        found != self.negate
    }
}

/// Matches an HTTP/1 request whose path starts with the given prefix.
///
/// Reads only the request line; the retained buffer replays it to the
/// downstream server, so the full request survives the peek.
pub struct HttpPathPrefix {
    prefix: String,
}

impl HttpPathPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Matcher for HttpPathPrefix {
    async fn matches(&self, peek: &mut Peek<'_>) -> bool {
        let line = match peek.read_line().await {
            Ok(line) => line,
            Err(_) => return false,
        };
        // METHOD SP request-target SP version CRLF
        let mut parts = line.split(|&b| b == b' ');
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        if method.is_empty() || !HTTP1_METHODS.iter().any(|m| m.as_bytes() == method) {
            return false;
        }
        // Match on the path component only; ignore the query string.
        let path = target.split(|&b| b == b'?').next().unwrap_or_default();
        path.starts_with(self.prefix.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    async fn feed(bytes: &[u8]) -> DuplexStream {
        let (mut client, server) = duplex(4096);
        client.write_all(bytes).await.unwrap();
        tokio::spawn(async move {
            // Keep the write half open so matchers see a live peer.
            let _client = client;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        });
        server
    }

    async fn vote(m: &dyn Matcher, bytes: &[u8]) -> bool {
        let mut io = feed(bytes).await;
        let mut buf = Vec::new();
        let mut peek = Peek::new(&mut io, &mut buf, 8192);
        m.matches(&mut peek).await
    }

    #[tokio::test]
    async fn http1_fast_accepts_request_lines() {
        assert!(vote(&Http1Fast, b"GET /api/hello HTTP/1.1\r\n\r\n").await);
        assert!(vote(&Http1Fast, b"DELETE /x HTTP/1.1\r\n\r\n").await);
        assert!(!vote(&Http1Fast, http2::PREFACE).await);
        assert!(!vote(&Http1Fast, b"\x16\x03\x01\x02\x00 tls-ish").await);
    }

    #[tokio::test]
    async fn preface_matcher() {
        assert!(vote(&Http2Preface, http2::PREFACE).await);
        assert!(!vote(&Http2Preface, b"GET / HTTP/1.1\r\n\r\n").await);
    }

    #[tokio::test]
    async fn path_prefix_requires_prefix_and_keeps_bytes() {
        let m = HttpPathPrefix::new("/debug");
        let mut io = feed(b"GET /debug/grpc/ui/ HTTP/1.1\r\nHost: x\r\n\r\n").await;
        let mut buf = Vec::new();
        let mut peek = Peek::new(&mut io, &mut buf, 8192);
        assert!(m.matches(&mut peek).await);
        // Everything the matcher read is retained for the rewind.
        assert!(buf.starts_with(b"GET /debug/grpc/ui/ HTTP/1.1\r\n"));

        assert!(!vote(&m, b"GET /api/hello HTTP/1.1\r\n\r\n").await);
        assert!(!vote(&m, b"NONSENSE /debug HTTP/1.1\r\n\r\n").await);
    }

    #[tokio::test]
    async fn header_field_exclude_is_negation() {
        // Non-HTTP/2 traffic matches the excluded form trivially.
        let excl = Http2HeaderField::exclude("content-type", "application/grpc");
        let mut io = feed(b"GET / HTTP/1.1\r\n\r\n").await;
        let mut buf = Vec::new();
        let mut pw = PeekWrite::new(Peek::new(&mut io, &mut buf, 8192));
        assert!(MatchWriter::matches(&excl, &mut pw).await);
    }
}
