//! # HTTP/2 connection sniffing.
//!
//! Walks the beginning of an HTTP/2 cleartext connection far enough to
//! recover the header list of the client's first request, without
//! consuming anything (all reads go through [`Peek`]).
//!
//! ## Flow
//! ```text
//! peek 24-byte client preface
//!   → send empty server SETTINGS (clients that wait for the server
//!     preface will not produce HEADERS otherwise)
//!   → walk frames: skip SETTINGS / WINDOW_UPDATE / PING / ...
//!   → HEADERS: strip padding + priority, collect fragment
//!   → CONTINUATION until END_HEADERS
//!   → HPACK-decode the fragment
//! ```
//!
//! The walk is bounded by the peek budget; anything malformed or
//! oversized yields `None` (no match) rather than an error.

use std::io;

use crate::mux::hpack::Decoder;
use crate::mux::sniff::{Peek, PeekWrite};

/// The 24-octet HTTP/2 client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// An empty server SETTINGS frame: length 0, type 0x4, flags 0, stream 0.
const SERVER_SETTINGS: [u8; 9] = [0, 0, 0, 0x4, 0, 0, 0, 0, 0];

const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Upper bound on frames walked before giving up on finding HEADERS.
const MAX_FRAMES: usize = 16;

/// True when the connection starts with the HTTP/2 client preface.
///
/// Compares byte by byte so a non-HTTP/2 peer is rejected on its first
/// differing byte instead of waiting for 24 bytes that may never come
/// (a short HTTP/1 request on a keep-alive connection).
pub(crate) async fn has_preface(peek: &mut Peek<'_>) -> bool {
    for (i, &expected) in PREFACE.iter().enumerate() {
        match peek.peek(i + 1).await {
            Ok(bytes) if bytes[i] == expected => {}
            _ => return false,
        }
    }
    true
}

/// Reads the header list of the client's first request.
///
/// Expects the cursor at the start of the connection. Sends the server
/// SETTINGS frame before walking, since well-behaved clients may wait
/// for it. Returns `None` when the connection is not HTTP/2 or the walk
/// hits its bounds.
pub(crate) async fn first_request_headers(
    io: &mut PeekWrite<'_>,
) -> Option<Vec<(String, String)>> {
    if !has_preface(io.reader()).await {
        return None;
    }
    io.reader().read_exact(PREFACE.len()).await.ok()?;
    io.send(&SERVER_SETTINGS).await.ok()?;

    let mut fragment: Vec<u8> = Vec::new();
    let mut in_headers = false;

    for _ in 0..MAX_FRAMES {
        let (len, kind, flags) = read_frame_header(io.reader()).await.ok()?;
        let payload = io.reader().read_exact(len).await.ok()?;

        match (kind, in_headers) {
            (FRAME_HEADERS, false) => {
                fragment.extend_from_slice(headers_fragment(payload, flags)?);
                if flags & FLAG_END_HEADERS != 0 {
                    return Decoder::new().decode(&fragment);
                }
                in_headers = true;
            }
            (FRAME_CONTINUATION, true) => {
                fragment.extend_from_slice(payload);
                if flags & FLAG_END_HEADERS != 0 {
                    return Decoder::new().decode(&fragment);
                }
            }
            // A header block must be contiguous; anything interleaved
            // (or a stray CONTINUATION) is a protocol error.
            (_, true) | (FRAME_CONTINUATION, false) => return None,
            _ => {}
        }
    }
    None
}

/// Reads a 9-byte frame header: 24-bit length, type, flags (stream id is
/// irrelevant for sniffing).
async fn read_frame_header(peek: &mut Peek<'_>) -> io::Result<(usize, u8, u8)> {
    let head = peek.read_exact(9).await?;
    let len = usize::from(head[0]) << 16 | usize::from(head[1]) << 8 | usize::from(head[2]);
    Ok((len, head[3], head[4]))
}

/// Strips padding and priority from a HEADERS payload, leaving the
/// header block fragment.
fn headers_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut start = 0;
    let mut end = payload.len();

    if flags & FLAG_PADDED != 0 {
        let pad = usize::from(*payload.first()?);
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    payload.get(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame(kind: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + payload.len());
        let len = payload.len() as u32;
        out.extend_from_slice(&[
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
            kind,
            flags,
            0,
            0,
            0,
            1,
        ]);
        out.extend_from_slice(payload);
        out
    }

    fn grpc_headers_block() -> Vec<u8> {
        // :method POST (indexed 3), then content-type literal without
        // indexing with an indexed name (static 31), raw value.
        let mut block = vec![0x83, 0x0f, 0x10];
        block.push(16);
        block.extend_from_slice(b"application/grpc");
        block
    }

    #[tokio::test]
    async fn walks_settings_then_headers() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(PREFACE).await.unwrap();
        client.write_all(&frame(0x4, 0, &[])).await.unwrap();
        client
            .write_all(&frame(FRAME_HEADERS, FLAG_END_HEADERS, &grpc_headers_block()))
            .await
            .unwrap();

        let mut buf = Vec::new();
        let peek = Peek::new(&mut server, &mut buf, 8192);
        let mut io = PeekWrite::new(peek);
        let headers = first_request_headers(&mut io).await.unwrap();
        assert!(headers
            .iter()
            .any(|(n, v)| n == "content-type" && v == "application/grpc"));
    }

    #[tokio::test]
    async fn continuation_frames_are_joined() {
        let block = grpc_headers_block();
        let (head, tail) = block.split_at(2);

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(PREFACE).await.unwrap();
        client.write_all(&frame(FRAME_HEADERS, 0, head)).await.unwrap();
        client
            .write_all(&frame(FRAME_CONTINUATION, FLAG_END_HEADERS, tail))
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut io = PeekWrite::new(Peek::new(&mut server, &mut buf, 8192));
        let headers = first_request_headers(&mut io).await.unwrap();
        assert_eq!(headers[0], (":method".to_string(), "POST".to_string()));
    }

    #[tokio::test]
    async fn non_http2_yields_none_and_consumes_nothing() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = Vec::new();
        let mut io = PeekWrite::new(Peek::new(&mut server, &mut buf, 8192));
        assert!(first_request_headers(&mut io).await.is_none());
        io.reader().rewind();
        assert_eq!(io.reader().read_exact(4).await.unwrap(), b"GET ");
    }
}
