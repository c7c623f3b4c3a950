//! # Sniffing protocol multiplexer.
//!
//! One bound TCP listener, demultiplexed by the first bytes of each
//! connection onto protocol sub-listeners (HTTP/1, gRPC, non-gRPC
//! HTTP/2, path-prefix views).
//!
//! - [`muxer`]    accept loop, dispatch, sub-listeners
//! - [`matchers`] the protocol fingerprint matchers
//! - [`sniff`]    peeking reads with full-byte-stream rewind
//! - [`http2`]    HTTP/2 preface and first-HEADERS walking
//! - [`hpack`]    the HPACK subset backing header matching

pub mod matchers;
pub mod muxer;
pub mod sniff;

pub(crate) mod hpack;
pub(crate) mod http2;

pub use matchers::{Http1Fast, Http2HeaderField, Http2Preface, HttpPathPrefix, MatchWriter, Matcher};
pub use muxer::{Muxer, SubListener};
pub use sniff::{Peek, PeekWrite, SniffedConnectInfo, SniffedStream};

use std::sync::{Arc, Mutex, OnceLock};

/// Memoised sub-listener factory.
///
/// The first caller materialises the sub-listener (registering its
/// matcher set on the muxer exactly once); later callers receive the
/// same listener no matter how many puzzles ask.
pub struct LazySubListener {
    cell: OnceLock<Arc<SubListener>>,
    init: Mutex<Option<Box<dyn FnOnce() -> Arc<SubListener> + Send>>>,
}

impl LazySubListener {
    pub(crate) fn new(init: impl FnOnce() -> Arc<SubListener> + Send + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(Some(Box::new(init))),
        }
    }

    /// Returns the sub-listener, materialising it on first call.
    pub fn get(&self) -> Arc<SubListener> {
        Arc::clone(self.cell.get_or_init(|| {
            let init = self
                .init
                .lock()
                .expect("sub-listener init lock")
                .take()
                .expect("sub-listener init consumed without memoisation");
            init()
        }))
    }
}

impl std::fmt::Debug for LazySubListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySubListener")
            .field("materialised", &self.cell.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn lazy_factory_registers_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let muxer = Arc::new(Muxer::new(listener).unwrap());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let lazy = {
            let muxer = Arc::clone(&muxer);
            let calls = Arc::clone(&calls);
            LazySubListener::new(move || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                muxer.match_to(vec![Box::new(Http1Fast)])
            })
        };

        let first = lazy.get();
        let second = lazy.get();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
