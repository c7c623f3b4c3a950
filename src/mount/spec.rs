//! # The supervised unit of work.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::error::MountError;

/// Boxed future produced by a mount body.
pub(crate) type MountFuture = Pin<Box<dyn Future<Output = Result<(), MountError>> + Send + 'static>>;

/// A named, supervised unit of work.
///
/// Daemon mounts are load-bearing: their failure (or unexpected exit
/// with an error) tears the whole core down. One-shot mounts may fail;
/// the failure is logged and swallowed.
pub(crate) struct MountFn {
    pub(crate) name: Cow<'static, str>,
    pub(crate) daemon: bool,
    body: Box<dyn FnOnce(CancellationToken) -> MountFuture + Send>,
}

impl MountFn {
    /// A daemon mount; its error aborts the supervisor.
    pub(crate) fn daemon<F, Fut>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        Self::new(name, true, body)
    }

    /// A one-shot mount; its error is logged and swallowed.
    pub(crate) fn worker<F, Fut>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        Self::new(name, false, body)
    }

    fn new<F, Fut>(name: impl Into<Cow<'static, str>>, daemon: bool, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            daemon,
            body: Box::new(move |token| Box::pin(body(token))),
        }
    }

    /// Builds the body future, handing it a child of the supervisor's
    /// token so cancellation propagates top-down only.
    pub(crate) fn into_body(self, token: &CancellationToken) -> (Cow<'static, str>, bool, MountFuture) {
        let fut = (self.body)(token.child_token());
        (self.name, self.daemon, fut)
    }
}
