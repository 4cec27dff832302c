//! Response bodies
//! Everything the proxy hands back to hyper is boxed into `ProxyBody`

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::warn;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every client-facing response
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// In-memory body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Aborts the backend connection task when dropped
#[derive(Debug)]
pub struct ConnectionGuard(JoinHandle<()>);

impl ConnectionGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pin_project! {
    /// Streams a backend response to the client
    ///
    /// Headers have already been sent by the time this is polled, so a
    /// failure can only be logged. Dropping the body (client gone or stream
    /// finished) tears down the backend connection.
    pub struct BackendBody {
        #[pin]
        inner: Incoming,
        backend: String,
        _connection: ConnectionGuard,
    }
}

impl BackendBody {
    pub fn new(inner: Incoming, backend: String, connection: ConnectionGuard) -> Self {
        Self {
            inner,
            backend,
            _connection: connection,
        }
    }

    pub fn into_proxy_body(self) -> ProxyBody {
        BodyExt::map_err(self, BoxError::from).boxed_unsync()
    }
}

impl Body for BackendBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                warn!(backend = %this.backend, error = %e, "Backend stream failed after headers were sent");
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_body() {
        let body = full_body("hello");
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_guard_aborts_task() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let abort = handle.abort_handle();
        drop(ConnectionGuard::new(handle));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(abort.is_finished());
    }
}
