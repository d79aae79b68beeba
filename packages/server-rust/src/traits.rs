use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use scgi_core::HeaderSet;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// A decoded SCGI request.
#[derive(Debug, Clone)]
pub struct ScgiRequest {
    /// Header set from the netstring block.
    pub headers: HeaderSet,
    /// Raw body, exactly `CONTENT_LENGTH` bytes.
    pub body: Bytes,
    /// Address of the front-end server connection.
    pub peer: SocketAddr,
}

/// Application-side request handler.
///
/// Writes a complete, already formatted CGI response (status line, headers,
/// body) to `response`. Any error returned is logged by the connection task
/// and never stops the processor.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: ScgiRequest,
        response: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> anyhow::Result<()>;
}

/// Runs the wrapped handler one request at a time.
///
/// For applications that are not safe to enter concurrently.
#[derive(Debug, Default)]
pub struct Serialized<H> {
    inner: H,
    guard: Mutex<()>,
}

impl<H> Serialized<H> {
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            guard: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for Serialized<H> {
    async fn handle(
        &self,
        request: ScgiRequest,
        response: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> anyhow::Result<()> {
        let _single_flight = self.guard.lock().await;
        self.inner.handle(request, response).await
    }
}
