//! Proxy handler implementation
//! Routes each request by the first Host label to a Unix socket backend or a static directory

use crate::body::{full_body, BackendBody, BoxError, ConnectionGuard, ProxyBody};
use crate::error::{display_chain, RouteError};
use crate::resolver::BackendResolver;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

/// Routes one inbound request to its backend
#[derive(Clone)]
pub struct ProxyHandler {
    resolver: Arc<dyn BackendResolver>,
}

impl ProxyHandler {
    /// Create a new proxy handler
    pub fn new(resolver: Arc<dyn BackendResolver>) -> Self {
        Self { resolver }
    }

    /// Handle incoming request
    ///
    /// Routing failures never escape: they become a 404 naming the backend.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        match self.route(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(
                    backend = e.backend_name().unwrap_or("-"),
                    error = %display_chain(&e),
                    "Request failed"
                );
                Ok(Self::not_found(&e))
            }
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, RouteError> {
        let name = backend_name(&req)?;
        debug!(backend = %name, method = %req.method(), uri = %req.uri(), "Routing request");

        let path = self.resolver.resolve(&name).await?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|source| RouteError::NotFound {
                name: name.clone(),
                path: path.clone(),
                source,
            })?;

        if metadata.is_dir() {
            debug!(backend = %name, dir = %path.display(), "Serving static files");
            return Ok(Self::serve_static(&path, req).await);
        }

        Self::forward(name, &path, req).await
    }

    /// Hand the whole request to a file server rooted at `dir`
    async fn serve_static(dir: &Path, req: Request<Incoming>) -> Response<ProxyBody> {
        let response = match ServeDir::new(dir).oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        response.map(|body| body.map_err(BoxError::from).boxed_unsync())
    }

    /// Proxy the request over the backend's Unix socket
    ///
    /// Method, URI and headers are passed through untouched and both bodies
    /// are streamed, so hyper's flow control provides the backpressure.
    async fn forward(
        name: String,
        socket: &Path,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, RouteError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|source| RouteError::Connect {
                name: name.clone(),
                source,
            })?;

        let (mut sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|source| RouteError::Backend {
                name: name.clone(),
                source,
            })?;

        let backend = name.clone();
        let guard = ConnectionGuard::new(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(backend = %backend, error = %e, "Backend connection error");
            }
        }));

        let response = sender
            .send_request(req)
            .await
            .map_err(|source| RouteError::Backend {
                name: name.clone(),
                source,
            })?;

        debug!(backend = %name, status = %response.status(), "Backend responded");

        // Parts carry status, headers and the reason phrase extension verbatim
        Ok(response.map(|body| BackendBody::new(body, name, guard).into_proxy_body()))
    }

    /// Create not found response
    fn not_found(err: &RouteError) -> Response<ProxyBody> {
        let message = match err.backend_name() {
            Some(name) => format!("Couldn't find backend: {}", name),
            None => "Not Found".to_string(),
        };

        let mut response = Response::new(full_body(message));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }
}

/// First label of the request host, with any port removed
///
/// Falls back to the URI authority for absolute-form requests.
pub fn backend_name<B>(req: &Request<B>) -> Result<String, RouteError> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .ok_or(RouteError::MissingHost)?;

    let label = host
        .split(|c: char| c == '.' || c == ':')
        .next()
        .unwrap_or_default()
        .trim();

    if label.is_empty() || label.contains(['/', '\\']) {
        return Err(RouteError::InvalidName(host.to_string()));
    }

    Ok(label.to_string())
}
