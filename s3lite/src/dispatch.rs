//! The seam between request signing and the network.
//!
//! The client never talks to `reqwest` directly.  It hands a fully signed request to a
//! [`Dispatcher`] and gets back the raw status, headers, and body, or a classified transport
//! failure.  That keeps retry and error interpretation testable without a network, and makes it
//! possible to plug in a different HTTP stack if needed.
use crate::{signing::SignedRequest, Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use http::{HeaderMap, StatusCode};
use snafu::prelude::*;
use std::{error::Error as _, fmt};
use tracing::trace;

/// Broad classes of transport failure.  Everything that isn't obviously the request's own fault
/// is assumed to be transient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DispatchErrorKind {
    /// Couldn't establish a connection (refused, DNS failure, TLS handshake)
    Connect,

    /// The HTTP client's own connect or read timeout fired
    Timeout,

    /// The connection was dropped mid-request
    Reset,

    /// Failed while streaming the response body
    Body,

    /// The request itself could not be sent as constructed, for example an invalid header value
    Request,

    Other,
}

/// A failure to get any HTTP response at all.
#[derive(Clone, Debug)]
pub struct HttpDispatchError {
    kind: DispatchErrorKind,
    message: String,
}

impl HttpDispatchError {
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DispatchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DispatchErrorKind::Connect
                | DispatchErrorKind::Timeout
                | DispatchErrorKind::Reset
                | DispatchErrorKind::Body
        )
    }
}

impl fmt::Display for HttpDispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for HttpDispatchError {}

/// A complete HTTP response, body included, before any S3-level interpretation
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Something that can send a signed request and return the server's response.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait Dispatcher: DynClone + fmt::Debug + Sync + Send + 'static {
    /// Send the request exactly once.  Retrying is the caller's business.
    async fn dispatch(&self, request: &SignedRequest)
        -> Result<HttpResponse, HttpDispatchError>;
}

dyn_clone::clone_trait_object!(Dispatcher);

/// The production [`Dispatcher`], backed by a pooled `reqwest` client.
#[derive(Clone, Debug)]
pub struct ReqwestDispatcher {
    client: reqwest::Client,
}

impl ReqwestDispatcher {
    /// Build a client whose connection pool keeps at most `max_concurrent_requests` idle
    /// connections per host.
    ///
    /// There is no overall request timeout on the HTTP client; the deadline for a logical request
    /// (including retries) is enforced by [`crate::S3Client`].
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .connect_timeout(config.request_timeout())
            .tcp_nodelay(true)
            .build()
            .context(crate::error::HttpClientSnafu)?;

        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Dispatcher for ReqwestDispatcher {
    async fn dispatch(
        &self,
        request: &SignedRequest,
    ) -> Result<HttpResponse, HttpDispatchError> {
        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .body(request.body().clone());

        for (name, value) in request.headers() {
            // reqwest derives `Host` from the URL, which always agrees with the signed value
            if name == "host" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        trace!(%status, body_len = body.len(), "HTTP response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Map a `reqwest` failure onto a [`DispatchErrorKind`].
fn classify(err: reqwest::Error) -> HttpDispatchError {
    let kind = if err.is_builder() {
        DispatchErrorKind::Request
    } else if err.is_timeout() {
        DispatchErrorKind::Timeout
    } else if err.is_connect() {
        DispatchErrorKind::Connect
    } else if has_reset_cause(&err) {
        DispatchErrorKind::Reset
    } else if err.is_body() || err.is_decode() {
        DispatchErrorKind::Body
    } else if err.is_request() {
        // The request was on the wire and the server hung up before answering
        DispatchErrorKind::Reset
    } else {
        DispatchErrorKind::Other
    };

    // Flatten the cause chain into the message so it survives the conversion
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    HttpDispatchError::new(kind, message)
}

fn has_reset_cause(err: &reqwest::Error) -> bool {
    let mut source = err.source();

    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }

    false
}
