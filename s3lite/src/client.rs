use crate::{
    addressing::EndpointConfig,
    credentials::{self, Credentials, CredentialsSource},
    dispatch::{Dispatcher, ReqwestDispatcher},
    response::{self, S3Response},
    retry::RetryPolicy,
    signing::{self, S3Request, SignedRequest},
    Config, Result, S3Error,
};
use bytes::Bytes;
use chrono::Utc;
use http::{header, Method};
use snafu::prelude::*;
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};
use url::Url;

/// Region in which `CreateBucket` must not carry a location constraint
const US_EAST_1: &str = "us-east-1";

/// A client for an S3-compatible object storage service.
///
/// Cloning is cheap, and all clones share the same connection pool, concurrency limit,
/// credentials and retry policy.  Nothing in the client changes after it's built, so it can be
/// used from any number of tasks at once.
#[derive(Clone, Debug)]
pub struct S3Client {
    inner: Arc<S3ClientInner>,
}

#[derive(Debug)]
struct S3ClientInner {
    config: Config,
    endpoint: EndpointConfig,
    credentials: Credentials,
    dispatcher: Box<dyn Dispatcher>,
    retry_policy: RetryPolicy,

    /// Bounds the number of attempts in flight across all clones of the client
    permits: Semaphore,
}

/// Builds an [`S3Client`], optionally overriding where credentials come from, how requests are
/// sent, and how failures are retried.
#[derive(Debug)]
pub struct S3ClientBuilder {
    config: Config,
    credentials: Option<Credentials>,
    credentials_sources: Option<Vec<CredentialsSource>>,
    dispatcher: Option<Box<dyn Dispatcher>>,
    retry_policy: Option<RetryPolicy>,
}

impl S3ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            credentials: None,
            credentials_sources: None,
            dispatcher: None,
            retry_policy: None,
        }
    }

    /// Use these credentials rather than looking any up
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Look credentials up in these sources instead of [`credentials::default_chain`]
    pub fn credentials_sources(mut self, sources: Vec<CredentialsSource>) -> Self {
        self.credentials_sources = Some(sources);
        self
    }

    pub fn dispatcher(mut self, dispatcher: impl Dispatcher) -> Self {
        self.dispatcher = Some(Box::new(dispatcher));
        self
    }

    /// Defaults to [`RetryPolicy::default`] with the retry count from the config
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Resolve the endpoint, load credentials, and build the client
    pub async fn build(self) -> Result<S3Client> {
        let endpoint = EndpointConfig::from_config(&self.config)?;

        let credentials = match self.credentials {
            Some(credentials) => credentials,
            None => {
                let sources = self
                    .credentials_sources
                    .unwrap_or_else(|| credentials::default_chain(&self.config));
                credentials::load(&sources).await?
            }
        };

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Box::new(ReqwestDispatcher::new(&self.config)?),
        };

        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::default().with_max_retries(self.config.max_retries));

        let permits = Semaphore::new(self.config.max_concurrent_requests.max(1));

        debug!(endpoint = %endpoint.authority(), region = endpoint.region(),
            addressing_style = %endpoint.addressing_style(),
            access_key_id = credentials.access_key_id(),
            "Created S3 client");

        Ok(S3Client {
            inner: Arc::new(S3ClientInner {
                config: self.config,
                endpoint,
                credentials,
                dispatcher,
                retry_policy,
                permits,
            }),
        })
    }
}

impl S3Client {
    /// Build a client with the default credentials chain, HTTP stack and retry policy
    pub async fn new(config: Config) -> Result<Self> {
        S3ClientBuilder::new(config).build().await
    }

    pub fn builder(config: Config) -> S3ClientBuilder {
        S3ClientBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.inner.endpoint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    /// Start building a request for `key` in `bucket`.  An empty key addresses the bucket.
    pub fn request(&self, method: Method, bucket: &str, key: &str) -> Result<S3Request> {
        Ok(S3Request::new(
            method,
            self.inner.endpoint.resolve(bucket, key)?,
        ))
    }

    /// Sign a request with the client's credentials as of now
    pub fn prepare(&self, request: S3Request) -> Result<SignedRequest> {
        signing::sign(
            request,
            &self.inner.credentials,
            self.inner.endpoint.region(),
            Utc::now(),
        )
    }

    /// Sign and send a request
    pub async fn send(&self, request: S3Request) -> Result<S3Response> {
        let request = self.prepare(request)?;

        self.execute(request).await
    }

    /// Send a signed request, retrying transient failures of idempotent requests per the retry
    /// policy.
    ///
    /// The whole thing, retries and backoff included, must finish within the configured request
    /// timeout.  If it doesn't, the attempt in flight is abandoned and [`S3Error::Timeout`] is
    /// returned.
    #[instrument(skip_all, fields(method = %request.method(), url = %request.url()))]
    pub async fn execute(&self, request: SignedRequest) -> Result<S3Response> {
        let timeout = self.inner.config.request_timeout();
        let retry_enabled = request.is_idempotent();
        let policy = &self.inner.retry_policy;
        let schedule = policy.schedule();

        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let request = &request;
        let me = self;

        let result = tokio::time::timeout(
            timeout,
            schedule.retry_if(
                move || async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt > 0 {
                        debug!(attempt, "Retrying request");
                    }
                    me.send_once(request).await
                },
                |err: &S3Error| {
                    let retry = retry_enabled && policy.is_retryable(err);
                    if retry {
                        warn!(err = %err, "Request failed with a transient error; will retry");
                    }
                    retry
                },
            ),
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok(Ok(response)) => Ok(response.with_retries(attempts.saturating_sub(1))),
            Ok(Err(e)) => {
                error!(err = %e, attempts, "Request failed");
                Err(e)
            }
            Err(_) => {
                error!(?timeout, attempts, "Request timed out");
                crate::error::TimeoutSnafu { timeout }.fail()
            }
        }
    }

    async fn send_once(&self, request: &SignedRequest) -> Result<S3Response> {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .expect("BUG: the semaphore is never closed");

        let response = self
            .inner
            .dispatcher
            .dispatch(request)
            .await
            .context(crate::error::HttpDispatchSnafu {
                url: request.url().to_string(),
            })?;

        response::interpret(response)
    }

    #[instrument(skip(self))]
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<S3Response> {
        self.send(self.request(Method::GET, bucket, key)?).await
    }

    /// Read the bytes in `range` of an object.  The range end is exclusive.
    #[instrument(skip(self))]
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<S3Response> {
        ensure!(
            range.start < range.end,
            crate::error::InvalidRangeSnafu {
                start: range.start,
                end: range.end,
            }
        );

        let request = self.request(Method::GET, bucket, key)?.with_header(
            header::RANGE,
            format!("bytes={}-{}", range.start, range.end - 1),
        );

        self.send(request).await
    }

    #[instrument(skip(self))]
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<S3Response> {
        self.send(self.request(Method::HEAD, bucket, key)?).await
    }

    /// Upload an object in a single request.  The body is hashed and signed, so the upload is
    /// safe to retry.
    #[instrument(skip(self, body))]
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        content_type: Option<&str>,
    ) -> Result<S3Response> {
        let body = body.into();
        debug!(len = body.len(), "Uploading object");

        let mut request = self.request(Method::PUT, bucket, key)?.with_body(body);
        if let Some(content_type) = content_type {
            request = request.with_header(header::CONTENT_TYPE, content_type);
        }

        self.send(request).await
    }

    #[instrument(skip(self))]
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<S3Response> {
        self.send(self.request(Method::DELETE, bucket, key)?).await
    }

    /// Create a bucket in the client's region
    #[instrument(skip(self))]
    pub async fn create_bucket(&self, bucket: &str) -> Result<S3Response> {
        let mut request = self.request(Method::PUT, bucket, "")?;

        let region = self.inner.endpoint.region();
        if region != US_EAST_1 {
            request = request.with_body(format!(
                r#"<CreateBucketConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><LocationConstraint>{region}</LocationConstraint></CreateBucketConfiguration>"#
            ));
        }

        self.send(request).await
    }

    #[instrument(skip(self))]
    pub async fn head_bucket(&self, bucket: &str) -> Result<S3Response> {
        self.send(self.request(Method::HEAD, bucket, "")?).await
    }

    /// Names of all buckets owned by the caller
    #[instrument(skip(self))]
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let request = S3Request::new(Method::GET, self.inner.endpoint.resolve_service()?);
        let response = self.send(request).await?;

        response::parse_bucket_names(response.body())
    }

    /// A URL anyone can use to download the object until `expires_in` has passed
    #[instrument(skip(self))]
    pub fn presigned_get_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<Url> {
        self.presigned_url(&self.request(Method::GET, bucket, key)?, expires_in)
    }

    /// A URL anyone can use to upload the object until `expires_in` has passed
    #[instrument(skip(self))]
    pub fn presigned_put_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<Url> {
        self.presigned_url(&self.request(Method::PUT, bucket, key)?, expires_in)
    }

    /// A URL anyone can use to delete the object until `expires_in` has passed
    #[instrument(skip(self))]
    pub fn presigned_delete_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<Url> {
        self.presigned_url(&self.request(Method::DELETE, bucket, key)?, expires_in)
    }

    /// Presign an arbitrary request with the client's credentials and region.
    ///
    /// Query parameters on `request` (`versionId`, `partNumber` and `uploadId`, ...) end up in
    /// the URL.  Its headers are signed, so the eventual caller must send them unchanged.
    #[instrument(skip_all, fields(method = %request.method(), url = %request.endpoint().url))]
    pub fn presigned_url(&self, request: &S3Request, expires_in: Duration) -> Result<Url> {
        signing::presign(
            request,
            &self.inner.credentials,
            self.inner.endpoint.region(),
            Utc::now(),
            expires_in,
        )
    }
}
