//! Tests of the client's retry, error interpretation, timeout, and concurrency behavior.
//!
//! None of these touch the network.  The client is built with a scripted [`Dispatcher`] that
//! answers each attempt with the next step of a script and counts what it was asked to do, which
//! makes it possible to assert on exact attempt counts and in-flight limits.
use crate::Result;
use assert_matches::assert_matches;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use more_asserts::*;
use s3lite::{
    AddressingStyle, Config, Credentials, CredentialsSource, DispatchErrorKind, Dispatcher,
    ErrorKind, HttpDispatchError, HttpResponse, RetryPolicy, S3Client, S3Error, SignedRequest,
};
use s3lite_testing::logging::test_with_logging;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

const ACCESS_DENIED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>AccessDenied</Code>
  <Message>Access Denied</Message>
  <Resource>/test-bucket/some/key.txt</Resource>
  <RequestId>4442587FB7D0A2F9</RequestId>
</Error>"#;

const LIST_BUCKETS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListAllMyBucketsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Owner><ID>02d6176db174dc93cb1b899f7c6078f08654445fe8cf1b6ce98d8855f66bdbf4</ID><DisplayName>minio</DisplayName></Owner>
  <Buckets>
    <Bucket><Name>alpha</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>
    <Bucket><Name>beta</Name><CreationDate>2024-01-02T00:00:00.000Z</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#;

/// What the dispatcher does for one attempt
#[derive(Clone, Debug)]
enum Step {
    Respond { status: u16, body: &'static str },
    Fail(DispatchErrorKind),
    /// Never answer
    Stall,
}

fn ok(body: &'static str) -> Step {
    Step::Respond { status: 200, body }
}

fn status(status: u16, body: &'static str) -> Step {
    Step::Respond { status, body }
}

#[derive(Debug, Default)]
struct ScriptState {
    script: VecDeque<Step>,
    attempts: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Answers attempts from a script, then with 200 and an empty body once the script runs out.
///
/// Every answer takes `latency`, so that concurrent attempts actually overlap.
#[derive(Clone, Debug, Default)]
struct ScriptedDispatcher {
    state: Arc<Mutex<ScriptState>>,
    latency: Duration,
}

impl ScriptedDispatcher {
    fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                script: script.into_iter().collect(),
                ..Default::default()
            })),
            latency: Duration::ZERO,
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait::async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        request: &SignedRequest,
    ) -> std::result::Result<HttpResponse, HttpDispatchError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);

            state.script.pop_front().unwrap_or_else(|| ok(""))
        };

        tracing::debug!(method = %request.method(), url = %request.url(), ?step, "Scripted dispatch");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match step {
            Step::Respond { status, body } => Ok(HttpResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                body: Bytes::from_static(body.as_bytes()),
            }),
            Step::Fail(kind) => Err(HttpDispatchError::new(kind, "scripted failure")),
            Step::Stall => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        };

        self.state.lock().unwrap().in_flight -= 1;

        result
    }
}

fn test_config() -> Config {
    Config {
        s3_endpoint: Some("http://s3.us-east-1.rusoto.example.com:9000".parse().unwrap()),
        addressing_style: AddressingStyle::Path,
        aws_region: Some("us-east-1".to_string()),
        disable_instance_metadata: true,
        ..Config::default()
    }
}

async fn client_with(config: Config, dispatcher: ScriptedDispatcher) -> Result<S3Client> {
    Ok(S3Client::builder(config)
        .credentials(Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"))
        .dispatcher(dispatcher)
        .retry_policy(RetryPolicy::no_backoff())
        .build()
        .await?)
}

async fn client(dispatcher: ScriptedDispatcher) -> Result<S3Client> {
    client_with(test_config(), dispatcher).await
}

/// A 500 followed by a 200 is one retry, and the caller sees only the success
#[test]
fn server_error_is_retried() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([status(500, ""), ok("hello")]);
        let client = client(dispatcher.clone()).await?;

        let response = client.get_object("test-bucket", "some/key.txt").await?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"hello");
        assert_eq!(response.retries(), 1);
        assert_eq!(dispatcher.attempts(), 2);

        Ok(())
    })
}

#[test]
fn throttling_and_network_errors_are_retried() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([
            status(429, ""),
            Step::Fail(DispatchErrorKind::Connect),
            Step::Fail(DispatchErrorKind::Reset),
            ok(""),
        ]);
        let client = client(dispatcher.clone()).await?;

        let response = client.head_object("test-bucket", "key").await?;

        assert_eq!(response.retries(), 3);
        assert_eq!(dispatcher.attempts(), 4);

        Ok(())
    })
}

/// Once the retries run out, the last error is what the caller gets
#[test]
fn retries_are_bounded() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new(std::iter::repeat(status(503, "")).take(10));
        let mut config = test_config();
        config.max_retries = 2;

        let client = S3Client::builder(config.clone())
            .credentials(Credentials::new("minioadmin", "minioadmin"))
            .dispatcher(dispatcher.clone())
            .retry_policy(RetryPolicy::no_backoff().with_max_retries(config.max_retries))
            .build()
            .await?;

        let err = client.get_object("test-bucket", "key").await.unwrap_err();

        assert_matches!(
            err,
            S3Error::Service { status, ref code, .. } if status == StatusCode::SERVICE_UNAVAILABLE && code == "ServiceUnavailable"
        );
        assert_eq!(dispatcher.attempts(), 3);

        Ok(())
    })
}

/// A 403 with an S3 error document comes back verbatim, and isn't retried
#[test]
fn access_denied_is_parsed_and_not_retried() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([status(403, ACCESS_DENIED), ok("")]);
        let client = client(dispatcher.clone()).await?;

        let err = client
            .get_object("test-bucket", "some/key.txt")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Service);
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(err.request_id(), Some("4442587FB7D0A2F9"));
        assert_matches!(
            err,
            S3Error::Service { ref code, ref message, ref resource, .. }
                if code == "AccessDenied"
                && message == "Access Denied"
                && resource.as_deref() == Some("/test-bucket/some/key.txt")
        );
        assert_eq!(dispatcher.attempts(), 1);

        Ok(())
    })
}

/// A HEAD 404 has no body, so the code comes from the status line
#[test]
fn bodyless_error() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([status(404, "")]);
        let client = client(dispatcher.clone()).await?;

        let err = client.head_object("test-bucket", "missing").await.unwrap_err();

        assert_matches!(
            err,
            S3Error::Service { status, ref code, .. } if status == StatusCode::NOT_FOUND && code == "NotFound"
        );
        assert_eq!(dispatcher.attempts(), 1);

        Ok(())
    })
}

#[test]
fn malformed_error_body() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([status(400, "<html><body>Bad Request</body></html>")]);
        let client = client(dispatcher.clone()).await?;

        let err = client.get_object("test-bucket", "key").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnparseableErrorResponse);
        assert_matches!(
            err,
            S3Error::UnparseableErrorResponse { status, ref body }
                if status == StatusCode::BAD_REQUEST && body.contains("Bad Request")
        );
        assert_eq!(dispatcher.attempts(), 1);

        Ok(())
    })
}

/// Requests that can't safely be sent twice are sent once, whatever the failure
#[test]
fn non_idempotent_requests_are_not_retried() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([
            status(500, ""),
            Step::Fail(DispatchErrorKind::Reset),
        ]);
        let client = client(dispatcher.clone()).await?;

        let post = client
            .request(Method::POST, "test-bucket", "key")?
            .with_query("uploads", "")
            .with_body("irrelevant");
        let err = client.send(post).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(dispatcher.attempts(), 1);

        let unsigned_put = client
            .request(Method::PUT, "test-bucket", "key")?
            .with_unsigned_body("streamed elsewhere");
        let err = client.send(unsigned_put).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        assert_eq!(dispatcher.attempts(), 2);

        Ok(())
    })
}

/// A signed PUT can be replayed byte for byte, so it is retried like a GET
#[test]
fn signed_put_is_retried() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([Step::Fail(DispatchErrorKind::Timeout), ok("")]);
        let client = client(dispatcher.clone()).await?;

        let response = client
            .put_object("test-bucket", "key", Bytes::from_static(b"payload"), Some("text/plain"))
            .await?;

        assert_eq!(response.retries(), 1);
        assert_eq!(dispatcher.attempts(), 2);

        Ok(())
    })
}

#[test]
fn custom_retry_predicate() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([status(500, ""), ok("")]);

        let client = S3Client::builder(test_config())
            .credentials(Credentials::new("minioadmin", "minioadmin"))
            .dispatcher(dispatcher.clone())
            .retry_policy(RetryPolicy::no_backoff().with_retryable(|_| false))
            .build()
            .await?;

        assert!(client.get_object("test-bucket", "key").await.is_err());
        assert_eq!(dispatcher.attempts(), 1);

        Ok(())
    })
}

/// The request timeout covers the whole operation, and a stalled attempt is abandoned
#[test]
fn stalled_request_times_out() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([Step::Stall]);
        let mut config = test_config();
        config.request_timeout_secs = 1;
        let client = client_with(config, dispatcher.clone()).await?;

        let started = Instant::now();
        let err = client.get_object("test-bucket", "key").await.unwrap_err();
        let elapsed = started.elapsed();

        assert_matches!(err, S3Error::Timeout { timeout } if timeout == Duration::from_secs(1));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_ge!(elapsed, Duration::from_secs(1));
        assert_lt!(elapsed, Duration::from_secs(5));

        Ok(())
    })
}

/// However many operations are started at once, no more than `max_concurrent_requests` attempts
/// are ever in flight
#[test]
fn in_flight_requests_are_bounded() -> Result<()> {
    test_with_logging(async move {
        const MAX_CONCURRENT: usize = 3;

        let dispatcher = ScriptedDispatcher::default().with_latency(Duration::from_millis(50));
        let mut config = test_config();
        config.max_concurrent_requests = MAX_CONCURRENT;
        let client = client_with(config, dispatcher.clone()).await?;

        let completed = Arc::new(AtomicUsize::new(0));
        let operations = (0..20).map(|i| {
            let client = client.clone();
            let completed = completed.clone();

            tokio::spawn(async move {
                client.get_object("test-bucket", &format!("key-{i}")).await?;
                completed.fetch_add(1, Ordering::SeqCst);

                Result::<_>::Ok(())
            })
        });

        for result in futures::future::join_all(operations).await {
            result??;
        }

        assert_eq!(completed.load(Ordering::SeqCst), 20);
        assert_eq!(dispatcher.attempts(), 20);
        assert_le!(dispatcher.max_in_flight(), MAX_CONCURRENT);
        assert_gt!(dispatcher.max_in_flight(), 1);

        Ok(())
    })
}

#[test]
fn list_buckets_parses_names() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([ok(LIST_BUCKETS)]);
        let client = client(dispatcher).await?;

        assert_eq!(client.list_buckets().await?, vec!["alpha", "beta"]);

        Ok(())
    })
}

#[test]
fn list_buckets_rejects_garbage() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::new([ok("this is not xml")]);
        let client = client(dispatcher).await?;

        let err = client.list_buckets().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);

        Ok(())
    })
}

/// Virtual-host addressing can't be forced onto a bucket name that isn't a DNS label, and the
/// failure happens before anything is sent
#[test]
fn invalid_virtual_host_bucket() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::default();
        let mut config = test_config();
        config.addressing_style = AddressingStyle::Virtual;
        let client = client_with(config, dispatcher.clone()).await?;

        let err = client.get_object("Not_A_Label", "key").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBucketNameForAddressing);
        assert_eq!(dispatcher.attempts(), 0);

        Ok(())
    })
}

/// Keys with `.` or `..` segments would be normalized out of the bucket by the URL layer, so
/// they're refused before anything is signed or sent
#[test]
fn dot_segment_keys_never_leave_the_client() -> Result<()> {
    test_with_logging(async move {
        let dispatcher = ScriptedDispatcher::default();
        let client = client(dispatcher.clone()).await?;

        for key in ["../other-bucket/x", "a/./b", "a/../../other-bucket/x"] {
            assert_matches!(
                client.get_object("test-bucket", key).await,
                Err(S3Error::InvalidObjectKey { key: ref rejected }) if rejected == key
            );
            assert_matches!(
                client.presigned_get_url("test-bucket", key, Duration::from_secs(60)),
                Err(S3Error::InvalidObjectKey { .. })
            );
        }
        assert_eq!(dispatcher.attempts(), 0);

        Ok(())
    })
}

/// With nowhere to get credentials from, building the client fails rather than sending unsigned
/// requests
#[test]
fn no_credentials_found() -> Result<()> {
    test_with_logging(async move {
        let result = S3Client::builder(test_config())
            .credentials_sources(vec![
                CredentialsSource::Static(Credentials::new("", "")),
                CredentialsSource::ProfileFile {
                    path: Some("/this/path/does/not/exist".into()),
                    profile: None,
                },
            ])
            .dispatcher(ScriptedDispatcher::default())
            .build()
            .await;

        assert_matches!(result, Err(S3Error::NoCredentialsFound { .. }));

        Ok(())
    })
}
