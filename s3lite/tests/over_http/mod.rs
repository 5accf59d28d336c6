//! Tests of the client over real HTTP, against a scripted stub server on localhost.
//!
//! These exercise the production `reqwest` dispatcher end to end: what actually goes over the
//! wire, how transport failures are classified, and how raw responses are interpreted.
use crate::Result;
use assert_matches::assert_matches;
use http::{Method, StatusCode};
use s3lite::{
    AddressingStyle, Config, Credentials, DispatchErrorKind, ErrorKind, RetryPolicy, S3Client,
    S3Error,
};
use s3lite_testing::{
    logging::test_with_logging,
    stub_http::{StubResponse, StubServer},
};
use std::time::Duration;

const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message><Key>missing.txt</Key><BucketName>test-bucket</BucketName><Resource>/test-bucket/missing.txt</Resource><RequestId>17C2E6E8A8C1F2B0</RequestId><HostId>dd9025bab4ad464b049177c95eb6ebf374d3b3fd1af9251148b658df7ac2e3e8</HostId></Error>"#;

fn config_for_stub(stub: &StubServer, addressing_style: AddressingStyle) -> Config {
    Config {
        s3_endpoint: Some(stub.endpoint_url()),
        addressing_style,
        aws_region: Some("us-east-1".to_string()),
        disable_instance_metadata: true,
        request_timeout_secs: 10,
        ..Config::default()
    }
}

async fn client_for_stub(stub: &StubServer, addressing_style: AddressingStyle) -> Result<S3Client> {
    Ok(S3Client::builder(config_for_stub(stub, addressing_style))
        .credentials(Credentials::new("minioadmin", "minioadmin"))
        .retry_policy(RetryPolicy::no_backoff())
        .build()
        .await?)
}

/// The request on the wire is path-style, signed, and carries the hashed payload
#[test]
fn signed_path_style_request() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(200)
            .with_header("etag", "\"9b2cf535f27731c974343645a3985328\"")]).await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let response = client
            .put_object("test-bucket", "some dir/file.txt", "hello world", Some("text/plain"))
            .await?;
        assert_eq!(response.etag(), Some("\"9b2cf535f27731c974343645a3985328\""));
        assert_eq!(response.retries(), 0);

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];

        assert_eq!(request.method, "PUT");
        assert_eq!(request.target, "/test-bucket/some%20dir/file.txt");
        assert_eq!(request.header("host"), Some(stub.addr().to_string().as_str()));
        assert_eq!(request.header("content-type"), Some("text/plain"));
        assert_eq!(request.body, b"hello world");
        assert_eq!(
            request.header("x-amz-content-sha256"),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        assert!(request.header("x-amz-date").is_some());

        let authorization = request.header("authorization").unwrap();
        assert!(
            authorization.starts_with("AWS4-HMAC-SHA256 Credential=minioadmin/"),
            "{authorization}"
        );
        assert!(authorization.contains("/us-east-1/s3/aws4_request"), "{authorization}");
        assert!(authorization.contains("SignedHeaders="), "{authorization}");
        assert!(authorization.contains("Signature="), "{authorization}");

        Ok(())
    })
}

/// `Auto` can't use virtual hosts on an IP address, so it falls back to paths
#[test]
fn auto_addressing_on_ip_uses_path() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(200).with_body("contents")]).await?;
        let client = client_for_stub(&stub, AddressingStyle::Auto).await?;

        let response = client.get_object("test-bucket", "key.txt").await?;
        assert_eq!(response.body().as_ref(), b"contents");

        assert_eq!(stub.requests()[0].target, "/test-bucket/key.txt");

        Ok(())
    })
}

#[test]
fn server_error_then_success() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([
            StubResponse::new(500),
            StubResponse::new(200).with_body("finally"),
        ])
        .await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let response = client.get_object("test-bucket", "key.txt").await?;

        assert_eq!(response.body().as_ref(), b"finally");
        assert_eq!(response.retries(), 1);
        assert_eq!(stub.requests().len(), 2);

        Ok(())
    })
}

/// The server hanging up without answering counts as a transient network failure
#[test]
fn dropped_connection_is_retried() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([
            StubResponse::hang_up(),
            StubResponse::new(200).with_body("second time lucky"),
        ])
        .await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let response = client.get_object("test-bucket", "key.txt").await?;

        assert_eq!(response.body().as_ref(), b"second time lucky");
        assert_eq!(response.retries(), 1);
        assert_eq!(stub.requests().len(), 2);

        Ok(())
    })
}

#[test]
fn no_such_key() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(404)
            .with_header("content-type", "application/xml")
            .with_header("x-amz-request-id", "17C2E6E8A8C1F2B0")
            .with_body(NO_SUCH_KEY)])
        .await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let err = client
            .get_object("test-bucket", "missing.txt")
            .await
            .unwrap_err();

        assert_matches!(
            err,
            S3Error::Service { status, ref code, ref message, ref request_id, ref resource }
                if status == StatusCode::NOT_FOUND
                && code == "NoSuchKey"
                && message == "The specified key does not exist."
                && request_id.as_deref() == Some("17C2E6E8A8C1F2B0")
                && resource.as_deref() == Some("/test-bucket/missing.txt")
        );
        assert_eq!(stub.requests().len(), 1);

        Ok(())
    })
}

/// With no body to parse, the request ID still comes from the response headers
#[test]
fn head_error_takes_request_id_from_headers() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([
            StubResponse::new(403).with_header("x-amz-request-id", "0A49CE4060975EAC")
        ])
        .await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let err = client.head_object("test-bucket", "key").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Service);
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(err.request_id(), Some("0A49CE4060975EAC"));

        Ok(())
    })
}

#[test]
fn head_object_metadata() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(200)
            .with_header("etag", "\"d41d8cd98f00b204e9800998ecf8427e\"")
            .with_header("content-type", "image/png")
            .with_header("last-modified", "Mon, 12 Oct 2009 17:50:00 GMT")
            .with_header("x-amz-request-id", "318BC8BC148832E5")])
        .await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let response = client.head_object("test-bucket", "picture.png").await?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.etag(), Some("\"d41d8cd98f00b204e9800998ecf8427e\""));
        assert_eq!(response.content_type(), Some("image/png"));
        assert_eq!(response.request_id(), Some("318BC8BC148832E5"));
        assert_eq!(
            response.last_modified().map(|date| date.timestamp()),
            Some(1_255_369_800)
        );
        assert_eq!(stub.requests()[0].method, "HEAD");

        Ok(())
    })
}

#[test]
fn connection_refused() -> Result<()> {
    test_with_logging(async move {
        // Bind to get a free port, then close the listener so nothing is there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };

        let config = Config {
            s3_endpoint: Some(format!("http://127.0.0.1:{port}").parse()?),
            addressing_style: AddressingStyle::Path,
            disable_instance_metadata: true,
            ..Config::default()
        };
        let client = S3Client::builder(config)
            .credentials(Credentials::new("minioadmin", "minioadmin"))
            .retry_policy(RetryPolicy::never())
            .build()
            .await?;

        let err = client.list_buckets().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        assert_matches!(err, S3Error::HttpDispatch { ref source, .. } if source.kind() == DispatchErrorKind::Connect);

        Ok(())
    })
}

/// Anyone holding a presigned URL can use it without credentials of their own
#[test]
fn presigned_get_is_usable() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(200).with_body("shared contents")]).await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let url = client.presigned_get_url("test-bucket", "shared.txt", Duration::from_secs(300))?;

        let body = reqwest::get(url.clone()).await?.error_for_status()?.text().await?;
        assert_eq!(body, "shared contents");

        let request = &stub.requests()[0];
        assert_eq!(request.method, "GET");
        assert!(request.header("authorization").is_none());
        assert!(
            request
                .target
                .starts_with("/test-bucket/shared.txt?X-Amz-Algorithm=AWS4-HMAC-SHA256&"),
            "{}",
            request.target
        );
        assert!(request.target.contains("X-Amz-Expires=300"), "{}", request.target);
        assert!(request.target.contains("X-Amz-Signature="), "{}", request.target);

        Ok(())
    })
}

/// A presigned DELETE carries its `versionId` and works with a plain HTTP client
#[test]
fn presigned_delete_of_version() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(204)]).await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let request = client
            .request(Method::DELETE, "test-bucket", "old.txt")?
            .with_query("versionId", "3sL4kqtJlcpXroDTDmJ+rmSpXd3dIbrHY");
        let url = client.presigned_url(&request, Duration::from_secs(300))?;

        reqwest::Client::new()
            .delete(url)
            .send()
            .await?
            .error_for_status()?;

        let request = &stub.requests()[0];
        assert_eq!(request.method, "DELETE");
        assert!(request.target.starts_with("/test-bucket/old.txt?"), "{}", request.target);
        assert!(
            request
                .target
                .contains("versionId=3sL4kqtJlcpXroDTDmJ%2BrmSpXd3dIbrHY"),
            "{}",
            request.target
        );

        Ok(())
    })
}

/// A presigned PUT with a signed content type is only good for uploads that send that header
#[test]
fn presigned_put_with_content_type() -> Result<()> {
    test_with_logging(async move {
        let stub = StubServer::start([StubResponse::new(200)]).await?;
        let client = client_for_stub(&stub, AddressingStyle::Path).await?;

        let request = client
            .request(Method::PUT, "test-bucket", "report.json")?
            .with_header("content-type", "application/json");
        let url = client.presigned_url(&request, Duration::from_secs(300))?;

        assert!(url
            .query_pairs()
            .any(|(name, value)| name == "X-Amz-SignedHeaders" && value == "content-type;host"));

        reqwest::Client::new()
            .put(url)
            .header("content-type", "application/json")
            .body("{}")
            .send()
            .await?
            .error_for_status()?;

        let request = &stub.requests()[0];
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body, b"{}");

        Ok(())
    })
}
