//! AWS Signature Version 4 for S3.
//!
//! [`sign`] turns an [`S3Request`] into a [`SignedRequest`] carrying an `Authorization` header;
//! [`presign`] produces a URL with query-string authentication instead.  Both are pure functions
//! of their inputs, including the timestamp, which is what makes them testable against the
//! examples in the AWS documentation.
use crate::{
    addressing::{ResolvedEndpoint, URI_ENCODE_SET},
    Credentials, Result,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::Method;
use percent_encoding::utf8_percent_encode;
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use std::{collections::BTreeMap, time::Duration};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash value that tells S3 the body is not covered by the signature
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// `hex(sha256(""))`
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Presigned URLs can't be valid for longer than this
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SERVICE: &str = "s3";

/// What goes into `x-amz-content-sha256`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadHash {
    /// Lowercase hex SHA-256 of the body
    Sha256(String),

    /// `UNSIGNED-PAYLOAD`
    Unsigned,
}

impl PayloadHash {
    pub fn of(body: &[u8]) -> Self {
        if body.is_empty() {
            Self::Sha256(EMPTY_PAYLOAD_SHA256.to_string())
        } else {
            Self::Sha256(hex::encode(Sha256::digest(body)))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Sha256(hash) => hash,
            Self::Unsigned => UNSIGNED_PAYLOAD,
        }
    }
}

/// A request to S3 that hasn't been signed yet.
#[derive(Clone, Debug)]
pub struct S3Request {
    method: Method,
    endpoint: ResolvedEndpoint,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    body: Bytes,
    payload: PayloadHash,
}

impl S3Request {
    /// A request with an empty body
    pub fn new(method: Method, endpoint: ResolvedEndpoint) -> Self {
        Self {
            method,
            endpoint,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
            payload: PayloadHash::of(&[]),
        }
    }

    /// Add a query parameter.  Names and values are given unencoded.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add a header.  The name is lowercased; setting the same header twice keeps the last value.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body, and sign its SHA-256
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.payload = PayloadHash::of(&self.body);
        self
    }

    /// Set the body without hashing it.  The request will be signed with `UNSIGNED-PAYLOAD`.
    pub fn with_unsigned_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.payload = PayloadHash::Unsigned;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    pub fn payload_hash(&self) -> &PayloadHash {
        &self.payload
    }
}

/// A request carrying a SigV4 `Authorization` header, ready to be dispatched.
///
/// Signing consumes the [`S3Request`]; nothing about the result can be changed without
/// invalidating the signature, so there are no setters.
#[derive(Clone, Debug)]
pub struct SignedRequest {
    method: Method,
    url: Url,
    canonical_uri: String,
    canonical_query: String,
    headers: BTreeMap<String, String>,
    signed_headers: String,
    payload: PayloadHash,
    timestamp: DateTime<Utc>,
    scope: String,
    signature: String,
    body: Bytes,
}

impl SignedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL to send the request to, including the canonical query string
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn canonical_uri(&self) -> &str {
        &self.canonical_uri
    }

    pub fn canonical_query(&self) -> &str {
        &self.canonical_query
    }

    /// All headers, lowercase names, including `authorization`
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `;`-separated list of the headers covered by the signature
    pub fn signed_headers(&self) -> &str {
        &self.signed_headers
    }

    pub fn payload_hash(&self) -> &PayloadHash {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// `{yyyymmdd}/{region}/s3/aws4_request`
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Reconstruct the canonical request this signature was computed over
    pub fn canonical_request(&self) -> String {
        let headers = self
            .signed_headers
            .split(';')
            .map(|name| (name, self.headers.get(name).map(String::as_str).unwrap_or("")));

        canonical_request(
            self.method.as_str(),
            &self.canonical_uri,
            &self.canonical_query,
            headers,
            &self.signed_headers,
            self.payload.as_str(),
        )
    }

    /// See [`crate::retry::is_idempotent`]
    pub fn is_idempotent(&self) -> bool {
        crate::retry::is_idempotent(&self.method, &self.payload)
    }
}

/// Sign `request` as of `timestamp`.
///
/// Every header on the request is signed, plus `host`, `x-amz-date`, `x-amz-content-sha256`, and
/// `x-amz-security-token` if the credentials carry a session token.
pub fn sign(
    request: S3Request,
    credentials: &Credentials,
    region: &str,
    timestamp: DateTime<Utc>,
) -> Result<SignedRequest> {
    ensure!(
        credentials.is_complete(),
        crate::error::MissingCredentialsSnafu
    );

    let S3Request {
        method,
        endpoint,
        query,
        mut headers,
        body,
        payload,
    } = request;

    let amz_date = amz_date(timestamp);
    let scope = scope(timestamp, region);

    headers.insert("host".to_string(), endpoint.host_header.clone());
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    headers.insert(
        "x-amz-content-sha256".to_string(),
        payload.as_str().to_string(),
    );
    if let Some(token) = credentials.session_token() {
        headers.insert("x-amz-security-token".to_string(), token.to_string());
    }

    let canonical_query = canonical_query_string(&query);
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = canonical_request(
        method.as_str(),
        &endpoint.path,
        &canonical_query,
        headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
        &signed_headers,
        payload.as_str(),
    );

    let key = signing_key(credentials.secret_access_key(), timestamp, region, SERVICE);
    let signature = hex::encode(hmac_sha256(
        &key,
        string_to_sign(&amz_date, &scope, &canonical_request).as_bytes(),
    ));

    headers.insert(
        "authorization".to_string(),
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id()
        ),
    );

    let mut url = endpoint.url;
    url.set_query((!canonical_query.is_empty()).then_some(canonical_query.as_str()));

    Ok(SignedRequest {
        method,
        url,
        canonical_uri: endpoint.path,
        canonical_query,
        headers,
        signed_headers,
        payload,
        timestamp,
        scope,
        signature,
        body,
    })
}

/// Check that the signature on `request` is what `credentials` would have produced.
///
/// The comparison is constant time.
pub fn verify(request: &SignedRequest, credentials: &Credentials, region: &str) -> bool {
    verify_canonical(
        &request.canonical_request(),
        request.timestamp,
        &request.signature,
        credentials,
        region,
    )
}

/// Check `signature` against an arbitrary canonical request
pub fn verify_canonical(
    canonical_request: &str,
    timestamp: DateTime<Utc>,
    signature: &str,
    credentials: &Credentials,
    region: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };

    let key = signing_key(credentials.secret_access_key(), timestamp, region, SERVICE);
    let string_to_sign = string_to_sign(
        &amz_date(timestamp),
        &scope(timestamp, region),
        canonical_request,
    );

    let mut mac = HmacSha256::new_from_slice(&key).expect("BUG: HMAC can take key of any size");
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// Produce a presigned URL for `request`, valid for `expires_in` from `timestamp`.
///
/// The request's query parameters are carried in the URL, and its headers are signed along with
/// `host`, so whoever uses the URL must send exactly those headers (a `content-type`, SSE-C
/// keys, and so on).  The payload is `UNSIGNED-PAYLOAD`, so any body is accepted.
pub fn presign(
    request: &S3Request,
    credentials: &Credentials,
    region: &str,
    timestamp: DateTime<Utc>,
    expires_in: Duration,
) -> Result<Url> {
    ensure!(
        credentials.is_complete(),
        crate::error::MissingCredentialsSnafu
    );
    ensure!(
        expires_in <= MAX_PRESIGN_EXPIRY,
        crate::error::PresignExpiryTooLongSnafu {
            requested: expires_in
        }
    );

    let amz_date = amz_date(timestamp);
    let scope = scope(timestamp, region);

    let mut query = request.query.clone();
    query.push(("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()));
    query.push((
        "X-Amz-Credential".to_string(),
        format!("{}/{scope}", credentials.access_key_id()),
    ));
    query.push(("X-Amz-Date".to_string(), amz_date.clone()));
    query.push((
        "X-Amz-Expires".to_string(),
        expires_in.as_secs().to_string(),
    ));
    let mut headers = request.headers.clone();
    headers.insert("host".to_string(), request.endpoint.host_header.clone());
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    query.push(("X-Amz-SignedHeaders".to_string(), signed_headers.clone()));
    if let Some(token) = credentials.session_token() {
        query.push(("X-Amz-Security-Token".to_string(), token.to_string()));
    }

    let canonical_query = canonical_query_string(&query);
    let canonical_request = canonical_request(
        request.method.as_str(),
        &request.endpoint.path,
        &canonical_query,
        headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
        &signed_headers,
        UNSIGNED_PAYLOAD,
    );

    let key = signing_key(credentials.secret_access_key(), timestamp, region, SERVICE);
    let signature = hex::encode(hmac_sha256(
        &key,
        string_to_sign(&amz_date, &scope, &canonical_request).as_bytes(),
    ));

    let mut url = request.endpoint.url.clone();
    url.set_query(Some(&format!(
        "{canonical_query}&X-Amz-Signature={signature}"
    )));

    Ok(url)
}

/// Derive the signing key: `HMAC("AWS4" + secret, date) -> region -> service -> "aws4_request"`
pub fn signing_key(
    secret_access_key: &str,
    timestamp: DateTime<Utc>,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let date = timestamp.format("%Y%m%d").to_string();

    let k_date = hmac_sha256(
        format!("AWS4{secret_access_key}").as_bytes(),
        date.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());

    hmac_sha256(&k_service, b"aws4_request")
}

fn amz_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

fn scope(timestamp: DateTime<Utc>, region: &str) -> String {
    format!(
        "{}/{region}/{SERVICE}/aws4_request",
        timestamp.format("%Y%m%d")
    )
}

fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

fn canonical_request<'a>(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: impl Iterator<Item = (&'a str, &'a str)>,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in headers {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(&collapse_whitespace(value));
        canonical_headers.push('\n');
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    )
}

/// Encode every name and value (`/` included) and sort by name, then value
fn canonical_query_string(query: &[(String, String)]) -> String {
    let mut pairs = query
        .iter()
        .map(|(name, value)| {
            (
                utf8_percent_encode(name, URI_ENCODE_SET).to_string(),
                utf8_percent_encode(value, URI_ENCODE_SET).to_string(),
            )
        })
        .collect::<Vec<_>>();
    pairs.sort();

    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Trim, and collapse runs of inner whitespace to one space
fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("BUG: HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
