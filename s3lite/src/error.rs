use crate::addressing::AddressingStyle;
use crate::dispatch::HttpDispatchError;
use http::StatusCode;
use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T, E = S3Error> = std::result::Result<T, E>;

/// Coarse classification of every [`S3Error`] variant.
///
/// Callers that only care about how to react to a failure (retry, fix configuration, report the
/// server's complaint) can match on this instead of the full error enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    MissingCredentials,
    NoCredentialsFound,
    InvalidBucketNameForAddressing,
    InvalidConfiguration,
    InvalidRequest,
    /// Connection failures, resets, and similar network trouble.  Retried per the retry policy.
    TransientNetwork,
    /// The caller-supplied deadline for the whole request (retries included) elapsed
    Timeout,
    /// The server answered with an error status and an S3 error envelope (or no body at all)
    Service,
    UnparseableErrorResponse,
    MalformedResponse,
    CredentialSource,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum S3Error {
    #[snafu(display("No access key and secret key are available to sign the request"))]
    MissingCredentials,

    #[snafu(display(
        "Unable to find AWS credentials in any of the configured sources: {sources}"
    ))]
    NoCredentialsFound { sources: String },

    #[snafu(display(
        "The bucket name '{bucket}' is not a valid DNS label, so it can't be used with {style} addressing.  Use path-style addressing for this bucket"
    ))]
    InvalidBucketNameForAddressing {
        bucket: String,
        style: AddressingStyle,
    },

    #[snafu(display("The S3 endpoint '{endpoint}' can't be used: {reason}"))]
    InvalidEndpoint { endpoint: String, reason: String },

    #[snafu(display(
        "'{value}' is not a valid addressing style.  Supported styles are: path, virtual, auto"
    ))]
    InvalidAddressingStyle { value: String },

    #[snafu(display(
        "The object key '{key}' contains a '.' or '..' path segment, which HTTP clients and servers collapse, so it can't be addressed"
    ))]
    InvalidObjectKey { key: String },

    #[snafu(display("The byte range {start}..{end} is empty"))]
    InvalidRange { start: u64, end: u64 },

    #[snafu(display(
        "Presigned URLs can be valid for at most 7 days, but {requested:?} was requested"
    ))]
    PresignExpiryTooLong { requested: Duration },

    #[snafu(display("Error building the HTTP client"))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("Error sending request to '{url}'"))]
    HttpDispatch {
        url: String,
        source: HttpDispatchError,
    },

    #[snafu(display(
        "S3 request failed with HTTP {status}: {code}: {message} (request ID: {})",
        request_id.as_deref().unwrap_or("<none>")
    ))]
    Service {
        status: StatusCode,
        code: String,
        message: String,
        request_id: Option<String>,
        resource: Option<String>,
    },

    #[snafu(display(
        "S3 request failed with HTTP {status}, and the error response body could not be parsed: {body}"
    ))]
    UnparseableErrorResponse { status: StatusCode, body: String },

    #[snafu(display("The response from S3 could not be parsed: {message}"))]
    MalformedResponse { message: String },

    #[snafu(display("The request did not complete within {timeout:?}"))]
    Timeout { timeout: Duration },

    #[snafu(display("Error reading credentials from the instance metadata service"))]
    InstanceMetadata { source: reqwest::Error },

    #[snafu(display("The instance metadata service returned an invalid credentials document"))]
    InstanceMetadataDocument { source: serde_json::Error },

    #[snafu(display("Error reading AWS credentials file '{}'", path.display()))]
    ProfileFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl S3Error {
    /// The taxonomy bucket this error falls into
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCredentials => ErrorKind::MissingCredentials,
            Self::NoCredentialsFound { .. } => ErrorKind::NoCredentialsFound,
            Self::InvalidBucketNameForAddressing { .. } => ErrorKind::InvalidBucketNameForAddressing,
            Self::InvalidEndpoint { .. }
            | Self::InvalidAddressingStyle { .. }
            | Self::HttpClient { .. } => ErrorKind::InvalidConfiguration,
            Self::InvalidObjectKey { .. }
            | Self::InvalidRange { .. }
            | Self::PresignExpiryTooLong { .. } => {
                ErrorKind::InvalidRequest
            }
            Self::HttpDispatch { source, .. } => {
                if source.is_transient() {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::InvalidRequest
                }
            }
            Self::Service { .. } => ErrorKind::Service,
            Self::UnparseableErrorResponse { .. } => ErrorKind::UnparseableErrorResponse,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InstanceMetadata { .. }
            | Self::InstanceMetadataDocument { .. }
            | Self::ProfileFile { .. } => ErrorKind::CredentialSource,
        }
    }

    /// The HTTP status the server responded with, if this error came from a response
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Service { status, .. } | Self::UnparseableErrorResponse { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// The request ID the server assigned to the failed request, if it reported one.
    ///
    /// This is the first thing S3 (or minio) support will ask for.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Service { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Default retry predicate: network trouble, 5xx responses, and throttling (429) are
    /// transient; everything else is permanent.
    ///
    /// Note that an unparseable error body doesn't change the verdict; a 503 with garbage in the
    /// body is still a 503.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpDispatch { source, .. } => source.is_transient(),
            Self::Service { status, .. } | Self::UnparseableErrorResponse { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}
