#![doc = include_str!("../README.md")]

mod addressing;
mod client;
mod config;
mod credentials;
mod dispatch;
mod error;
mod response;
mod retry;
mod signing;

pub use addressing::{encode_key, is_valid_dns_name, AddressingStyle, EndpointConfig, ResolvedEndpoint};
pub use client::{S3Client, S3ClientBuilder};
pub use config::Config;
pub use credentials::{default_chain, load as load_credentials, Credentials, CredentialsSource};
pub use dispatch::{DispatchErrorKind, Dispatcher, HttpDispatchError, HttpResponse, ReqwestDispatcher};
pub use error::{ErrorKind, Result, S3Error};
pub use response::{interpret, parse_bucket_names, S3Response};
pub use retry::{is_idempotent, Backoff, RetryPolicy};
pub use signing::{
    presign, sign, signing_key, verify, verify_canonical, PayloadHash, S3Request, SignedRequest,
    EMPTY_PAYLOAD_SHA256, MAX_PRESIGN_EXPIRY, UNSIGNED_PAYLOAD,
};
