//! Turning a bucket and object key into the URL and `Host` header of an S3 request.
//!
//! S3 and S3-compatible servers accept two conventions for naming the bucket:
//!
//! - Path style: `http://s3.example.com:9000/my-bucket/a/b.txt`
//! - Virtual-host style: `http://my-bucket.s3.example.com:9000/a/b.txt`
//!
//! Virtual-host style is the AWS default, but it only works for buckets whose names are valid DNS
//! labels, and it requires wildcard DNS which most minio deployments don't have.  That's why path
//! style still exists, and why both code paths need to be exercised by tests.
use crate::{Config, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::prelude::*;
use std::net::IpAddr;
use url::Url;

/// Region assumed when neither the config nor the environment specify one
pub(crate) const DEFAULT_REGION: &str = "us-east-1";

/// Everything except the SigV4 unreserved characters (`A-Z a-z 0-9 - _ . ~`) gets encoded.
pub(crate) const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Where the bucket name goes in the request.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AddressingStyle {
    /// Bucket is the first segment of the URL path
    Path,

    /// Bucket is a subdomain of the endpoint host
    Virtual,

    /// Virtual-host style when the bucket name and endpoint allow it, path style otherwise
    #[default]
    Auto,
}

/// The S3 endpoint that requests are sent to, and how buckets are addressed on it.
///
/// Immutable after construction; a client shares one instance among all of its requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    scheme: String,
    host: String,
    port: Option<u16>,
    region: String,
    addressing_style: AddressingStyle,
}

/// Output of [`EndpointConfig::resolve`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// The full request URL, without any query string
    pub url: Url,

    /// Value of the `Host` header, `host[:port]`
    pub host_header: String,

    /// The percent-encoded path component, which is also the canonical URI for signing
    pub path: String,

    /// `true` if the bucket ended up in the host name rather than the path
    pub virtual_hosted: bool,
}

impl EndpointConfig {
    /// Build an endpoint from its parts.
    ///
    /// The host must be a bare authority host (no scheme, path, or credentials).  A port equal
    /// to the scheme's default is dropped, so the `Host` header matches what HTTP clients send.
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
        region: impl Into<String>,
        addressing_style: AddressingStyle,
    ) -> Result<Self> {
        let scheme = scheme.into().to_ascii_lowercase();
        let host = host.into().to_ascii_lowercase();
        let region = region.into();

        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => 443,
            _ => {
                return crate::error::InvalidEndpointSnafu {
                    endpoint: host,
                    reason: format!("unsupported scheme '{scheme}', expected http or https"),
                }
                .fail()
            }
        };

        ensure!(
            is_valid_authority_host(&host),
            crate::error::InvalidEndpointSnafu {
                endpoint: host.clone(),
                reason: "the host is not a valid authority component",
            }
        );
        ensure!(
            !region.is_empty(),
            crate::error::InvalidEndpointSnafu {
                endpoint: host.clone(),
                reason: "the region is empty",
            }
        );

        Ok(Self {
            scheme,
            host,
            port: port.filter(|port| *port != default_port),
            region,
            addressing_style,
        })
    }

    /// Build an endpoint from an `http://host:port` style URL
    pub fn from_url(
        url: &Url,
        region: impl Into<String>,
        addressing_style: AddressingStyle,
    ) -> Result<Self> {
        let host = url.host_str().with_context(|| crate::error::InvalidEndpointSnafu {
            endpoint: url.to_string(),
            reason: "the URL has no host",
        })?;

        ensure!(
            url.path().is_empty() || url.path() == "/",
            crate::error::InvalidEndpointSnafu {
                endpoint: url.to_string(),
                reason: "the URL must not contain a path",
            }
        );

        Self::new(url.scheme(), host, url.port(), region, addressing_style)
    }

    /// Work out the endpoint described by the configuration.
    ///
    /// - An explicit `s3_endpoint` provides scheme, host, and port.
    /// - Without one, the AWS endpoint for the region is used.
    /// - A `target_domain` replaces the host with `s3.{region}.{target_domain}`, keeping the
    ///   scheme and port of the endpoint URL.
    pub fn from_config(config: &Config) -> Result<Self> {
        let region = config
            .aws_region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let (scheme, mut host, port) = match &config.s3_endpoint {
            Some(url) => {
                let endpoint = Self::from_url(url, region.clone(), config.addressing_style)?;
                (endpoint.scheme, endpoint.host, endpoint.port)
            }
            None => ("https".to_string(), aws_s3_host(&region), None),
        };

        if let Some(domain) = &config.target_domain {
            host = format!("s3.{region}.{}", domain.trim_matches('.'));
        }

        Self::new(scheme, host, port, region, config.addressing_style)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn addressing_style(&self) -> AddressingStyle {
        self.addressing_style
    }

    /// `host[:port]`
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }

    /// Produce the URL and `Host` header for an operation on `key` in `bucket`.
    ///
    /// An empty `key` addresses the bucket itself.  Fails with
    /// [`crate::S3Error::InvalidBucketNameForAddressing`] if virtual-host style is requested for
    /// a bucket name that can't be a DNS label.
    ///
    /// Keys with `.` or `..` segments are rejected with [`crate::S3Error::InvalidObjectKey`].
    /// URL normalization would remove those segments, so the request would go to a different
    /// path than the one signed, possibly outside the bucket.
    pub fn resolve(&self, bucket: &str, key: &str) -> Result<ResolvedEndpoint> {
        ensure!(
            !bucket.is_empty() && !is_dot_segment(bucket),
            crate::error::InvalidBucketNameForAddressingSnafu {
                bucket,
                style: self.addressing_style,
            }
        );
        ensure!(
            !key.split('/').any(is_dot_segment),
            crate::error::InvalidObjectKeySnafu { key }
        );

        let encoded_key = encode_key(key);

        if self.use_virtual_host(bucket)? {
            let host = format!("{bucket}.{}", self.host);
            let path = format!("/{encoded_key}");

            self.build(authority(&host, self.port), path, true)
        } else {
            let bucket = utf8_percent_encode(bucket, URI_ENCODE_SET).to_string();
            let path = if key.is_empty() {
                format!("/{bucket}")
            } else {
                format!("/{bucket}/{encoded_key}")
            };

            self.build(self.authority(), path, false)
        }
    }

    /// Endpoint for service-level operations that don't involve a bucket, like `ListBuckets`
    pub fn resolve_service(&self) -> Result<ResolvedEndpoint> {
        self.build(self.authority(), "/".to_string(), false)
    }

    fn use_virtual_host(&self, bucket: &str) -> Result<bool> {
        match self.addressing_style {
            AddressingStyle::Path => Ok(false),
            AddressingStyle::Virtual => {
                ensure!(
                    is_valid_dns_name(bucket),
                    crate::error::InvalidBucketNameForAddressingSnafu {
                        bucket,
                        style: AddressingStyle::Virtual,
                    }
                );
                Ok(true)
            }
            AddressingStyle::Auto => {
                // IP literals and `localhost` can't have subdomains, which is the usual situation
                // with a local minio
                Ok(is_valid_dns_name(bucket) && !host_is_ip_or_localhost(&self.host))
            }
        }
    }

    fn build(
        &self,
        host_header: String,
        path: String,
        virtual_hosted: bool,
    ) -> Result<ResolvedEndpoint> {
        let url = format!("{}://{host_header}{path}", self.scheme);
        let url = Url::parse(&url).map_err(|e| {
            crate::error::InvalidEndpointSnafu {
                endpoint: url.clone(),
                reason: e.to_string(),
            }
            .build()
        })?;

        // The signature covers `path`, so the URL that is actually sent must carry it unchanged
        ensure!(
            url.path() == path,
            crate::error::InvalidEndpointSnafu {
                endpoint: url.to_string(),
                reason: format!("the request path '{path}' would be sent as '{}'", url.path()),
            }
        );

        Ok(ResolvedEndpoint {
            url,
            host_header,
            path,
            virtual_hosted,
        })
    }
}

/// Percent-encode an object key one path segment at a time.
///
/// `/` is kept as a separator, everything outside the SigV4 unreserved set is encoded.  The
/// result is suitable for both the request path and values like `x-amz-copy-source`.
pub fn encode_key(key: impl AsRef<str>) -> String {
    key.as_ref()
        .split('/')
        .map(|segment| utf8_percent_encode(segment, URI_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// A literal `%2e` in a key is encoded to `%252e`, so only the bare dots need catching
fn is_dot_segment(segment: &str) -> bool {
    segment == "." || segment == ".."
}

/// Check whether `bucket` complies with the restricted DNS naming rules that virtual-host style
/// addressing needs: 3 to 63 characters of `[a-z0-9-]`, starting and ending with a letter or
/// digit.
///
/// `.` is legal in DNS, but a dotted bucket name breaks TLS validation against the wildcard
/// certificate of the endpoint, so such names are rejected too.
pub fn is_valid_dns_name(bucket: &str) -> bool {
    let bytes = bucket.as_bytes();

    if !(3..=63).contains(&bytes.len()) {
        return false;
    }

    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    alnum(&bytes[0])
        && alnum(&bytes[bytes.len() - 1])
        && bytes.iter().all(|b| alnum(b) || *b == b'-')
}

fn aws_s3_host(region: &str) -> String {
    if region.starts_with("cn-") {
        format!("s3.{region}.amazonaws.com.cn")
    } else {
        format!("s3.{region}.amazonaws.com")
    }
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_valid_authority_host(host: &str) -> bool {
    !host.is_empty()
        && !host.starts_with('.')
        && !host.ends_with('.')
        && !host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#' | '\\'))
}

fn host_is_ip_or_localhost(host: &str) -> bool {
    host == "localhost"
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
}
