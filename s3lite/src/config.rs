use crate::AddressingStyle;
use std::{fmt, time::Duration};
use url::Url;

/// The configuration settings that control how the client finds, authenticates to, and talks
/// to the object storage service.
///
/// Every setting can also be provided through the environment.  With the `clap` feature this
/// happens as part of argument parsing; without it, use [`Config::from_env`].
#[derive(Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service like minio.  Only the scheme,
    /// host and port are used.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, value_name = "URL", env = "S3_ENDPOINT")
    )]
    pub s3_endpoint: Option<Url>,

    /// How the bucket name is put into request URLs.
    ///
    /// `path` puts it in the URL path, `virtual` puts it in the host name, `auto` uses the host
    /// name when the bucket name and endpoint allow it.
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            global = true,
            value_enum,
            default_value = "auto",
            env = "S3_ADDRESSING_STYLE"
        )
    )]
    pub addressing_style: AddressingStyle,

    /// Send requests to `s3.{region}.{target_domain}` instead of the host in the endpoint URL.
    ///
    /// The scheme and port of the endpoint URL are kept.  Useful with wildcard DNS in front of a
    /// local S3-compatible server, to exercise virtual-host-style addressing.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, value_name = "DOMAIN", env = "S3_TARGET_DOMAIN")
    )]
    pub target_domain: Option<String>,

    /// The AWS region.  Defaults to `us-east-1`.
    #[cfg_attr(feature = "clap", clap(long, global = true, env = "AWS_REGION"))]
    pub aws_region: Option<String>,

    /// Access key ID to use instead of looking up credentials in the usual places
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)
    )]
    pub aws_access_key_id: Option<String>,

    /// Secret access key to use along with `aws_access_key_id`
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)
    )]
    pub aws_secret_access_key: Option<String>,

    /// Session token, if the access key is temporary
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "AWS_SESSION_TOKEN", hide_env_values = true)
    )]
    pub aws_session_token: Option<String>,

    /// Don't try to get credentials from the EC2 instance metadata service
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "AWS_EC2_METADATA_DISABLED")
    )]
    pub disable_instance_metadata: bool,

    /// The maximum number of requests to the object storage service in flight at once.
    ///
    /// This also caps the number of idle connections kept in the pool.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// How many times a request that failed with a transient error is retried
    #[cfg_attr(feature = "clap", clap(long, default_value = "3", global = true))]
    pub max_retries: usize,

    /// Deadline in seconds for a request to complete, including any retries
    #[cfg_attr(feature = "clap", clap(long, default_value = "60", global = true))]
    pub request_timeout_secs: u64,
}

impl Config {
    /// Build a config from the default values, overridden by whichever of the environment
    /// variables `S3_ENDPOINT`, `S3_ADDRESSING_STYLE`, `S3_TARGET_DOMAIN`, `AWS_REGION`,
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN` and
    /// `AWS_EC2_METADATA_DISABLED` are set.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let mut config = Self::default();

        if let Some(endpoint) = var("S3_ENDPOINT") {
            let url = Url::parse(&endpoint).map_err(|e| crate::S3Error::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
            config.s3_endpoint = Some(url);
        }

        if let Some(style) = var("S3_ADDRESSING_STYLE") {
            config.addressing_style =
                style
                    .parse()
                    .map_err(|_| crate::S3Error::InvalidAddressingStyle {
                        value: style.clone(),
                    })?;
        }

        config.target_domain = var("S3_TARGET_DOMAIN");
        config.aws_region = var("AWS_REGION");
        config.aws_access_key_id = var("AWS_ACCESS_KEY_ID");
        config.aws_secret_access_key = var("AWS_SECRET_ACCESS_KEY");
        config.aws_session_token = var("AWS_SESSION_TOKEN");
        config.disable_instance_metadata = var("AWS_EC2_METADATA_DISABLED")
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false);

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        // XXX: This is duplicated here and in the `clap` attributes; there's no way around that
        // short of unconditionally depending on clap in the lib crate
        Self {
            s3_endpoint: None,
            addressing_style: AddressingStyle::Auto,
            target_domain: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            disable_instance_metadata: false,
            max_concurrent_requests: 10,
            max_retries: 3,
            request_timeout_secs: 60,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "** redacted **");

        f.debug_struct("Config")
            .field("s3_endpoint", &self.s3_endpoint)
            .field("addressing_style", &self.addressing_style)
            .field("target_domain", &self.target_domain)
            .field("aws_region", &self.aws_region)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field(
                "aws_secret_access_key",
                &redacted(&self.aws_secret_access_key),
            )
            .field("aws_session_token", &redacted(&self.aws_session_token))
            .field("disable_instance_metadata", &self.disable_instance_metadata)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("max_retries", &self.max_retries)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}
