//! Resolving the AWS access key pair used to sign requests.
//!
//! Credentials are looked up once, when the client is built, by walking a list of
//! [`CredentialsSource`]s in order.  The first source that yields a complete key pair wins.
//! Sources that are empty or fail are skipped, but logged, so that "why did it pick up those
//! keys" questions can be answered from the debug log.
use crate::{Config, Result};
use snafu::prelude::*;
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, instrument};
use url::Url;

const DEFAULT_INSTANCE_METADATA_ENDPOINT: &str = "http://169.254.169.254";
const DEFAULT_INSTANCE_METADATA_TIMEOUT: Duration = Duration::from_secs(1);
const INSTANCE_METADATA_TOKEN_TTL_SECS: &str = "21600";

/// An AWS access key pair, optionally with a session token for temporary credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, session_token: impl Into<String>) -> Self {
        let session_token = session_token.into();

        self.session_token = (!session_token.is_empty()).then_some(session_token);
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Both halves of the key pair are present.  An empty string counts as absent.
    pub fn is_complete(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .finish()
    }
}

/// A place credentials can come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialsSource {
    /// Credentials provided directly, usually from [`Config`]
    Static(Credentials),

    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    Environment,

    /// An INI-style shared credentials file.
    ///
    /// `path` defaults to `$AWS_SHARED_CREDENTIALS_FILE` or `~/.aws/credentials`; `profile`
    /// defaults to `$AWS_PROFILE` or `default`.
    ProfileFile {
        path: Option<PathBuf>,
        profile: Option<String>,
    },

    /// The EC2 instance metadata service, using the IMDSv2 session token flow
    InstanceMetadata { endpoint: Url, timeout: Duration },
}

impl CredentialsSource {
    /// The instance metadata service at its usual link-local address, or at
    /// `$AWS_EC2_METADATA_SERVICE_ENDPOINT` if that's set
    pub fn instance_metadata() -> Self {
        let endpoint = std::env::var("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .ok()
            .and_then(|endpoint| match Url::parse(&endpoint) {
                Ok(url) => Some(url),
                Err(e) => {
                    debug!(%endpoint, err = %e, "Ignoring invalid instance metadata endpoint");
                    None
                }
            })
            .unwrap_or_else(|| {
                Url::parse(DEFAULT_INSTANCE_METADATA_ENDPOINT)
                    .expect("BUG: default instance metadata endpoint is a valid URL")
            });

        Self::InstanceMetadata {
            endpoint,
            timeout: DEFAULT_INSTANCE_METADATA_TIMEOUT,
        }
    }
}

impl fmt::Display for CredentialsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => write!(f, "static configuration"),
            Self::Environment => write!(f, "environment variables"),
            Self::ProfileFile { path, profile } => {
                write!(f, "credentials file")?;
                if let Some(path) = path {
                    write!(f, " '{}'", path.display())?;
                }
                if let Some(profile) = profile {
                    write!(f, " (profile '{profile}')")?;
                }
                Ok(())
            }
            Self::InstanceMetadata { endpoint, .. } => {
                write!(f, "instance metadata service at {endpoint}")
            }
        }
    }
}

/// The usual lookup order: explicit configuration, environment, shared credentials file,
/// instance metadata.
pub fn default_chain(config: &Config) -> Vec<CredentialsSource> {
    let mut sources = Vec::with_capacity(4);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        let mut credentials = Credentials::new(access_key_id, secret_access_key);
        if let Some(session_token) = &config.aws_session_token {
            credentials = credentials.with_session_token(session_token);
        }

        sources.push(CredentialsSource::Static(credentials));
    }

    sources.push(CredentialsSource::Environment);
    sources.push(CredentialsSource::ProfileFile {
        path: None,
        profile: None,
    });

    if !config.disable_instance_metadata {
        sources.push(CredentialsSource::instance_metadata());
    }

    sources
}

/// Try each source in order and return the first complete key pair.
///
/// A source that fails is skipped, but its error is kept and reported in
/// [`crate::S3Error::NoCredentialsFound`] if no source has credentials.
#[instrument(skip_all, fields(sources = sources.len()))]
pub async fn load(sources: &[CredentialsSource]) -> Result<Credentials> {
    let mut tried = Vec::with_capacity(sources.len());

    for source in sources {
        match load_from(source).await {
            Ok(Some(credentials)) => {
                debug!(%source, access_key_id = %credentials.access_key_id(),
                    "Loaded credentials");
                return Ok(credentials);
            }
            Ok(None) => {
                debug!(%source, "No credentials available from this source");
                tried.push(source.to_string());
            }
            Err(e) => {
                debug!(%source, err = ?e, "Error loading credentials from this source; skipping");
                tried.push(format!("{source} (failed: {})", error_chain(&e)));
            }
        }
    }

    crate::error::NoCredentialsFoundSnafu {
        sources: tried.join(", "),
    }
    .fail()
}

/// `err` and all of its causes on one line
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

async fn load_from(source: &CredentialsSource) -> Result<Option<Credentials>> {
    let credentials = match source {
        CredentialsSource::Static(credentials) => Some(credentials.clone()),
        CredentialsSource::Environment => from_lookup(|name| std::env::var(name).ok()),
        CredentialsSource::ProfileFile { path, profile } => {
            let path = match path {
                Some(path) => path.clone(),
                None => match default_credentials_file() {
                    Some(path) => path,
                    None => return Ok(None),
                },
            };
            let profile = profile
                .clone()
                .or_else(|| std::env::var("AWS_PROFILE").ok())
                .unwrap_or_else(|| "default".to_string());

            from_profile_file(&path, &profile)?
        }
        CredentialsSource::InstanceMetadata { endpoint, timeout } => {
            from_instance_metadata(endpoint, *timeout).await?
        }
    };

    Ok(credentials.filter(Credentials::is_complete))
}

/// Read credentials from environment-style variables, via `lookup`.
///
/// The legacy `AWS_ACCESS_KEY` and `AWS_SECRET_KEY` names are accepted when the standard ones
/// aren't set.
fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Credentials> {
    let var = |names: &[&str]| {
        names
            .iter()
            .filter_map(|name| lookup(*name))
            .find(|value| !value.is_empty())
    };

    let access_key_id = var(&["AWS_ACCESS_KEY_ID", "AWS_ACCESS_KEY"])?;
    let secret_access_key = var(&["AWS_SECRET_ACCESS_KEY", "AWS_SECRET_KEY"])?;

    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Some(session_token) = var(&["AWS_SESSION_TOKEN"]) {
        credentials = credentials.with_session_token(session_token);
    }

    Some(credentials)
}

fn default_credentials_file() -> Option<PathBuf> {
    std::env::var_os("AWS_SHARED_CREDENTIALS_FILE")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".aws").join("credentials")))
}

fn from_profile_file(path: &Path, profile: &str) -> Result<Option<Credentials>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).context(crate::error::ProfileFileSnafu {
                path: path.to_owned(),
            })
        }
    };

    let profiles = parse_profiles(&contents);
    let Some(values) = profiles.get(profile) else {
        return Ok(None);
    };

    let lookup = |name: &str| values.get(&name.to_ascii_lowercase()).cloned();

    let (Some(access_key_id), Some(secret_access_key)) =
        (lookup("aws_access_key_id"), lookup("aws_secret_access_key"))
    else {
        return Ok(None);
    };

    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Some(session_token) = lookup("aws_session_token") {
        credentials = credentials.with_session_token(session_token);
    }

    Ok(Some(credentials))
}

/// Parse an INI-style credentials file into `profile -> key -> value`.
///
/// Both `[name]` and the config-file style `[profile name]` headers are understood.  Keys are
/// lowercased; lines that aren't sections or `key = value` pairs are ignored.
fn parse_profiles(contents: &str) -> HashMap<String, HashMap<String, String>> {
    let mut profiles: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in contents.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let section = section.trim();
            let name = section
                .strip_prefix("profile ")
                .map(str::trim)
                .unwrap_or(section);

            profiles.entry(name.to_string()).or_default();
            current = Some(name.to_string());
        } else if let (Some(profile), Some((key, value))) = (&current, line.split_once('=')) {
            profiles
                .entry(profile.clone())
                .or_default()
                .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    profiles
}

/// IMDSv2: get a session token, find the instance role, fetch that role's credentials
async fn from_instance_metadata(endpoint: &Url, timeout: Duration) -> Result<Option<Credentials>> {
    let base = endpoint.as_str().trim_end_matches('/');

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context(crate::error::InstanceMetadataSnafu)?;

    let token = client
        .put(format!("{base}/latest/api/token"))
        .header(
            "x-aws-ec2-metadata-token-ttl-seconds",
            INSTANCE_METADATA_TOKEN_TTL_SECS,
        )
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .context(crate::error::InstanceMetadataSnafu)?
        .text()
        .await
        .context(crate::error::InstanceMetadataSnafu)?;

    let get = |path: String| {
        client
            .get(format!("{base}/latest/meta-data/iam/security-credentials/{path}"))
            .header("x-aws-ec2-metadata-token", token.trim())
            .send()
    };

    let roles = get(String::new())
        .await
        .and_then(|response| response.error_for_status())
        .context(crate::error::InstanceMetadataSnafu)?
        .text()
        .await
        .context(crate::error::InstanceMetadataSnafu)?;

    let Some(role) = roles.lines().map(str::trim).find(|role| !role.is_empty()) else {
        debug!("Instance has no IAM role attached");
        return Ok(None);
    };

    let document = get(role.to_string())
        .await
        .and_then(|response| response.error_for_status())
        .context(crate::error::InstanceMetadataSnafu)?
        .text()
        .await
        .context(crate::error::InstanceMetadataSnafu)?;

    let document: serde_json::Value =
        serde_json::from_str(&document).context(crate::error::InstanceMetadataDocumentSnafu)?;

    let field = |name: &str| document.get(name).and_then(|value| value.as_str());

    let (Some(access_key_id), Some(secret_access_key)) =
        (field("AccessKeyId"), field("SecretAccessKey"))
    else {
        return Ok(None);
    };

    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Some(token) = field("Token") {
        credentials = credentials.with_session_token(token);
    }

    debug!(role, "Loaded credentials for instance role");

    Ok(Some(credentials))
}
