//! Ephemeral minio servers to test against.
//!
//! The server is started from the `minio` binary if one can be found (`MINIO_PATH`, then
//! `PATH`), and otherwise as a Docker container.  Either way it listens on a random localhost port
//! with the default `minioadmin` credentials, and is torn down when the last reference to it is
//! dropped.
use crate::Result;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use s3lite::{AddressingStyle, Config, Credentials, RetryPolicy, S3Client};
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

pub const MINIO_ACCESS_KEY: &str = "minioadmin";
pub const MINIO_SECRET_KEY: &str = "minioadmin";
pub const MINIO_REGION: &str = "us-east-1";

const MINIO_IMAGE: &str = "minio/minio";

/// How the server process was launched, and what has to be cleaned up afterwards
enum Launch {
    Binary {
        #[allow(dead_code)] // Never read, but the data dir must live as long as the server
        data_dir: TempDir,
    },
    Docker {
        container: String,
    },
}

pub struct MinioServer {
    launch: Launch,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Re-use the server other tests are already using, or start one if there isn't one.
    ///
    /// Starting minio takes a while, particularly on CI, so tests should use this rather than
    /// [`Self::start`].
    pub async fn get() -> Result<Arc<Self>> {
        // A tokio Mutex, because the lock is held while the server starts
        static INSTANCE: Lazy<Mutex<Weak<MinioServer>>> = Lazy::new(|| Mutex::new(Weak::new()));

        let mut instance = INSTANCE.lock().await;

        let server = match instance.upgrade() {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *instance = Arc::downgrade(&server);

                server
            }
        };

        debug!(endpoint = %server.endpoint, "get() found minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server on a random high port.
    ///
    /// If `S3_TARGET_DOMAIN` is set, the server is told that it's reachable at
    /// `s3.us-east-1.{S3_TARGET_DOMAIN}`, which is what makes virtual-host-style requests work
    /// given wildcard DNS for that domain.
    pub async fn start() -> Result<Self> {
        let endpoint = Self::random_endpoint()?;

        let (launch, handle) = match Self::find_minio() {
            Some(path) => {
                let data_dir = Self::temp_data_dir()?;

                let mut cmd = duct::cmd!(
                    path,
                    "server",
                    data_dir.path(),
                    "--address",
                    endpoint.to_string(),
                    "--quiet"
                );
                if let Some(domain) = Self::minio_domain() {
                    cmd = cmd.env("MINIO_DOMAIN", domain);
                }

                (Launch::Binary { data_dir }, cmd.start()?)
            }
            None => {
                let docker = which("docker").map_err(|_| {
                    eyre!("Unable to find `minio` or `docker`.  Either set the MINIO_PATH env var, put the minio executable in your PATH, or install Docker")
                })?;

                let container = format!("s3lite-minio-{:08x}", rand::thread_rng().next_u32());

                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container.clone(),
                    "-p".to_string(),
                    format!("{}:9000", endpoint),
                ];
                if let Some(domain) = Self::minio_domain() {
                    args.push("-e".to_string());
                    args.push(format!("MINIO_DOMAIN={domain}"));
                }
                args.extend(
                    [MINIO_IMAGE, "server", "/data", "--quiet"]
                        .iter()
                        .map(|arg| arg.to_string()),
                );

                let handle = duct::cmd(docker, args).stdout_null().start()?;

                (Launch::Docker { container }, handle)
            }
        };

        let server = Self {
            launch,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "Waiting for minio service to start");

        server.wait_for_service_start().await?;

        debug!(endpoint = %server.endpoint, "Minio started");

        Ok(server)
    }

    /// The S3 API endpoint URL where the server is listening
    pub fn endpoint_url(&self) -> url::Url {
        format!("http://{}/", self.endpoint).parse().unwrap()
    }

    /// Client configuration for this server using the given addressing style.
    ///
    /// Virtual-host style needs `S3_TARGET_DOMAIN` to be set to a domain with wildcard DNS pointing
    /// at localhost; the config picks it up from the environment.
    pub fn config(&self, addressing_style: AddressingStyle) -> Config {
        Config {
            s3_endpoint: Some(self.endpoint_url()),
            addressing_style,
            target_domain: std::env::var("S3_TARGET_DOMAIN")
                .ok()
                .filter(|domain| !domain.is_empty()),
            aws_region: Some(MINIO_REGION.to_string()),
            disable_instance_metadata: true,
            ..Config::default()
        }
    }

    /// A client for this server using the given addressing style
    pub async fn client(&self, addressing_style: AddressingStyle) -> Result<S3Client> {
        Ok(S3Client::builder(self.config(addressing_style))
            .credentials(Credentials::new(MINIO_ACCESS_KEY, MINIO_SECRET_KEY))
            .build()
            .await?)
    }

    /// Make a new bucket on this server for testing purposes.
    ///
    /// The actual bucket name has a random prefix, since many tests share one server.  The name is
    /// always a valid DNS label so it works with either addressing style.
    pub async fn create_bucket(&self, bucket: impl AsRef<str>) -> Result<String> {
        static REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9a-z\-]+").unwrap());

        let bucket = bucket.as_ref().to_ascii_lowercase();
        let bucket = REGEX.replace_all(&bucket, "-");
        let bucket = bucket.trim_matches('-');

        // 8 hex chars plus a `-` still has to fit in 63
        let bucket = &bucket[..bucket.len().min(63 - 9)];
        let bucket = format!("{:08x}-{bucket}", rand::thread_rng().next_u32());
        let bucket = bucket.trim_end_matches('-').to_string();

        debug!(%bucket, "Creating bucket");

        let client = self.client(AddressingStyle::Path).await?;
        client.create_bucket(&bucket).await?;

        // Bucket creation isn't always visible right away, so wait until it is
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        if let Err(e) = policy.retry(|| client.head_bucket(&bucket)).await {
            return Err(eyre!(
                "The bucket {bucket} is not accessible even after it was explicitly created.  Last error was: \n{e}"
            ));
        }

        Ok(bucket)
    }

    /// Block until the server answers `ListBuckets`, or give up after a while
    async fn wait_for_service_start(&self) -> Result<()> {
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(20)
            .with_max_delay(Duration::from_secs(2));

        let mut config = self.config(AddressingStyle::Path);
        config.request_timeout_secs = 5;

        let client = S3Client::builder(config)
            .credentials(Credentials::new(MINIO_ACCESS_KEY, MINIO_SECRET_KEY))
            .retry_policy(RetryPolicy::never())
            .build()
            .await?;

        if let Err(e) = policy.retry(|| client.list_buckets()).await {
            Err(eyre!(
                "The minio server didn't come online in the allowed time.  The last error reported by ListBuckets against the server was:\n{e}"
            ))
        } else {
            Ok(())
        }
    }

    fn find_minio() -> Option<PathBuf> {
        std::env::var_os("MINIO_PATH")
            .map(PathBuf::from)
            .or_else(|| which("minio").ok())
    }

    fn minio_domain() -> Option<String> {
        std::env::var("S3_TARGET_DOMAIN")
            .ok()
            .filter(|domain| !domain.is_empty())
            .map(|domain| format!("s3.{MINIO_REGION}.{domain}"))
    }

    /// Find a socket address on localhost that is free for minio to listen on
    fn random_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// Minio refuses to use a data directory on `tmpfs` (it needs `O_DIRECT`), which rules out
    /// `/tmp` on most Linux distros.  So the data goes in a temp dir under the home directory.
    fn temp_data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::Builder::new()
            .prefix("s3lite-minio-")
            .tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio process(es)");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {}", e);
        }

        // Killing the docker CLI doesn't stop the container
        if let Launch::Docker { container } = &self.launch {
            if let Err(e) = duct::cmd!("docker", "rm", "-f", container)
                .stdout_null()
                .stderr_null()
                .run()
            {
                eprintln!("Error removing minio container {container}: {e}");
            }
        }
    }
}
