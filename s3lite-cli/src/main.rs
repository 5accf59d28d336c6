use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use http::Method;
use s3lite::{Config, S3Client};
use std::{io::Write, path::PathBuf, time::Duration};
use tracing::debug;

type Result<T> = color_eyre::Result<T>;

/// Read, write, inspect and presign objects on S3 or any S3-compatible object storage
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ")"
))]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download an object
    Get {
        /// The object to download, as `s3://bucket/key`
        #[clap(value_name = "URL")]
        object: String,

        /// Write the object to this file instead of stdout
        #[clap(short = 'o', long, value_parser)]
        output: Option<PathBuf>,

        /// Only download this byte range, given as `START-END` with an exclusive end
        #[clap(long, value_name = "START-END")]
        range: Option<String>,
    },

    /// Upload a file as an object
    Put {
        /// The local file to upload
        #[clap(value_parser)]
        file: PathBuf,

        /// The object to create, as `s3://bucket/key`
        #[clap(value_name = "URL")]
        object: String,

        /// Content type to store with the object
        #[clap(long)]
        content_type: Option<String>,
    },

    /// Show an object's metadata
    Head {
        /// The object to inspect, as `s3://bucket/key`
        #[clap(value_name = "URL")]
        object: String,
    },

    /// Delete an object
    Rm {
        /// The object to delete, as `s3://bucket/key`
        #[clap(value_name = "URL")]
        object: String,
    },

    /// Create a bucket
    Mb {
        /// The bucket to create, as `s3://bucket`
        #[clap(value_name = "URL")]
        bucket: String,
    },

    /// List all buckets
    Ls,

    /// Print a presigned URL for an object
    Presign {
        /// The object, as `s3://bucket/key`
        #[clap(value_name = "URL")]
        object: String,

        /// How long the URL is valid for, in seconds.  At most 7 days.
        #[clap(long, default_value = "3600")]
        expires_secs: u64,

        /// Presign an upload instead of a download
        #[clap(long, conflicts_with = "delete")]
        put: bool,

        /// Presign a delete instead of a download
        #[clap(long)]
        delete: bool,

        /// Address a specific version of the object
        #[clap(long)]
        version_id: Option<String>,

        /// Sign this content type into the URL; whoever uses it must send the same header
        #[clap(long)]
        content_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    debug!(config = ?args.config, "Starting");

    let client = S3Client::new(args.config).await?;

    match args.command {
        Command::Get {
            object,
            output,
            range,
        } => {
            let (bucket, key) = parse_object_url(&object)?;
            let response = match range {
                Some(range) => {
                    let range = parse_range(&range)?;
                    client.get_object_range(&bucket, &key, range).await?
                }
                None => client.get_object(&bucket, &key).await?,
            };

            match output {
                Some(path) => tokio::fs::write(&path, response.body())
                    .await
                    .wrap_err_with(|| format!("Error writing to '{}'", path.display()))?,
                None => std::io::stdout().write_all(response.body())?,
            }
        }
        Command::Put {
            file,
            object,
            content_type,
        } => {
            let (bucket, key) = parse_object_url(&object)?;
            let body = tokio::fs::read(&file)
                .await
                .wrap_err_with(|| format!("Error reading '{}'", file.display()))?;

            let response = client
                .put_object(&bucket, &key, body, content_type.as_deref())
                .await?;

            println!("{}", response.etag().unwrap_or_default());
        }
        Command::Head { object } => {
            let (bucket, key) = parse_object_url(&object)?;
            let response = client.head_object(&bucket, &key).await?;

            if let Some(length) = response.content_length() {
                println!("Content-Length: {length}");
            }
            if let Some(content_type) = response.content_type() {
                println!("Content-Type: {content_type}");
            }
            if let Some(etag) = response.etag() {
                println!("ETag: {etag}");
            }
            if let Some(last_modified) = response.last_modified() {
                println!("Last-Modified: {}", last_modified.to_rfc2822());
            }
        }
        Command::Rm { object } => {
            let (bucket, key) = parse_object_url(&object)?;
            client.delete_object(&bucket, &key).await?;
        }
        Command::Mb { bucket } => {
            let (bucket, key) = parse_object_url(&bucket)?;
            if !key.is_empty() {
                return Err(eyre!("Expected a bucket URL like s3://bucket, without a key"));
            }
            client.create_bucket(&bucket).await?;
        }
        Command::Ls => {
            for bucket in client.list_buckets().await? {
                println!("{bucket}");
            }
        }
        Command::Presign {
            object,
            expires_secs,
            put,
            delete,
            version_id,
            content_type,
        } => {
            let (bucket, key) = parse_object_url(&object)?;
            let expires_in = Duration::from_secs(expires_secs);

            let method = if put {
                Method::PUT
            } else if delete {
                Method::DELETE
            } else {
                Method::GET
            };

            let mut request = client.request(method, &bucket, &key)?;
            if let Some(version_id) = version_id {
                request = request.with_query("versionId", version_id);
            }
            if let Some(content_type) = content_type {
                request = request.with_header("content-type", content_type);
            }

            println!("{}", client.presigned_url(&request, expires_in)?);
        }
    }

    Ok(())
}

fn init_logging(globals: &Globals) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if globals.verbose {
        "s3lite=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    // RUST_LOG wins over the command line flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Split `s3://bucket/key` into bucket and key.  The key is taken verbatim, and is empty if the
/// URL names only a bucket.
fn parse_object_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| eyre!("'{url}' is not an S3 URL; expected s3://bucket/key"))?;

    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(eyre!("'{url}' doesn't name a bucket"));
    }

    Ok((bucket.to_string(), key.to_string()))
}

/// Parse `START-END` into a byte range with an exclusive end
fn parse_range(range: &str) -> Result<std::ops::Range<u64>> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| eyre!("'{range}' is not a range; expected START-END"))?;

    let start = start.trim().parse::<u64>().wrap_err("Invalid range start")?;
    let end = end.trim().parse::<u64>().wrap_err("Invalid range end")?;

    Ok(start..end)
}
