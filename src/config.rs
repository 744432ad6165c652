use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; CLI wins.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database holding payload metadata, queues, and audit records.
    pub database_url: String,
    /// Root directory for payload bytes.
    pub data_dir: PathBuf,
    /// Container the payloads live under, as a subdirectory of `data_dir`.
    pub container_name: String,

    // Server settings
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,

    // Pipeline settings
    pub worker_count: usize,
    pub validation_queue_name: String,
    pub transfer_queue_name: String,
    pub cleanup_queue_name: String,
    pub retention_days: u32,
    pub processing_batch_size: usize,
    pub operation_retry_count: u32,
    pub operation_retry_interval: Duration,

    pub remote: RemoteStoreConfig,
    pub ftp: FtpConfig,

    // Logging settings
    pub log_level: String,
    pub log_json: bool,
}

/// Remote (S3) store settings.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Endpoint override for local S3 doubles; none in production.
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    pub bucket_name: String,
}

/// Ingest drop settings.
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub watch_enabled: bool,
    /// Staging directory. With no FTP host configured this directory itself
    /// is the drop.
    pub watch_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl FtpConfig {
    /// True when ingest should pull from an FTP server rather than watch the
    /// drop directory directly.
    pub fn remote_drop(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Command-line overrides for the most commonly adjusted settings; everything
/// else comes from the environment.
#[derive(Parser, Debug)]
#[command(author, version, about = "USV survey-data forwarding pipeline")]
pub struct Args {
    /// Port to bind the status server to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// SQLite database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory where payload bytes are stored (overrides DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Parse CLI arguments and environment variables into an `AppConfig`.
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<Self> {
        let database_url = match args.database_url {
            Some(url) => url,
            None => env::var("DATABASE_URL")
                .context("DATABASE_URL is required (sqlite://path/to/pipeline.db)")?,
        };
        let data_dir = args
            .data_dir
            .unwrap_or_else(|| PathBuf::from(env_or("DATA_DIR", "./data/payloads")));

        let cfg = Self {
            database_url,
            data_dir,
            container_name: env_or("BLOB_CONTAINER_NAME", "usvdata"),

            port: match args.port {
                Some(port) => port,
                None => env_parsed("PORT", 8080)?,
            },
            read_timeout: env_secs("READ_TIMEOUT", 30)?,
            write_timeout: env_secs("WRITE_TIMEOUT", 30)?,
            shutdown_timeout: env_secs("SHUTDOWN_TIMEOUT", 10)?,

            worker_count: env_parsed("WORKER_COUNT", 3)?,
            validation_queue_name: env_or("VALIDATION_QUEUE_NAME", "validation-queue"),
            transfer_queue_name: env_or("TRANSFER_QUEUE_NAME", "transfer-queue"),
            cleanup_queue_name: env_or("CLEANUP_QUEUE_NAME", "cleanup-queue"),
            retention_days: env_parsed("RETENTION_DAYS", 7)?,
            processing_batch_size: env_parsed("PROCESSING_BATCH_SIZE", 10)?,
            operation_retry_count: env_parsed("OPERATION_RETRY_COUNT", 3)?,
            operation_retry_interval: env_secs("OPERATION_RETRY_INTERVAL", 5)?,

            remote: RemoteStoreConfig {
                endpoint_url: env_opt("AWS_ENDPOINT_URL"),
                access_key: env_opt("AWS_ACCESS_KEY_ID"),
                secret_key: env_opt("AWS_SECRET_ACCESS_KEY"),
                region: env_opt("AWS_REGION"),
                bucket_name: env_or("AWS_BUCKET_NAME", "revelare-vessel-data"),
            },
            ftp: FtpConfig {
                watch_enabled: env_parsed("FTP_WATCH_ENABLED", false)?,
                watch_dir: env_opt("FTP_WATCH_DIR").map(PathBuf::from),
                poll_interval: env_secs("FTP_POLL_INTERVAL", 30)?,
                host: env_or("FTP_HOST", ""),
                port: env_parsed("FTP_PORT", 21)?,
                user: env_or("FTP_USER", ""),
                password: env_or("FTP_PASSWORD", ""),
                retry_count: env_parsed("FTP_RETRY_COUNT", 3)?,
                retry_delay: env_secs("FTP_RETRY_DELAY", 5)?,
            },

            log_level: match args.log_level {
                Some(level) => level,
                None => env_or("LOG_LEVEL", "info"),
            },
            log_json: env_parsed("LOG_JSON", false)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup validation of settings that would otherwise fail much later.
    fn validate(&self) -> Result<()> {
        if is_production()
            && (self.remote.access_key.is_none()
                || self.remote.secret_key.is_none()
                || self.remote.region.is_none())
        {
            bail!(
                "AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_REGION are required in production"
            );
        }
        if self.ftp.watch_enabled {
            if self.ftp.watch_dir.is_none() {
                bail!("FTP_WATCH_DIR is required when FTP_WATCH_ENABLED is true");
            }
            if self.ftp.remote_drop() && (self.ftp.user.is_empty() || self.ftp.password.is_empty())
            {
                bail!("FTP_USER and FTP_PASSWORD are required when FTP_HOST is set");
            }
        }
        Ok(())
    }

    /// Retention window for transferred payloads.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {key} value `{value}`: {err}")),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parsed(key, default_secs)?))
}

fn is_production() -> bool {
    matches!(
        env::var("ENVIRONMENT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "production" | "prod"
    )
}
