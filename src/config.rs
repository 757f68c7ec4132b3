use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{
    env,
    path::{Path, PathBuf},
};

pub const DEFAULT_OBJECT_KEY: &str = "SEN_soc.tif";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Connection settings for the MinIO (S3-compatible) server.
#[derive(Debug, Clone)]
pub struct MinioConfig {
    pub host: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: String,
    pub region: String,
    pub secure: bool,
}

impl MinioConfig {
    /// Endpoint URL handed to the S3 client.
    ///
    /// An explicit `http://`/`https://` scheme in `MINIO_HOST` wins over `MINIO_SECURE`.
    pub fn endpoint(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            let scheme = if self.secure { "https" } else { "http" };
            format!("{}://{}", scheme, self.host.trim_end_matches('/'))
        }
    }

    pub fn allow_http(&self) -> bool {
        self.endpoint().starts_with("http://")
    }
}

/// Settings for the webhook HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub auth_token: Option<String>,
    pub max_concurrency: usize,
    /// Unfinished webhook events allowed before deliveries are refused.
    pub max_pending: usize,
    pub raster_extensions: Vec<String>,
    /// Directory for scratch downloads; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "MinIO webhook receiver that profiles GeoTIFF rasters"
)]
pub struct Args {
    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the webhook server
    Serve(ServeArgs),
    /// Download one raster from the bucket and print its statistics as JSON
    Stats(StatsArgs),
    /// Create the report database schema and exit
    Migrate(MigrateArgs),
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides WEBHOOK_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides WEBHOOK_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides WEBHOOK_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct StatsArgs {
    /// Object key of the raster
    #[arg(default_value = DEFAULT_OBJECT_KEY)]
    pub key: String,

    /// Bucket to read from (overrides MINIO_BUCKET_NAME)
    #[arg(long)]
    pub bucket: Option<String>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct MigrateArgs {
    /// Database URL (overrides WEBHOOK_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,
}

/// Load a `.env` file into the process environment.
///
/// An explicitly requested file must exist; the implicit `./.env` is optional.
pub fn load_env(path: Option<&PathBuf>) -> Result<()> {
    load_env_file(path.map(PathBuf::as_path), Path::new(DEFAULT_ENV_FILE))
}

fn load_env_file(explicit: Option<&Path>, implicit: &Path) -> Result<()> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                bail!(".env file not found at {}", path.display());
            }
            dotenvy::from_path(path)
                .with_context(|| format!("loading env file {}", path.display()))?;
        }
        None => match dotenvy::from_path(implicit) {
            Ok(()) => tracing::debug!("Loaded environment from {}", implicit.display()),
            Err(err) if err.not_found() => tracing::debug!("No .env file found"),
            Err(err) => {
                return Err(err).with_context(|| format!("loading {}", implicit.display()));
            }
        },
    }
    Ok(())
}

/// Source of configuration values, so parsing can be tested without touching
/// the process environment.
pub trait EnvSource {
    fn get(&self, name: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

impl MinioConfig {
    pub fn from_env(source: &impl EnvSource) -> Result<Self> {
        let host = source
            .get("MINIO_HOST")
            .context("MINIO_HOST is not set")?;
        let bucket = source
            .get("MINIO_BUCKET_NAME")
            .context("MINIO_BUCKET_NAME is not set")?;
        let secure = match source.get("MINIO_SECURE") {
            Some(value) => parse_bool("MINIO_SECURE", &value)?,
            None => false,
        };

        Ok(Self {
            host,
            access_key: source.get("MINIO_BUCKET_ACCESS_KEY"),
            secret_key: source.get("MINIO_BUCKET_SECRET_KEY"),
            bucket,
            region: source
                .get("MINIO_REGION")
                .unwrap_or_else(|| "us-east-1".into()),
            secure,
        })
    }
}

impl ServerConfig {
    /// Merge CLI arguments over environment values over defaults.
    pub fn from_env_and_args(source: &impl EnvSource, args: &ServeArgs) -> Result<Self> {
        let env_host = source
            .get("WEBHOOK_HOST")
            .unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match source.get("WEBHOOK_PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing WEBHOOK_PORT value `{}`", value))?,
            None => 5001,
        };
        let max_concurrency = parse_count(source, "WEBHOOK_MAX_CONCURRENCY", 4)?;
        let max_pending = parse_count(source, "WEBHOOK_MAX_PENDING", 1024)?;
        let raster_extensions = parse_extensions(
            &source
                .get("RASTER_EXTENSIONS")
                .unwrap_or_else(|| "tif,tiff".into()),
        );

        Ok(Self {
            host: args.host.clone().unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: database_url(source, args.database_url.as_ref()),
            auth_token: source.get("WEBHOOK_AUTH_TOKEN"),
            max_concurrency,
            max_pending,
            raster_extensions,
            scratch_dir: source.get("WEBHOOK_SCRATCH_DIR").map(PathBuf::from),
        })
    }
}

pub fn database_url(source: &impl EnvSource, flag: Option<&String>) -> String {
    flag.cloned()
        .or_else(|| source.get("WEBHOOK_DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/raster_reports.db".into())
}

/// A positive count; zero is raised to one.
fn parse_count(source: &impl EnvSource, name: &str, default: usize) -> Result<usize> {
    match source.get(name) {
        Some(value) => Ok(value
            .parse::<usize>()
            .with_context(|| format!("parsing {} value `{}`", name, value))?
            .max(1)),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("parsing {} value `{}`: expected a boolean", name, other),
    }
}

/// Normalize a comma-separated extension list to lowercase without dots.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
