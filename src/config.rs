use crate::{db::DatabaseSettings, handlers::validation::UploadPolicy};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "GALLERY_";

/// How long SQLite waits on a lock held by another worker.
const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub start_port: u16,
    pub workers: u16,
    pub storage_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub max_upload_bytes: u64,
    pub request_timeout_secs: u64,
}

/// What this process was started to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Launch and babysit the worker processes.
    Supervise,
    /// Serve HTTP on a single port. Set by the supervisor, not by users.
    Worker { port: u16 },
    /// Run migrations and exit.
    Migrate,
    /// Repair storage/metadata drift and exit.
    Reconcile,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image upload and gallery server")]
pub struct Args {
    /// Host to bind to (overrides GALLERY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the first worker; worker i listens on start_port + i (overrides GALLERY_START_PORT)
    #[arg(long)]
    pub start_port: Option<u16>,

    /// Number of worker processes (overrides GALLERY_WORKERS)
    #[arg(long)]
    pub workers: Option<u16>,

    /// Directory where images are stored (overrides GALLERY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Write logs to <log_dir>/<role>.log instead of stderr (overrides GALLERY_LOG_DIR)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Database URL (overrides GALLERY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Pool size per worker (overrides GALLERY_DB_MAX_CONNECTIONS)
    #[arg(long)]
    pub db_max_connections: Option<u32>,

    /// Seconds to wait for a pooled connection (overrides GALLERY_DB_ACQUIRE_TIMEOUT_SECS)
    #[arg(long)]
    pub db_acquire_timeout_secs: Option<u64>,

    /// Largest accepted image in bytes (overrides GALLERY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Per-request timeout in seconds (overrides GALLERY_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "reconcile")]
    pub migrate: bool,

    /// Reconcile storage with metadata and exit
    #[arg(long)]
    pub reconcile: bool,

    /// Serve on this port as a single worker
    #[arg(long, hide = true, conflicts_with_all = ["migrate", "reconcile"])]
    pub worker_port: Option<u16>,
}

impl Args {
    pub fn mode(&self) -> Mode {
        match self.worker_port {
            Some(port) => Mode::Worker { port },
            None if self.migrate => Mode::Migrate,
            None if self.reconcile => Mode::Reconcile,
            None => Mode::Supervise,
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        // Parse CLI once
        let args = Args::parse();
        let mode = args.mode();
        let cfg = Self::resolve(args, |key| env::var(key))?;
        Ok((cfg, mode))
    }

    /// Merge `args` over the variables visible through `lookup`, then over
    /// the defaults, and validate the result.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env = EnvSource { lookup };
        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env.string("HOST", "0.0.0.0")?,
            },
            start_port: or_env(args.start_port, &env, "START_PORT", 8000)?,
            workers: or_env(args.workers, &env, "WORKERS", 4)?,
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env.string("STORAGE_DIR", "./data/images")?.into(),
            },
            log_dir: match args.log_dir {
                Some(dir) => Some(dir),
                None => env.optional("LOG_DIR")?.map(PathBuf::from),
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env.string("DATABASE_URL", "sqlite://./data/meta/gallery.db")?,
            },
            db_max_connections: or_env(args.db_max_connections, &env, "DB_MAX_CONNECTIONS", 5)?,
            db_acquire_timeout_secs: or_env(
                args.db_acquire_timeout_secs,
                &env,
                "DB_ACQUIRE_TIMEOUT_SECS",
                3,
            )?,
            max_upload_bytes: or_env(
                args.max_upload_bytes,
                &env,
                "MAX_UPLOAD_BYTES",
                UploadPolicy::default().max_bytes,
            )?,
            request_timeout_secs: or_env(
                args.request_timeout_secs,
                &env,
                "REQUEST_TIMEOUT_SECS",
                30,
            )?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        let last_port = u32::from(self.start_port) + u32::from(self.workers) - 1;
        if last_port > u32::from(u16::MAX) {
            bail!(
                "{} workers starting at port {} would need port {}, above {}",
                self.workers,
                self.start_port,
                last_port,
                u16::MAX
            );
        }
        if self.db_max_connections == 0 {
            bail!("db_max_connections must be at least 1");
        }
        if self.db_acquire_timeout_secs == 0 {
            bail!("db_acquire_timeout_secs must be at least 1");
        }
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Ports of all workers, in launch order.
    pub fn worker_ports(&self) -> Vec<u16> {
        (0..self.workers).map(|i| self.start_port + i).collect()
    }

    pub fn addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    pub fn database_settings(&self) -> DatabaseSettings {
        DatabaseSettings {
            url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
            busy_timeout: DB_BUSY_TIMEOUT,
        }
    }

    /// Upload rules. An upload cannot stay in flight longer than the request
    /// timeout, so that is also the grace period for row-less files.
    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy::new(self.max_upload_bytes).with_orphan_grace(self.request_timeout())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `GALLERY_*` variables read through an injectable lookup.
struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    fn optional(&self, suffix: &str) -> Result<Option<String>> {
        let key = format!("{}{}", ENV_PREFIX, suffix);
        match (self.lookup)(&key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", key)),
        }
    }

    fn string(&self, suffix: &str, default: &str) -> Result<String> {
        Ok(self
            .optional(suffix)?
            .unwrap_or_else(|| default.to_string()))
    }

    fn parse<T>(&self, suffix: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(suffix)? {
            Some(value) => value.trim().parse::<T>().with_context(|| {
                format!("parsing {}{} value `{}`", ENV_PREFIX, suffix, value)
            }),
            None => Ok(default),
        }
    }
}

fn or_env<T, F>(arg: Option<T>, env: &EnvSource<F>, suffix: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match arg {
        Some(value) => Ok(value),
        None => env.parse(suffix, default),
    }
}
