//! Configuration for the `taskman` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskman/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use taskman_proto::task::{TaskPriority, TaskStatus};

use crate::realtime::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_BUFFER, DEFAULT_RECONNECT_DELAY, RealtimeConfig,
};
use crate::sync::{DEFAULT_CHANNEL_CAPACITY, SyncConfig};

/// API base used when nothing else is configured.
pub const DEFAULT_API_BASE: &str = "http://localhost:8000/api";

/// Realtime endpoint used when none can be derived from the API base.
pub const FALLBACK_WS_URL: &str = "ws://localhost:8000/ws/tasks/";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    api: ApiFileConfig,
    realtime: RealtimeFileConfig,
    session: SessionFileConfig,
    sync: SyncFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    ws_url: Option<String>,
}

/// `[realtime]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RealtimeFileConfig {
    reconnect_delay_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    file: Option<PathBuf>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// REST API base URL.
    pub api_base: String,
    /// Realtime push endpoint.
    pub ws_url: String,
    /// Delay between realtime reconnect attempts.
    pub reconnect_delay: Duration,
    /// Timeout for one realtime connection attempt.
    pub connect_timeout: Duration,
    /// Capacity of the realtime event channel.
    pub event_buffer: usize,
    /// Session file; `None` keeps the session in memory only.
    pub session_file: Option<PathBuf>,
    /// Capacity of the sync command/event channels.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            ws_url: derive_ws_url(DEFAULT_API_BASE),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            session_file: crate::credentials::default_session_path(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// or any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve from CLI args alone, as if no config file existed.
    ///
    /// Used when the config file is unusable so the command-line and
    /// environment overrides still apply.
    #[must_use]
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. The realtime endpoint, unless set
    /// explicitly, is derived from whichever API base wins.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let api_base = cli
            .api_base
            .clone()
            .or_else(|| file.api.base_url.clone())
            .unwrap_or(defaults.api_base);
        let ws_url = cli
            .ws_url
            .clone()
            .or_else(|| file.api.ws_url.clone())
            .unwrap_or_else(|| derive_ws_url(&api_base));

        Self {
            api_base,
            ws_url,
            reconnect_delay: file
                .realtime
                .reconnect_delay_ms
                .map_or(defaults.reconnect_delay, Duration::from_millis),
            connect_timeout: file
                .realtime
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            event_buffer: file
                .realtime
                .event_buffer
                .unwrap_or(defaults.event_buffer),
            session_file: cli
                .session_file
                .clone()
                .or_else(|| file.session.file.clone())
                .or(defaults.session_file),
            channel_capacity: file
                .sync
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        }
    }

    /// Realtime client settings.
    #[must_use]
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            endpoint: self.ws_url.clone(),
            reconnect_delay: self.reconnect_delay,
            connect_timeout: self.connect_timeout,
            event_buffer: self.event_buffer,
        }
    }

    /// Sync coordinator settings.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            realtime: self.realtime_config(),
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Derive the realtime endpoint from the API base: same host and port,
/// `ws`/`wss` matching `http`/`https`, path `/ws/tasks/`.
///
/// Falls back to [`FALLBACK_WS_URL`] when the base is not a usable URL.
#[must_use]
pub fn derive_ws_url(api_base: &str) -> String {
    let Ok(url) = url::Url::parse(api_base) else {
        return FALLBACK_WS_URL.to_string();
    };
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return FALLBACK_WS_URL.to_string(),
    };
    let Some(host) = url.host_str() else {
        return FALLBACK_WS_URL.to_string();
    };
    match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}/ws/tasks/"),
        None => format!("{scheme}://{host}/ws/tasks/"),
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Task board client with live sync")]
pub struct CliArgs {
    /// REST API base URL (default: `http://localhost:8000/api`).
    #[arg(long, env = "TASKMAN_API_BASE", global = true)]
    pub api_base: Option<String>,

    /// Realtime endpoint (default: derived from the API base).
    #[arg(long, env = "TASKMAN_WS_URL", global = true)]
    pub ws_url: Option<String>,

    /// Path to config file (default: `~/.config/taskman/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Session file holding the stored credentials.
    #[arg(long, env = "TASKMAN_SESSION_FILE", global = true)]
    pub session_file: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKMAN_LOG", global = true)]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/taskman.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Client subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign in and store the session.
    Login {
        /// Account email.
        email: String,
        /// Password (read from stdin when omitted).
        #[arg(long, env = "TASKMAN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Create an account, then sign in.
    Register {
        /// Account email.
        email: String,
        /// Display name.
        #[arg(long)]
        name: Option<String>,
        /// Password (read from stdin when omitted).
        #[arg(long, env = "TASKMAN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored session.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// List tasks.
    List {
        /// Case-insensitive text to look for in title or description.
        #[arg(long)]
        search: Option<String>,
        /// Only tasks with this status.
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Only tasks with this priority.
        #[arg(long)]
        priority: Option<TaskPriority>,
    },
    /// Show task counters.
    Summary,
    /// Create a task.
    Create {
        /// Title.
        title: String,
        /// Description.
        #[arg(long)]
        description: Option<String>,
        /// Initial status.
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Priority.
        #[arg(long)]
        priority: Option<TaskPriority>,
        /// Due date (`YYYY-MM-DD`).
        #[arg(long)]
        due: Option<NaiveDate>,
    },
    /// Set a task's status.
    Status {
        /// Task id.
        id: String,
        /// New status.
        status: TaskStatus,
    },
    /// Move a task from one column to another.
    Move {
        /// Task id.
        id: String,
        /// Column it is dragged from.
        from: TaskStatus,
        /// Column it is dropped on.
        to: TaskStatus,
    },
    /// Change task fields.
    Update {
        /// Task id.
        id: String,
        /// New title.
        #[arg(long)]
        title: Option<String>,
        /// New description.
        #[arg(long)]
        description: Option<String>,
        /// New status.
        #[arg(long)]
        status: Option<TaskStatus>,
        /// New priority.
        #[arg(long)]
        priority: Option<TaskPriority>,
        /// New due date (`YYYY-MM-DD`).
        #[arg(long)]
        due: Option<NaiveDate>,
    },
    /// Delete a task.
    Delete {
        /// Task id.
        id: String,
    },
    /// Print task changes as they happen, until Ctrl-C.
    Watch,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("taskman").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
