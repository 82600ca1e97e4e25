use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Optional numeric setting. Unset, empty, `0` or unparsable all mean "none".
fn profiled_env_u64_opt(profile: &str, key: &str) -> Option<u64> {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load from the TOML file named by `EPISODIC_CONFIG`, or from the
    /// environment when it is unset. Call `load_dotenv()` first.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env_opt("EPISODIC_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from `path` when given, otherwise from the environment, and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `EPISODIC_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("EPISODIC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            lock: LockConfig::from_env_profiled(p),
            monitor: MonitorConfig::from_env_profiled(p),
        }
    }

    /// Parse a TOML config file. Missing sections and keys take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Reject combinations that would break scheduling guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.scheduler.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.history_limit must be at least 1".into(),
            ));
        }
        if self.scheduler.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.task_timeout_secs must be non-zero".into(),
            ));
        }
        // A holder running a task up to its timeout must never look stale.
        if self.lock.ttl_secs <= self.scheduler.task_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "lock.ttl_secs ({}) must exceed scheduler.task_timeout_secs ({})",
                self.lock.ttl_secs, self.scheduler.task_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  scheduler:  task_timeout={}s, lock_wait={}, idle_timeout={}, failure_cooldown={}ms",
            self.scheduler.task_timeout_secs,
            self.scheduler
                .lock_wait_timeout_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "unlimited".into()),
            self.scheduler
                .idle_timeout_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "never".into()),
            self.scheduler.failure_cooldown_ms,
        );
        tracing::info!(
            "  lock:       ttl={}s, file={}",
            self.lock.ttl_secs,
            self.lock
                .lock_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(in-process)".into()),
        );
        tracing::info!("  monitor:    url={}", self.monitor.status_url);
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8100,
            cors_origin: "*".into(),
        }
    }
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 8100),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Per-group worker behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum callback duration before a task is marked timed out.
    pub task_timeout_secs: u64,
    /// Maximum wait for the GPU lock. `None` waits forever.
    pub lock_wait_timeout_secs: Option<u64>,
    /// Interval between "still waiting for GPU lock" log lines.
    pub lock_liveness_log_secs: u64,
    /// Idle period after which a worker exits. `None` keeps workers alive.
    pub idle_timeout_secs: Option<u64>,
    /// Pause after a failed or timed out task before the next dequeue.
    pub failure_cooldown_ms: u64,
    /// Terminal task records retained per group.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 600,
            lock_wait_timeout_secs: None,
            lock_liveness_log_secs: 30,
            idle_timeout_secs: None,
            failure_cooldown_ms: 0,
            history_limit: 20,
        }
    }
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let defaults = Self::default();
        Self {
            task_timeout_secs: profiled_env_u64(p, "TASK_TIMEOUT_SECS", defaults.task_timeout_secs),
            lock_wait_timeout_secs: profiled_env_u64_opt(p, "LOCK_WAIT_TIMEOUT_SECS"),
            lock_liveness_log_secs: profiled_env_u64(
                p,
                "LOCK_LIVENESS_LOG_SECS",
                defaults.lock_liveness_log_secs,
            ),
            idle_timeout_secs: profiled_env_u64_opt(p, "WORKER_IDLE_TIMEOUT_SECS"),
            failure_cooldown_ms: profiled_env_u64(
                p,
                "FAILURE_COOLDOWN_MS",
                defaults.failure_cooldown_ms,
            ),
            history_limit: profiled_env_u64(p, "TASK_HISTORY_LIMIT", defaults.history_limit as u64)
                as usize,
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_secs.map(Duration::from_secs)
    }

    pub fn lock_liveness_log_interval(&self) -> Duration {
        Duration::from_secs(self.lock_liveness_log_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }
}

// ── GPU lock ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Hold duration after which a holder is presumed crashed.
    pub ttl_secs: u64,
    /// Lease file shared between processes. `None` = in-process lock only.
    pub lock_file: Option<PathBuf>,
    /// How often a waiter re-checks a lease file held by another process.
    pub file_poll_interval_ms: u64,
    /// Identifier of this process in lease files. `None` = random.
    pub instance_id: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            lock_file: None,
            file_poll_interval_ms: 250,
            instance_id: None,
        }
    }
}

impl LockConfig {
    fn from_env_profiled(p: &str) -> Self {
        let defaults = Self::default();
        Self {
            ttl_secs: profiled_env_u64(p, "GPU_LOCK_TTL_SECS", defaults.ttl_secs),
            lock_file: profiled_env_opt(p, "GPU_LOCK_FILE").map(PathBuf::from),
            file_poll_interval_ms: profiled_env_u64(
                p,
                "GPU_LOCK_POLL_INTERVAL_MS",
                defaults.file_poll_interval_ms,
            ),
            instance_id: profiled_env_opt(p, "INSTANCE_ID"),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms.max(1))
    }
}

// ── Monitor / gatekeeper client ───────────────────────────────

/// Upper bound for gatekeeper polling.
pub const MAX_GATEKEEPER_POLL_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub status_url: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            status_url: "http://localhost:8100/queue/status".into(),
            poll_interval_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl MonitorConfig {
    fn from_env_profiled(p: &str) -> Self {
        let defaults = Self::default();
        Self {
            status_url: profiled_env_or(p, "QUEUE_STATUS_URL", &defaults.status_url),
            poll_interval_secs: profiled_env_u64(
                p,
                "QUEUE_POLL_INTERVAL_SECS",
                defaults.poll_interval_secs,
            ),
            request_timeout_secs: profiled_env_u64(
                p,
                "QUEUE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
        }
    }

    /// Poll interval clamped to 1..=10 seconds.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.clamp(1, MAX_GATEKEEPER_POLL_SECS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
