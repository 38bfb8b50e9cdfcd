use std::{path::PathBuf, time::Duration};

pub const DEFAULT_PORT: u16 = 4900;
pub const DEFAULT_RESTART_CEILING: u32 = 10;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 3000;
pub const DEFAULT_MONITOR_POLL_MS: u64 = 1000;
pub const DEFAULT_REMEDY_POLL_MS: u64 = 30_000;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;
pub const DEFAULT_STOP_GRACE_MS: u64 = 10_000;
pub const DEFAULT_FALLBACK_WINDOW: u16 = 10;
pub const DEFAULT_SUSTAINED_RUN_MS: u64 = 60_000;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn log_max_lines() -> usize {
    env_usize("PORTGUARD_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

pub(crate) fn log_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("PORTGUARD_LOG_FILE_MAX_BYTES")
        .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
    let max_files = env_usize("PORTGUARD_LOG_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
    (max_bytes, max_files)
}

/// Everything the supervisor and the remediation engine need, resolved once
/// at startup. No process-wide implicit state: instances are constructed with
/// a config and passed to whichever loop drives them.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Target port the dev server is expected to bind.
    pub port: u16,
    /// Launch command for the child, program first.
    pub command: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment for the child. The resolved port is always injected
    /// as `PORT` on top of these.
    pub env: Vec<(String, String)>,

    pub restart_ceiling: u32,
    pub restart_delay: Duration,
    pub monitor_poll: Duration,
    pub remedy_poll: Duration,
    pub settle_delay: Duration,
    pub stop_grace: Duration,
    pub fallback_window: u16,
    /// A run at least this long counts as recovered: the restart counter
    /// resets so old crashes do not eat into the ceiling forever.
    pub sustained_run: Duration,

    pub logs_dir: PathBuf,
}

impl GuardConfig {
    /// Defaults plus `PORTGUARD_*` environment overrides. Values are clamped
    /// to sane ranges rather than rejected.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(p) = env_u64("PORTGUARD_PORT") {
            cfg.port = p.clamp(1, u16::MAX as u64) as u16;
        }
        if let Ok(cmd) = std::env::var("PORTGUARD_COMMAND") {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                cfg.command = parts;
            }
        }
        if let Ok(dir) = std::env::var("PORTGUARD_CWD") {
            cfg.cwd = PathBuf::from(dir);
        }
        if let Some(v) = env_u64("PORTGUARD_RESTART_MAX") {
            cfg.restart_ceiling = v.clamp(0, 1000) as u32;
        }
        if let Some(v) = env_u64("PORTGUARD_RESTART_DELAY_MS") {
            cfg.restart_delay = Duration::from_millis(v.clamp(10, 10 * 60 * 1000));
        }
        if let Some(v) = env_u64("PORTGUARD_MONITOR_POLL_MS") {
            cfg.monitor_poll = Duration::from_millis(v.clamp(10, 60_000));
        }
        if let Some(v) = env_u64("PORTGUARD_REMEDY_POLL_MS") {
            cfg.remedy_poll = Duration::from_millis(v.clamp(1000, 60 * 60 * 1000));
        }
        if let Some(v) = env_u64("PORTGUARD_SETTLE_DELAY_MS") {
            cfg.settle_delay = Duration::from_millis(v.clamp(0, 60_000));
        }
        if let Some(v) = env_u64("PORTGUARD_STOP_GRACE_MS") {
            cfg.stop_grace = Duration::from_millis(v.clamp(100, 10 * 60 * 1000));
        }
        if let Some(v) = env_u64("PORTGUARD_FALLBACK_WINDOW") {
            cfg.fallback_window = v.clamp(1, 1000) as u16;
        }
        if let Some(v) = env_u64("PORTGUARD_SUSTAINED_RUN_MS") {
            cfg.sustained_run = Duration::from_millis(v.clamp(1000, 24 * 60 * 60 * 1000));
        }
        if let Ok(dir) = std::env::var("PORTGUARD_LOGS_DIR") {
            cfg.logs_dir = PathBuf::from(dir);
        }

        cfg
    }

    pub fn console_log_path(&self) -> PathBuf {
        self.logs_dir.join("console.log")
    }

    /// Line-oriented error stream the remediation engine scans.
    pub fn error_log_path(&self) -> PathBuf {
        self.logs_dir.join("server-errors.log")
    }

    /// Structured application log store (JSON entries with a type tag).
    pub fn app_log_path(&self) -> PathBuf {
        self.logs_dir.join("console-logs.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.logs_dir.join("remediations.json")
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            command: vec!["npm".to_string(), "run".to_string(), "dev".to_string()],
            cwd: PathBuf::from("."),
            env: Vec::new(),
            restart_ceiling: DEFAULT_RESTART_CEILING,
            restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            monitor_poll: Duration::from_millis(DEFAULT_MONITOR_POLL_MS),
            remedy_poll: Duration::from_millis(DEFAULT_REMEDY_POLL_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            fallback_window: DEFAULT_FALLBACK_WINDOW,
            sustained_run: Duration::from_millis(DEFAULT_SUSTAINED_RUN_MS),
            logs_dir: PathBuf::from("logs"),
        }
    }
}
