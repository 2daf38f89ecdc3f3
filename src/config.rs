use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all daemon-owned state (`~/.subtrate` by default).
    pub data_dir: PathBuf,
    /// Main store path. Defaults to `<data_dir>/subtrate.db`.
    pub db_path: PathBuf,
    /// Listen address for the framed binary socket protocol.
    pub wire_addr: String,
    /// Seconds of silence before an agent drops from active to idle.
    pub active_threshold_secs: i64,
    /// Seconds of silence before an agent is reported offline.
    pub offline_threshold_secs: i64,
    /// Server-side cap on long-poll deadlines.
    pub long_poll_max: Duration,
    /// How long idempotency keys are remembered before the sweep drops them.
    pub dedup_window_secs: i64,
    /// Skip the pre-migration backup copy (tests, throwaway DBs).
    pub skip_backup: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = env::var("SUBTRATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let db_path = env::var("SUBTRATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("subtrate.db"));
        Config {
            data_dir,
            db_path,
            wire_addr: env::var("SUBTRATE_ADDR").unwrap_or_else(|_| "127.0.0.1:7877".to_string()),
            active_threshold_secs: env_i64("SUBTRATE_ACTIVE_SECS", 5 * 60),
            offline_threshold_secs: env_i64("SUBTRATE_OFFLINE_SECS", 30 * 60),
            long_poll_max: Duration::from_secs(env_i64("SUBTRATE_LONG_POLL_MAX_SECS", 60) as u64),
            dedup_window_secs: env_i64("SUBTRATE_DEDUP_WINDOW_SECS", 24 * 60 * 60),
            skip_backup: env::var("SUBTRATE_SKIP_BACKUP")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Config rooted at an explicit data dir, everything else defaulted.
    /// Used by tests and by embedders that manage their own paths.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let db_path = data_dir.join("subtrate.db");
        Config {
            data_dir,
            db_path,
            wire_addr: "127.0.0.1:0".to_string(),
            active_threshold_secs: 5 * 60,
            offline_threshold_secs: 30 * 60,
            long_poll_max: Duration::from_secs(60),
            dedup_window_secs: 24 * 60 * 60,
            skip_backup: true,
        }
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join("identity")
    }
}

fn default_data_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".subtrate")
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
