use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::*;

const PREFIX: &str = "TUTORBOOK_";

/// Process configuration, read from `TUTORBOOK_*` environment variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub link_base_url: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub history_capacity: usize,
    pub history_max_rooms: u64,
    pub metrics_port: Option<u16>,
    /// Only honored with the `redis-history` feature.
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 4000,
            data_dir: PathBuf::from("./data"),
            link_base_url: "http://localhost:3000/class/chat/".into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_max_rooms: DEFAULT_HISTORY_MAX_ROOMS,
            metrics_port: None,
            redis_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{PREFIX}{name}"));
        fn parsed<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }

        let d = Self::default();
        Self {
            bind: var("BIND").unwrap_or(d.bind),
            port: parsed(var("PORT")).unwrap_or(d.port),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            link_base_url: var("LINK_BASE_URL").unwrap_or(d.link_base_url),
            max_connections: parsed(var("MAX_CONNECTIONS")).unwrap_or(d.max_connections),
            compact_threshold: parsed(var("COMPACT_THRESHOLD")).unwrap_or(d.compact_threshold),
            history_capacity: parsed(var("HISTORY_CAPACITY")).unwrap_or(d.history_capacity),
            history_max_rooms: parsed(var("HISTORY_MAX_ROOMS")).unwrap_or(d.history_max_rooms),
            metrics_port: parsed(var("METRICS_PORT")),
            redis_url: var("REDIS_URL").filter(|s| !s.is_empty()),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tutorbook.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
