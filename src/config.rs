use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process settings, read from `LABSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// Compact the WAL once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// JSON seed file imported at startup (see `seed`).
    pub seed_file: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7400,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            seed_file: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparseable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "LABSLOT_PORT").unwrap_or(defaults.port),
            bind: lookup("LABSLOT_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("LABSLOT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            max_connections: parsed(&lookup, "LABSLOT_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "LABSLOT_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "LABSLOT_METRICS_PORT"),
            seed_file: lookup("LABSLOT_SEED_FILE")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            request_timeout: parsed(&lookup, "LABSLOT_REQUEST_TIMEOUT_MS")
                .filter(|ms: &u64| *ms > 0)
                .map_or(defaults.request_timeout, Duration::from_millis),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("labslot.wal")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.listen_addr(), "0.0.0.0:7400");
        assert_eq!(c.wal_path(), PathBuf::from("./data/labslot.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let c = config(&[
            ("LABSLOT_PORT", "9000"),
            ("LABSLOT_BIND", "127.0.0.1"),
            ("LABSLOT_DATA_DIR", "/var/lib/labslot"),
            ("LABSLOT_MAX_CONNECTIONS", "32"),
            ("LABSLOT_COMPACT_THRESHOLD", "50"),
            ("LABSLOT_METRICS_PORT", "9100"),
            ("LABSLOT_SEED_FILE", "seed.json"),
            ("LABSLOT_REQUEST_TIMEOUT_MS", "250"),
        ]);
        assert_eq!(c.listen_addr(), "127.0.0.1:9000");
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/labslot/labslot.wal"));
        assert_eq!(c.max_connections, 32);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.seed_file, Some(PathBuf::from("seed.json")));
        assert_eq!(c.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_values_fall_back() {
        let c = config(&[
            ("LABSLOT_PORT", "not-a-port"),
            ("LABSLOT_MAX_CONNECTIONS", "0"),
            ("LABSLOT_REQUEST_TIMEOUT_MS", "0"),
            ("LABSLOT_METRICS_PORT", "70000"),
        ]);
        assert_eq!(c.port, 7400);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.request_timeout, Duration::from_secs(10));
        assert_eq!(c.metrics_port, None);
    }
}
