use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SystemClock;
use crate::engine::EngineSettings;

/// Server settings, read from `HOTELCAL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub max_stay_nights: u32,
    /// How far ahead a check-in may be, in days.
    pub horizon_days: u32,
    pub lock_timeout: Duration,
    pub hold_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7878,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            max_stay_nights: 30,
            horizon_days: 365,
            lock_timeout: Duration::from_millis(2000),
            hold_ttl: Duration::from_secs(900),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "HOTELCAL_PORT").unwrap_or(defaults.port),
            bind: lookup("HOTELCAL_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("HOTELCAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed(&lookup, "HOTELCAL_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "HOTELCAL_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "HOTELCAL_METRICS_PORT"),
            max_stay_nights: parsed(&lookup, "HOTELCAL_MAX_STAY_NIGHTS").unwrap_or(defaults.max_stay_nights),
            horizon_days: parsed(&lookup, "HOTELCAL_HORIZON_DAYS").unwrap_or(defaults.horizon_days),
            lock_timeout: parsed(&lookup, "HOTELCAL_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            hold_ttl: parsed(&lookup, "HOTELCAL_HOLD_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.hold_ttl),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("hotel.wal")
    }

    /// Engine settings on the system clock.
    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::new(
            Arc::new(SystemClock),
            self.max_stay_nights,
            self.horizon_days,
        );
        settings.lock_timeout = self.lock_timeout;
        settings.hold_ttl = self.hold_ttl;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.address(), "0.0.0.0:7878");
        assert_eq!(config.wal_path(), PathBuf::from("./data/hotel.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("HOTELCAL_PORT", "9000"),
            ("HOTELCAL_BIND", "127.0.0.1"),
            ("HOTELCAL_METRICS_PORT", "9100"),
            ("HOTELCAL_MAX_STAY_NIGHTS", "14"),
            ("HOTELCAL_LOCK_TIMEOUT_MS", "250"),
            ("HOTELCAL_HOLD_TTL_SECS", "60"),
        ]);
        assert_eq!(config.address(), "127.0.0.1:9000");
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.max_stay_nights, 14);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));

        let settings = config.engine_settings();
        assert_eq!(settings.hold_ttl, Duration::from_secs(60));
        assert_eq!(settings.validator.max_stay_nights(), 14);
    }

    #[test]
    fn each_field_parses_as_its_own_type() {
        let config = from_pairs(&[
            ("HOTELCAL_MAX_CONNECTIONS", "64"),
            ("HOTELCAL_COMPACT_THRESHOLD", " 5000 "),
            ("HOTELCAL_HORIZON_DAYS", "90"),
            ("HOTELCAL_HOLD_TTL_SECS", "120"),
        ]);
        assert_eq!(config.max_connections, 64usize);
        assert_eq!(config.compact_threshold, 5000u64);
        assert_eq!(config.horizon_days, 90u32);
        assert_eq!(config.hold_ttl, Duration::from_secs(120));
        assert_eq!(config.port, 7878u16);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = from_pairs(&[("HOTELCAL_PORT", "http"), ("HOTELCAL_MAX_CONNECTIONS", "-1")]);
        assert_eq!(config.port, 7878);
        assert_eq!(config.max_connections, 256);
    }
}
