use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid settings document: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Per-run settings with a closed set of fields. Unknown keys are rejected at
/// load time; dynamic dictionaries from callers do not survive the boundary.
///
/// Merge order is platform defaults → spider settings → schedule overrides →
/// dispatch overrides, later layers winning field-wise (`vars` are unioned).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunSettings {
    /// Crawl tool executable; relative paths resolve against the project root.
    pub crawl_tool: Option<PathBuf>,
    pub wall_clock_limit_sec: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub tail_poll_ms: Option<u64>,
    pub ingest_batch_size: Option<usize>,
    pub ingest_flush_sec: Option<u64>,
    /// Payload keys hashed into the record fingerprint. Empty means "all".
    pub fingerprint_fields: Option<Vec<String>>,
    /// URL path markers whose trailing segment is a stable record identity.
    pub url_id_markers: Option<Vec<String>>,
    /// Extra `-s KEY=VALUE` pairs passed through to the crawl subprocess.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

impl RunSettings {
    pub fn from_json(raw: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Layer `over` on top of `self`, yielding the effective settings.
    pub fn merged(&self, over: &RunSettings) -> RunSettings {
        let mut vars = self.vars.clone();
        vars.extend(over.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        RunSettings {
            crawl_tool: over.crawl_tool.clone().or_else(|| self.crawl_tool.clone()),
            wall_clock_limit_sec: over.wall_clock_limit_sec.or(self.wall_clock_limit_sec),
            memory_limit_mb: over.memory_limit_mb.or(self.memory_limit_mb),
            tail_poll_ms: over.tail_poll_ms.or(self.tail_poll_ms),
            ingest_batch_size: over.ingest_batch_size.or(self.ingest_batch_size),
            ingest_flush_sec: over.ingest_flush_sec.or(self.ingest_flush_sec),
            fingerprint_fields: over
                .fingerprint_fields
                .clone()
                .or_else(|| self.fingerprint_fields.clone()),
            url_id_markers: over
                .url_id_markers
                .clone()
                .or_else(|| self.url_id_markers.clone()),
            vars,
        }
    }
}

/// Engine-wide knobs, sourced from the `CTL_*` environment with documented
/// defaults and floors.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub data_root: PathBuf,
    pub max_concurrent_runs: usize,
    pub max_per_spider: usize,
    pub max_per_project: Option<usize>,
    pub short_run_threshold: Duration,
    pub request_floor: i64,
    pub scheduler_tick: Duration,
    pub tail_poll: Duration,
    /// Per-run byte ceiling on buffered tail reads; past it the tailer lets
    /// the file grow on disk and drains later.
    pub tail_high_water_bytes: u64,
    pub file_wait: Duration,
    pub drain_grace: Duration,
    pub shutdown_grace: Duration,
    pub ingest_batch_size: usize,
    pub ingest_flush: Duration,
    pub ingest_retries: u32,
    pub broadcast_interval: Duration,
    pub reconcile_interval: Duration,
    pub wall_clock_limit: Duration,
    pub memory_limit_mb: u64,
    pub max_requeue: u32,
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl ControlConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            max_concurrent_runs: 3,
            max_per_spider: 1,
            max_per_project: None,
            short_run_threshold: Duration::from_secs(10),
            request_floor: 10,
            scheduler_tick: Duration::from_secs(10),
            tail_poll: Duration::from_millis(500),
            tail_high_water_bytes: 10_000_000,
            file_wait: Duration::from_secs(30),
            drain_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            ingest_batch_size: 100,
            ingest_flush: Duration::from_secs(2),
            ingest_retries: 5,
            broadcast_interval: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(300),
            wall_clock_limit: Duration::from_secs(3600),
            memory_limit_mb: 500,
            max_requeue: 100,
            max_restarts: 5,
            restart_window: Duration::from_secs(300),
        }
    }

    /// Read the recognized `CTL_*` variables from the process environment.
    pub fn from_env(data_root: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        Self::from_lookup(data_root, |var| std::env::var(var).ok())
    }

    /// Same as [`ControlConfig::from_env`] but with an injectable lookup.
    pub fn from_lookup(
        data_root: impl Into<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        let mut cfg = Self::new(data_root);

        if let Some(n) = parse_var(&lookup, "CTL_MAX_CONCURRENT_RUNS")? {
            cfg.max_concurrent_runs = n;
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_SHORT_RUN_THRESHOLD_SEC")? {
            cfg.short_run_threshold = Duration::from_secs(n);
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_SCHEDULER_TICK_SEC")? {
            cfg.scheduler_tick = Duration::from_secs(n.max(1));
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_TAIL_POLL_MS")? {
            cfg.tail_poll = Duration::from_millis(n.max(100));
        }
        if let Some(n) = parse_var(&lookup, "CTL_INGEST_BATCH_SIZE")? {
            cfg.ingest_batch_size = n;
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_INGEST_FLUSH_SEC")? {
            cfg.ingest_flush = Duration::from_secs(n);
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_BROADCAST_INTERVAL_SEC")? {
            cfg.broadcast_interval = Duration::from_secs(n);
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_RECONCILE_INTERVAL_SEC")? {
            cfg.reconcile_interval = Duration::from_secs(n);
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_RUN_WALL_CLOCK_SEC")? {
            cfg.wall_clock_limit = Duration::from_secs(n);
        }
        if let Some(n) = parse_var(&lookup, "CTL_RUN_MEMORY_MB")? {
            cfg.memory_limit_mb = n;
        }
        if let Some(n) = parse_var(&lookup, "CTL_MAX_RESTARTS")? {
            cfg.max_restarts = n;
        }
        if let Some(n) = parse_var::<u64>(&lookup, "CTL_RESTART_WINDOW_SEC")? {
            cfg.restart_window = Duration::from_secs(n);
        }

        Ok(cfg)
    }

    pub fn runs_root(&self) -> PathBuf {
        self.data_root.join("runs")
    }

    pub fn pids_root(&self) -> PathBuf {
        self.data_root.join("pids")
    }

    pub fn logs_root(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_root.join("control.db")
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, SettingsError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SettingsError::InvalidEnv { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let err = RunSettings::from_json(r#"{"walll_clock_limit_sec": 5}"#);
        assert!(err.is_err());
    }

    #[test]
    fn settings_merge_is_later_wins() {
        let base = RunSettings {
            wall_clock_limit_sec: Some(60),
            ingest_batch_size: Some(10),
            vars: BTreeMap::from([
                ("DOWNLOAD_DELAY".to_string(), "1".to_string()),
                ("DEPTH_LIMIT".to_string(), "2".to_string()),
            ]),
            ..Default::default()
        };
        let over = RunSettings {
            wall_clock_limit_sec: Some(120),
            vars: BTreeMap::from([("DOWNLOAD_DELAY".to_string(), "0".to_string())]),
            ..Default::default()
        };

        let merged = base.merged(&over);
        assert_eq!(merged.wall_clock_limit_sec, Some(120));
        assert_eq!(merged.ingest_batch_size, Some(10));
        assert_eq!(merged.vars["DOWNLOAD_DELAY"], "0");
        assert_eq!(merged.vars["DEPTH_LIMIT"], "2");
    }

    #[test]
    fn env_defaults_and_overrides() {
        let cfg = ControlConfig::from_lookup("/data", |_| None).unwrap();
        assert_eq!(cfg.max_concurrent_runs, 3);
        assert_eq!(cfg.scheduler_tick, Duration::from_secs(10));
        assert_eq!(cfg.tail_poll, Duration::from_millis(500));
        assert_eq!(cfg.memory_limit_mb, 500);

        let cfg = ControlConfig::from_lookup("/data", |var| match var {
            "CTL_MAX_CONCURRENT_RUNS" => Some("8".to_string()),
            "CTL_SCHEDULER_TICK_SEC" => Some("0".to_string()),
            "CTL_TAIL_POLL_MS" => Some("10".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.max_concurrent_runs, 8);
        // Floors: tick never below 1s, tail poll never below 100ms.
        assert_eq!(cfg.scheduler_tick, Duration::from_secs(1));
        assert_eq!(cfg.tail_poll, Duration::from_millis(100));
    }

    #[test]
    fn malformed_env_is_an_error() {
        let err = ControlConfig::from_lookup("/data", |var| {
            (var == "CTL_RUN_MEMORY_MB").then(|| "lots".to_string())
        });
        assert!(matches!(
            err,
            Err(SettingsError::InvalidEnv { var: "CTL_RUN_MEMORY_MB", .. })
        ));
    }
}
