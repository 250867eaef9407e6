use crate::db;
use crate::error::{EngineError, EngineResult};
use anyhow::Context;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_LOG: &str = "GRADEBOOKD_LOG";
pub const ENV_WORKSPACE: &str = "GRADEBOOKD_WORKSPACE";
pub const ENV_BUSY_TIMEOUT_MS: &str = "GRADEBOOKD_BUSY_TIMEOUT_MS";

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

pub const AVERAGES_SETTINGS_KEY: &str = "setup.averages";

/// Process-level configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
    pub busy_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            workspace: None,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(filter) = lookup(ENV_LOG).filter(|s| !s.trim().is_empty()) {
            cfg.log_filter = filter;
        }
        if let Some(ws) = lookup(ENV_WORKSPACE).filter(|s| !s.trim().is_empty()) {
            cfg.workspace = Some(PathBuf::from(ws));
        }
        if let Some(raw) = lookup(ENV_BUSY_TIMEOUT_MS) {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_BUSY_TIMEOUT_MS} must be milliseconds, got {raw:?}"))?;
            cfg.busy_timeout = Duration::from_millis(ms);
        }
        Ok(cfg)
    }
}

/// Workspace-level knobs for averaging and statistics, stored as the
/// `setup.averages` settings section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AveragesSettings {
    /// Full recompute writes 0.00 for students without grades in a subject.
    pub include_empty_on_full: bool,
    /// Classes whose mean general average is below this are flagged.
    pub difficulty_threshold: f64,
    pub top_students: usize,
}

impl Default for AveragesSettings {
    fn default() -> Self {
        Self {
            include_empty_on_full: false,
            difficulty_threshold: 10.0,
            top_students: 5,
        }
    }
}

pub fn load_averages_settings(conn: &Connection) -> EngineResult<AveragesSettings> {
    let Some(raw) = db::settings_get_json(conn, AVERAGES_SETTINGS_KEY)? else {
        return Ok(AveragesSettings::default());
    };
    match serde_json::from_value::<AveragesSettings>(raw) {
        Ok(s) => Ok(s),
        Err(e) => {
            tracing::warn!(error = %e, "stored averages settings unreadable; using defaults");
            Ok(AveragesSettings::default())
        }
    }
}

/// Merge `patch` over the current section and persist the result.
pub fn update_averages_settings(
    conn: &Connection,
    patch: &serde_json::Value,
) -> EngineResult<AveragesSettings> {
    let Some(patch_obj) = patch.as_object() else {
        return Err(EngineError::invalid("patch must be an object"));
    };

    let current = load_averages_settings(conn)?;
    let mut merged = serde_json::to_value(&current)
        .map_err(|e| EngineError::invalid(e.to_string()))?;
    if let Some(obj) = merged.as_object_mut() {
        for (k, v) in patch_obj {
            obj.insert(k.clone(), v.clone());
        }
    }

    let next: AveragesSettings =
        serde_json::from_value(merged.clone()).map_err(|e| EngineError::invalid(e.to_string()))?;
    if !next.difficulty_threshold.is_finite() || next.difficulty_threshold < 0.0 {
        return Err(EngineError::invalid("difficultyThreshold must be >= 0"));
    }
    db::settings_set_json(conn, AVERAGES_SETTINGS_KEY, &merged)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn from_lookup_defaults_when_unset() {
        let cfg = DaemonConfig::from_lookup(|_| None).expect("config");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.workspace, None);
        assert_eq!(cfg.busy_timeout, Duration::from_secs(30));
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG, "gradebookd=debug"),
            (ENV_WORKSPACE, "/tmp/ws"),
            (ENV_BUSY_TIMEOUT_MS, "1500"),
        ]);
        let cfg = DaemonConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
            .expect("config");
        assert_eq!(cfg.log_filter, "gradebookd=debug");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(cfg.busy_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn from_lookup_rejects_bad_timeout() {
        let res = DaemonConfig::from_lookup(|k| {
            (k == ENV_BUSY_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert!(res.is_err());
    }

    #[test]
    fn settings_deny_unknown_fields() {
        let res = serde_json::from_value::<AveragesSettings>(serde_json::json!({ "bogus": 1 }));
        assert!(res.is_err());
        let partial: AveragesSettings =
            serde_json::from_value(serde_json::json!({ "topStudents": 3 })).expect("partial");
        assert_eq!(partial.top_students, 3);
        assert!(!partial.include_empty_on_full);
    }
}
