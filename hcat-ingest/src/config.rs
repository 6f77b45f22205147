//! Ingest settings resolution
//!
//! Each setting resolves with ENV → TOML `[ingest]` → compiled default
//! priority. ENV names are `HCAT_` plus the upper-cased setting name
//! (e.g. `HCAT_CONFIDENCE_THRESHOLD`). Invalid values are logged and skipped.

use hcat_common::config::IngestTomlConfig;
use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, warn};

/// Resolved pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    /// Minimum auto-mapping score (0–1)
    pub confidence_threshold: f64,
    /// Score gap under which two candidate fields are ambiguous
    pub ambiguity_margin: f64,
    /// Children shown per preview node
    pub preview_child_cap: usize,
    /// Hierarchy depth beyond which rows are structural errors
    pub max_hierarchy_depth: usize,
    /// Task-queue workers in the HTTP service
    pub worker_count: usize,
    /// Retry budget for lock-contended writes
    pub max_lock_wait_ms: u64,
    /// Age after which terminal sessions are swept
    pub session_retention_hours: i64,
    /// Event bus buffer
    pub event_capacity: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.72,
            ambiguity_margin: 0.05,
            preview_child_cap: 50,
            max_hierarchy_depth: 64,
            worker_count: 2,
            max_lock_wait_ms: 5000,
            session_retention_hours: 168,
            event_capacity: 256,
        }
    }
}

impl IngestSettings {
    /// Resolve every setting from the environment and the TOML section
    pub fn resolve(toml: &IngestTomlConfig) -> Self {
        let defaults = Self::default();
        Self {
            confidence_threshold: resolve_setting(
                "confidence_threshold",
                toml.confidence_threshold,
                defaults.confidence_threshold,
                |v| (0.0..=1.0).contains(v),
            ),
            ambiguity_margin: resolve_setting(
                "ambiguity_margin",
                toml.ambiguity_margin,
                defaults.ambiguity_margin,
                |v| (0.0..=1.0).contains(v),
            ),
            preview_child_cap: resolve_setting(
                "preview_child_cap",
                toml.preview_child_cap,
                defaults.preview_child_cap,
                |v| *v > 0,
            ),
            max_hierarchy_depth: resolve_setting(
                "max_hierarchy_depth",
                toml.max_hierarchy_depth,
                defaults.max_hierarchy_depth,
                |v| (1..=10_000).contains(v),
            ),
            worker_count: resolve_setting(
                "worker_count",
                toml.worker_count,
                defaults.worker_count,
                |v| (1..=64).contains(v),
            ),
            max_lock_wait_ms: resolve_setting(
                "max_lock_wait_ms",
                toml.max_lock_wait_ms,
                defaults.max_lock_wait_ms,
                |v| *v <= 600_000,
            ),
            session_retention_hours: resolve_setting(
                "session_retention_hours",
                toml.session_retention_hours,
                defaults.session_retention_hours,
                |v| *v >= 0,
            ),
            event_capacity: resolve_setting(
                "event_capacity",
                toml.event_capacity,
                defaults.event_capacity,
                |v| *v > 0,
            ),
        }
    }
}

fn env_name(setting: &str) -> String {
    format!("HCAT_{}", setting.to_ascii_uppercase())
}

fn resolve_setting<T>(name: &str, toml_value: Option<T>, default: T, valid: fn(&T) -> bool) -> T
where
    T: FromStr + Display + Copy,
{
    let env_var = env_name(name);
    if let Ok(raw) = std::env::var(&env_var) {
        match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => {
                debug!(setting = name, %value, "Setting loaded from environment");
                return value;
            }
            _ => warn!(
                setting = name,
                env_var = %env_var,
                raw = %raw,
                "Invalid environment value, ignoring"
            ),
        }
    }

    if let Some(value) = toml_value {
        if valid(&value) {
            debug!(setting = name, %value, "Setting loaded from TOML config");
            return value;
        }
        warn!(setting = name, %value, "Invalid TOML value, using default");
    }

    default
}
