//! Configuration loading and root folder resolution
//!
//! Root folder resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file never aborts startup: a warning is logged
//! and compiled defaults are used instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit TOML config file
pub const CONFIG_PATH_ENV: &str = "HCAT_CONFIG";

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file (stdout when absent)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// `[ingest]` section of the TOML config
///
/// Every field is optional; unset fields fall back to environment overrides
/// and then to compiled defaults in the ingest service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestTomlConfig {
    pub confidence_threshold: Option<f64>,
    pub ambiguity_margin: Option<f64>,
    pub preview_child_cap: Option<usize>,
    pub max_hierarchy_depth: Option<usize>,
    pub worker_count: Option<usize>,
    pub max_lock_wait_ms: Option<u64>,
    pub session_retention_hours: Option<i64>,
    pub event_capacity: Option<usize>,
}

/// TOML configuration file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding databases, assets and manifests
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP bind address for the service (e.g. "127.0.0.1:5740")
    #[serde(default)]
    pub bind_address: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ingest: IngestTomlConfig,
}

/// Load and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Load the TOML config, degrading to defaults when it is missing or invalid
///
/// Lookup order for the file itself: explicit path, `HCAT_CONFIG`, then the
/// platform config directory.
pub fn load_toml_config_or_default(explicit: Option<&Path>) -> TomlConfig {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
        .or_else(default_config_path);

    let Some(path) = path else {
        warn!("No config directory available on this platform, using compiled defaults");
        return TomlConfig::default();
    };

    if !path.exists() {
        info!("Config file not found at {}, using defaults", path.display());
        return TomlConfig::default();
    }

    match load_toml_config(&path) {
        Ok(config) => {
            info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Failed to load config {}: {}. Using defaults", path.display(), e);
            TomlConfig::default()
        }
    }
}

/// Write a TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Default config file location (`<config dir>/hcat/hcat-ingest.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hcat").join("hcat-ingest.toml"))
}

/// Resolve the root folder by priority: CLI → ENV → TOML → compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/hcat (or /var/lib/hcat for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("hcat"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/hcat"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("hcat"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/hcat"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("hcat"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\hcat"))
    } else {
        PathBuf::from("./hcat_data")
    }
}

/// Creates the root folder layout on first run
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create root, asset and manifest directories if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        for dir in [self.root.clone(), self.asset_dir(), self.manifest_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                info!("Created directory: {}", dir.display());
            }
        }
        Ok(())
    }

    /// Pipeline state database
    pub fn database_path(&self) -> PathBuf {
        self.root.join("hcat-ingest.db")
    }

    /// Reference catalog database
    pub fn catalog_database_path(&self) -> PathBuf {
        self.root.join("catalog.db")
    }

    pub fn asset_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }
}
