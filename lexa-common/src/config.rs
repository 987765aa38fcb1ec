//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`LEXA_ROOT_FOLDER`)
//! 3. TOML config file (`root_folder`)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file never prevents startup: a warning is
//! logged and compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "LEXA_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "lexa.db";

/// Config file name inside the platform config directory
pub const CONFIG_FILE: &str = "lexa.toml";

/// Top-level TOML configuration
///
/// Every section is optional in the file; missing sections take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Root folder holding the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default tracing filter level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How a chunk invocation continues once a chunk has committed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContinuationMode {
    /// Keep looping inside the current invocation until the time budget runs out
    #[default]
    Loop,
    /// Hand the next chunk to the work queue as a fresh invocation
    Queue,
}

/// `[engine]` section - chunked job execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Units processed per chunk
    pub chunk_size: usize,
    /// Wall-clock budget of one invocation (ms)
    pub time_budget_ms: u64,
    pub continuation: ContinuationMode,
    /// Lifetime of the per-job advisory lease (ms)
    pub lease_ttl_ms: u64,
    /// Capacity of the chunk work queue
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5000,
            time_budget_ms: 50_000,
            continuation: ContinuationMode::Loop,
            lease_ttl_ms: 120_000,
            queue_capacity: 64,
        }
    }
}

/// Where an affix attaches to the stem
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AffixPosition {
    Prefix,
    Suffix,
}

/// One productive morphology rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffixRuleConfig {
    pub affix: String,
    pub position: AffixPosition,
    /// Fixed classification assigned by the affix itself; `None` inherits from the stem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Vec<String>>,
    pub confidence: f32,
    #[serde(default = "default_min_stem_len")]
    pub min_stem_len: usize,
    /// Endings tried on the stem when the affix swallowed them ("gat" + "o")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restore_endings: Vec<String>,
}

fn default_min_stem_len() -> usize {
    3
}

/// `[cascade]` section - resolution cascade tuning
///
/// Thresholds and discount factors are empirically tuned values, not invariants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CascadeConfig {
    pub acceptance_threshold: f32,
    /// Multiplicative confidence discount per synonym hop
    pub propagation_discount: f32,
    pub max_propagation_hops: usize,
    /// Confidence given to regional lexicon hits
    pub regional_confidence: f32,
    /// Words per generative classifier call
    pub generative_batch_size: usize,
    pub affix_rules: Vec<AffixRuleConfig>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            propagation_discount: 0.85,
            max_propagation_hops: 3,
            regional_confidence: 0.9,
            generative_batch_size: 25,
            affix_rules: default_affix_rules(),
        }
    }
}

fn default_affix_rules() -> Vec<AffixRuleConfig> {
    let inherit = |affix: &str, position, confidence, restore: &[&str]| AffixRuleConfig {
        affix: affix.to_string(),
        position,
        classification: None,
        confidence,
        min_stem_len: 3,
        restore_endings: restore.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        inherit("inho", AffixPosition::Suffix, 0.85, &["o", "a"]),
        inherit("inha", AffixPosition::Suffix, 0.85, &["a", "o"]),
        inherit("zinho", AffixPosition::Suffix, 0.85, &[]),
        inherit("zinha", AffixPosition::Suffix, 0.85, &[]),
        inherit("ão", AffixPosition::Suffix, 0.8, &["o", "a"]),
        inherit("ona", AffixPosition::Suffix, 0.8, &["a", "o"]),
        inherit("s", AffixPosition::Suffix, 0.9, &[]),
        inherit("des", AffixPosition::Prefix, 0.7, &[]),
        AffixRuleConfig {
            affix: "mente".to_string(),
            position: AffixPosition::Suffix,
            classification: Some(vec!["modo".to_string()]),
            confidence: 0.7,
            min_stem_len: 3,
            restore_endings: Vec::new(),
        },
    ]
}

/// Circuit breaker aggressiveness preset name
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BreakerPreset {
    Critical,
    #[default]
    Normal,
    Relaxed,
}

/// `[classifier]` section - generative classifier fallback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Endpoint URL; `None` disables the generative fallback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub breaker: BreakerPreset,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "lexa-classifier".to_string(),
            api_key: None,
            timeout_ms: 30_000,
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            breaker: BreakerPreset::Normal,
        }
    }
}

/// `[rate_limit]` section - user-triggered actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub cancel_per_minute: u32,
    pub start_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cancel_per_minute: 10,
            start_per_minute: 30,
        }
    }
}

/// Resolves the root folder following the documented priority order
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_config: Option<TomlConfig>,
}

impl RootFolderResolver {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            cli_arg: None,
            toml_config: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml_config(mut self, config: &TomlConfig) -> Self {
        self.toml_config = Some(config.clone());
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            debug!(module = %self.module_name, "Root folder from command line");
            return path.clone();
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                debug!(module = %self.module_name, "Root folder from {}", ROOT_FOLDER_ENV);
                return PathBuf::from(path);
            }
        }

        // Priority 3: TOML config file
        if let Some(path) = self.toml_config.as_ref().and_then(|c| c.root_folder.clone()) {
            debug!(module = %self.module_name, "Root folder from TOML config");
            return path;
        }

        // Priority 4: OS-dependent compiled default
        default_root_folder()
    }
}

/// Creates the root folder and locates the database inside it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("lexa"))
        .unwrap_or_else(|| PathBuf::from("./lexa_data"))
}

/// Default config file location (`<config dir>/lexa/lexa.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("lexa").join(CONFIG_FILE))
}

/// Load the TOML config, falling back to defaults when the file is missing
///
/// A file that exists but fails to parse is a configuration error: silently
/// ignoring a typo would run with surprising settings.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(p) => p,
        None => {
            warn!("Could not determine config directory, using defaults");
            return Ok(TomlConfig::default());
        }
    };

    if !path.exists() {
        warn!("Config file not found at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Write config atomically (temp file + rename), permissions 0600 on Unix
pub fn write_toml_config(config: &TomlConfig, target: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = target.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&temp_path, target)?;
    Ok(())
}
