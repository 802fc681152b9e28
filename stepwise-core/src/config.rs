//! Configuration types for Stepwise

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::Policies;
use crate::error::{Result, StepwiseError};
use crate::generation::{Cache, FileCache, MemoryCache};
use crate::trace::{JsonlSinkFactory, NullSinkFactory, TraceSinkFactory};

/// Default configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "stepwise.toml";

/// Environment variable naming an extra configuration file
pub const CONFIG_PATH_ENV: &str = "STEPWISE_CONFIG_PATH";

/// Main configuration for the Stepwise runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepwiseConfig {
    /// Trace persistence
    pub trace: TraceConfig,

    /// Generation cache
    pub cache: CacheConfig,

    /// Generation backend
    pub backend: BackendConfig,

    /// Policy settings handed to every context
    pub policies: Policies,

    /// Log output
    pub logging: LoggingConfig,
}

/// Trace persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Write JSONL traces; when false every run gets a discarding sink
    pub enabled: bool,

    /// Directory receiving `<run_id>.jsonl`
    pub dir: PathBuf,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".stepwise/traces"),
        }
    }
}

/// Cache backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Disabled,
    Memory,
    File,
}

/// Generation cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: CacheMode,

    /// Directory for the file cache
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Disabled,
            dir: PathBuf::from(".stepwise/cache"),
        }
    }
}

/// Generation backend provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendProvider {
    /// OpenAI-compatible chat completions API
    #[serde(rename = "openai")]
    OpenAi,

    /// No backend: every generation fails
    #[default]
    #[serde(rename = "stub")]
    Stub,
}

impl std::fmt::Display for BackendProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendProvider::OpenAi => write!(f, "openai"),
            BackendProvider::Stub => write!(f, "stub"),
        }
    }
}

/// Generation backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: BackendProvider,

    /// Model used when a request does not name one
    pub model: String,

    /// Override for OpenAI-compatible servers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Name of the environment variable holding the API key
    pub api_key_env: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: BackendProvider::Stub,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl StepwiseConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Loads in this order, later sources overriding earlier ones:
    /// 1. Defaults
    /// 2. `stepwise.toml` in the working directory
    /// 3. The file named by `STEPWISE_CONFIG_PATH`
    /// 4. `STEPWISE_`-prefixed environment variables, nested keys split on `__`
    ///    (`STEPWISE_BACKEND__MODEL`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or validation fails.
    pub fn load() -> Result<Self> {
        let extra = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_with(extra.as_deref())
    }

    /// Like [`load`](Self::load), with an explicit extra file taking the
    /// place of `STEPWISE_CONFIG_PATH`.
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(StepwiseConfig::default()))
            .merge(Toml::file(CONFIG_FILE));

        if let Some(path) = path {
            if !path.exists() {
                return Err(StepwiseError::Configuration(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            figment = merge_file(figment, path);
        }

        let config: StepwiseConfig = figment
            .merge(Env::prefixed("STEPWISE_").split("__"))
            .extract()
            .map_err(|e| {
                StepwiseError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single file, without the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{Figment, providers::Serialized};

        let figment = Figment::from(Serialized::defaults(StepwiseConfig::default()));
        let config: StepwiseConfig = merge_file(figment, path.as_ref())
            .extract()
            .map_err(|e| {
                StepwiseError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.backend.model.trim().is_empty() {
            return Err(StepwiseError::Configuration(
                "backend.model must not be empty".to_string(),
            ));
        }
        if self.backend.provider == BackendProvider::OpenAi && self.backend.api_key_env.is_empty() {
            return Err(StepwiseError::Configuration(
                "backend.api_key_env must name an environment variable".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured cache, if any
    pub fn build_cache(&self) -> Option<Arc<dyn Cache>> {
        let cache: Arc<dyn Cache> = match self.cache.mode {
            CacheMode::Disabled => return None,
            CacheMode::Memory => Arc::new(MemoryCache::new()),
            CacheMode::File => Arc::new(FileCache::new(&self.cache.dir)),
        };
        Some(cache)
    }

    /// Sink factory for run traces
    pub fn sink_factory(&self) -> Arc<dyn TraceSinkFactory> {
        if self.trace.enabled {
            Arc::new(JsonlSinkFactory::new(&self.trace.dir))
        } else {
            Arc::new(NullSinkFactory)
        }
    }
}

/// Merge a file provider chosen by extension; TOML when unknown.
fn merge_file(figment: figment::Figment, path: &Path) -> figment::Figment {
    use figment::providers::{Format, Json, Toml, Yaml};

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}
