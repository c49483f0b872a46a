//! planrelay configuration types and loading

use eyre::{Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::sink::DEFAULT_CHANNEL_CAPACITY;

const PLANNER_SYSTEM_PROMPT: &str = "You are an elite cycling coach. Given a rider's goal, output a high-level \
training plan with extreme brevity. Use short bullet points and bold all key metrics (distances, times, zones). \
Include weekly structure, intensity zones, rest days, and a progression rule. No introduction or conclusion. \
Keep it under 150 words.";

const EXECUTOR_SYSTEM_PROMPT: &str = "You are a precise schedule builder. Convert a high-level cycling plan into a \
day-by-day schedule. Output strictly as JSON Lines: one JSON object per line with the keys \"day\", \"activity\", \
\"duration\", \"intensity\" and \"notes\". Keep fields brief. No markdown, no other text.";

/// Main planrelay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// First stage: turns the query into a terse plan
    #[serde(deserialize_with = "planner_settings")]
    pub planner: StageSettings,

    /// Second stage: turns the plan into a schedule
    #[serde(deserialize_with = "executor_settings")]
    pub executor: StageSettings,

    /// Route lookup proxy
    pub directions: DirectionsSettings,

    /// Deployment environment; the env file is only read outside production
    pub environment: Environment,

    /// Local key-value file loaded into the process environment at startup
    #[serde(rename = "env-file")]
    pub env_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            planner: StageSettings::planner(),
            executor: StageSettings::executor(),
            directions: DirectionsSettings::default(),
            environment: Environment::default(),
            env_file: PathBuf::from(".env.local"),
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: planrelay.yml
        let local_config = PathBuf::from("planrelay.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/planrelay/planrelay.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("planrelay").join("planrelay.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Populate the process environment from `env-file` outside production
    ///
    /// Variables already set in the environment win over the file. A missing
    /// file is not an error. Returns true when a file was loaded.
    pub fn load_env_file(&self) -> Result<bool> {
        debug!(environment = ?self.environment, path = %self.env_file.display(), "load_env_file: called");
        if self.environment == Environment::Production {
            debug!("load_env_file: production, skipping");
            return Ok(false);
        }
        if !self.env_file.exists() {
            debug!("load_env_file: no env file");
            return Ok(false);
        }
        dotenvy::from_path(&self.env_file)
            .context(format!("Failed to load env file {}", self.env_file.display()))?;
        info!("Loaded environment from: {}", self.env_file.display());
        Ok(true)
    }

    /// Resolve both stages into immutable runtime configuration
    ///
    /// Credentials are read from the environment here, once. A missing
    /// credential is only warned about: the stage fails when it is run.
    pub fn resolve_stages(&self) -> (StageConfig, StageConfig) {
        let planner = self.planner.resolve();
        let executor = self.executor.resolve();
        for stage in [&planner, &executor] {
            if stage.api_key.is_none() {
                warn!(
                    stage = %stage.name,
                    env = %stage.api_key_env,
                    "Stage credential not set; requests will fail"
                );
            }
        }
        (planner, executor)
    }

    /// Resolve the directions proxy settings, warning when its key is unset
    pub fn resolve_directions(&self) -> DirectionsConfig {
        let directions = self.directions.resolve();
        if directions.api_key.is_none() {
            warn!(env = %directions.api_key_env, "Directions key not set; route lookups will fail");
        }
        directions
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Frames buffered per session before the session waits on the client
    #[serde(rename = "channel-capacity")]
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Stage settings as written in the config file
///
/// Keys left out of a stage section fall back to that stage's own defaults,
/// not to the other stage's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    /// Stage name; prefixes the stage's event nodes
    pub name: String,

    /// Chat-completions endpoint URL
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// System instruction sent with every request
    #[serde(rename = "system-prompt")]
    pub system_prompt: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Field of the `_done` event carrying the stage's full output
    #[serde(rename = "output-field")]
    pub output_field: String,

    /// Status text of the `_start` event
    #[serde(rename = "start-status")]
    pub start_status: String,

    /// Status text of the `_done` event
    #[serde(rename = "done-status")]
    pub done_status: String,
}

fn planner_settings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StageSettings, D::Error> {
    overlay_stage(StageSettings::planner(), deserializer)
}

fn executor_settings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StageSettings, D::Error> {
    overlay_stage(StageSettings::executor(), deserializer)
}

// Merge the keys present in the file over the stage's defaults.
fn overlay_stage<'de, D>(defaults: StageSettings, deserializer: D) -> Result<StageSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<serde_yaml::Mapping>::deserialize(deserializer)?.unwrap_or_default();
    let serde_yaml::Value::Mapping(mut merged) = serde_yaml::to_value(defaults).map_err(D::Error::custom)? else {
        return Err(D::Error::custom("stage defaults did not serialize to a mapping"));
    };
    for (key, value) in overrides {
        merged.insert(key, value);
    }
    serde_yaml::from_value(serde_yaml::Value::Mapping(merged)).map_err(D::Error::custom)
}

impl StageSettings {
    /// Defaults for the planner stage
    pub fn planner() -> Self {
        Self {
            name: "planner".to_string(),
            endpoint: "https://integrate.api.nvidia.com/v1/chat/completions".to_string(),
            model: "moonshotai/kimi-k2-instruct".to_string(),
            api_key_env: "NVIDIA_API_KEY".to_string(),
            system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            timeout_ms: 180_000,
            output_field: "plan".to_string(),
            start_status: "Planner is thinking...".to_string(),
            done_status: "Planner finished".to_string(),
        }
    }

    /// Defaults for the executor stage
    pub fn executor() -> Self {
        Self {
            name: "executor".to_string(),
            endpoint: "https://api.mistral.ai/v1/chat/completions".to_string(),
            model: "mistral-small-latest".to_string(),
            api_key_env: "MISTRAL_API_KEY".to_string(),
            system_prompt: EXECUTOR_SYSTEM_PROMPT.to_string(),
            temperature: 0.5,
            max_tokens: 2048,
            timeout_ms: 180_000,
            output_field: "final_response".to_string(),
            start_status: "Executor is scheduling...".to_string(),
            done_status: "Executor finished".to_string(),
        }
    }

    /// Read the credential from the environment and freeze the settings
    pub fn resolve(&self) -> StageConfig {
        let api_key = std::env::var(&self.api_key_env).ok().filter(|key| !key.trim().is_empty());
        debug!(stage = %self.name, has_key = api_key.is_some(), "resolve: called");
        StageConfig {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            api_key_env: self.api_key_env.clone(),
            api_key,
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_millis(self.timeout_ms),
            output_field: self.output_field.clone(),
            start_status: self.start_status.clone(),
            done_status: self.done_status.clone(),
        }
    }
}

/// Directions proxy settings as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionsSettings {
    /// Directions service URL
    pub endpoint: String,

    /// Environment variable containing the service key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Travel mode used when the request names none
    #[serde(rename = "default-mode")]
    pub default_mode: String,

    /// Travel mode tried once when the first finds no route
    #[serde(rename = "fallback-mode")]
    pub fallback_mode: String,

    /// Per-lookup timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for DirectionsSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://maps.googleapis.com/maps/api/directions/json".to_string(),
            api_key_env: "GOOGLE_MAPS_API_KEY".to_string(),
            default_mode: "bicycling".to_string(),
            fallback_mode: "driving".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl DirectionsSettings {
    pub fn resolve(&self) -> DirectionsConfig {
        let api_key = std::env::var(&self.api_key_env).ok().filter(|key| !key.trim().is_empty());
        debug!(has_key = api_key.is_some(), "DirectionsSettings::resolve: called");
        DirectionsConfig {
            endpoint: self.endpoint.clone(),
            api_key_env: self.api_key_env.clone(),
            api_key,
            default_mode: self.default_mode.clone(),
            fallback_mode: self.fallback_mode.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Immutable runtime configuration of the directions proxy
#[derive(Clone)]
pub struct DirectionsConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub api_key: Option<String>,
    pub default_mode: String,
    pub fallback_mode: String,
    pub timeout: Duration,
}

impl fmt::Debug for DirectionsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionsConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("default_mode", &self.default_mode)
            .field("fallback_mode", &self.fallback_mode)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Immutable runtime configuration of one stage
///
/// Built once at startup and shared read-only by every session.
#[derive(Clone)]
pub struct StageConfig {
    pub name: String,
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub output_field: String,
    pub start_status: String,
    pub done_status: String,
}

impl fmt::Debug for StageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("output_field", &self.output_field)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.planner.name, "planner");
        assert_eq!(config.planner.output_field, "plan");
    }

    #[test]
    fn test_stage_defaults() {
        let planner = StageSettings::planner();
        let executor = StageSettings::executor();

        assert_eq!(planner.api_key_env, "NVIDIA_API_KEY");
        assert_eq!(planner.timeout_ms, 180_000);
        assert_eq!(executor.name, "executor");
        assert_eq!(executor.api_key_env, "MISTRAL_API_KEY");
        assert_eq!(executor.output_field, "final_response");
        assert!((executor.temperature - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9090
  channel-capacity: 8

planner:
  name: planner
  endpoint: http://localhost:1234/v1/chat/completions
  model: local-planner
  api-key-env: MY_PLANNER_KEY
  max-tokens: 512
  timeout-ms: 60000

executor:
  name: executor
  model: local-executor
  output-field: final_response

environment: production
env-file: .env.test
log-level: debug
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.channel_capacity, 8);
        assert_eq!(config.planner.model, "local-planner");
        assert_eq!(config.planner.api_key_env, "MY_PLANNER_KEY");
        assert_eq!(config.planner.max_tokens, 512);
        assert_eq!(config.executor.model, "local-executor");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.env_file, PathBuf::from(".env.test"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_missing_executor_section_uses_executor_defaults() {
        let config: Config = serde_yaml::from_str("planner:\n  model: tiny\n").unwrap();

        assert_eq!(config.planner.model, "tiny");
        assert_eq!(config.executor.name, "executor");
        assert_eq!(config.executor.api_key_env, "MISTRAL_API_KEY");
    }

    #[test]
    fn test_partial_executor_section_keeps_executor_defaults() {
        let config: Config = serde_yaml::from_str("executor:\n  model: local-executor\n").unwrap();

        assert_eq!(config.executor.model, "local-executor");
        assert_eq!(config.executor.name, "executor");
        assert_eq!(config.executor.api_key_env, "MISTRAL_API_KEY");
        assert_eq!(config.executor.output_field, "final_response");
        assert_eq!(config.planner.name, "planner");
    }

    #[test]
    fn test_directions_section_overrides_defaults() {
        let config: Config = serde_yaml::from_str("directions:\n  default-mode: walking\n  timeout-ms: 500\n").unwrap();

        assert_eq!(config.directions.default_mode, "walking");
        assert_eq!(config.directions.fallback_mode, "driving");
        assert_eq!(config.directions.api_key_env, "GOOGLE_MAPS_API_KEY");
        assert_eq!(config.directions.resolve().timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_directions_debug_never_prints_key() {
        let mut directions = DirectionsSettings::default().resolve();
        directions.api_key = Some("maps-secret".to_string());

        let rendered = format!("{:?}", directions);
        assert!(!rendered.contains("maps-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_unknown_stage_key_type_is_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("planner:\n  max-tokens: lots\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.yml");
        fs::write(&path, "server:\n  port: 7000\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_load_from_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/planrelay.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    #[serial]
    fn test_resolve_reads_credential_once() {
        unsafe {
            std::env::set_var("PLANRELAY_TEST_KEY", "secret-value");
        }
        let settings = StageSettings {
            api_key_env: "PLANRELAY_TEST_KEY".to_string(),
            ..StageSettings::planner()
        };
        let stage = settings.resolve();
        unsafe {
            std::env::remove_var("PLANRELAY_TEST_KEY");
        }

        assert_eq!(stage.api_key.as_deref(), Some("secret-value"));
        assert_eq!(stage.timeout, Duration::from_secs(180));
    }

    #[test]
    #[serial]
    fn test_resolve_treats_blank_credential_as_missing() {
        unsafe {
            std::env::set_var("PLANRELAY_BLANK_KEY", "  ");
        }
        let settings = StageSettings {
            api_key_env: "PLANRELAY_BLANK_KEY".to_string(),
            ..StageSettings::planner()
        };
        let stage = settings.resolve();
        unsafe {
            std::env::remove_var("PLANRELAY_BLANK_KEY");
        }

        assert!(stage.api_key.is_none());
    }

    #[test]
    fn test_debug_never_prints_credential() {
        let mut stage = StageSettings::planner().resolve();
        stage.api_key = Some("sk-very-secret".to_string());

        let rendered = format!("{:?}", stage);
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    #[serial]
    fn test_env_file_loaded_outside_production() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env.local");
        fs::write(&path, "PLANRELAY_ENV_FILE_KEY=from-file\n").unwrap();

        let config = Config {
            env_file: path,
            ..Config::default()
        };
        assert!(config.load_env_file().unwrap());
        assert_eq!(std::env::var("PLANRELAY_ENV_FILE_KEY").unwrap(), "from-file");
        unsafe {
            std::env::remove_var("PLANRELAY_ENV_FILE_KEY");
        }
    }

    #[test]
    #[serial]
    fn test_env_file_ignored_in_production() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env.local");
        fs::write(&path, "PLANRELAY_PROD_KEY=from-file\n").unwrap();

        let config = Config {
            env_file: path,
            environment: Environment::Production,
            ..Config::default()
        };
        assert!(!config.load_env_file().unwrap());
        assert!(std::env::var("PLANRELAY_PROD_KEY").is_err());
    }
}
