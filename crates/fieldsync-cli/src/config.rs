//! CLI config file and environment resolution.

use std::env;
use std::path::{Path, PathBuf};

use fieldsync_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "fieldsync.json";
const DB_FILE_NAME: &str = "fieldsync.db";

pub const REMOTE_URL_ENV: &str = "FIELDSYNC_REMOTE_URL";
pub const AUTH_TOKEN_ENV: &str = "FIELDSYNC_AUTH_TOKEN";
pub const DB_PATH_ENV: &str = "FIELDSYNC_DB_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineConfig,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
        .join(CONFIG_FILE_NAME)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
        .join(DB_FILE_NAME)
}

impl CliConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|error| {
            CliError::Config(format!("Failed to read config at {}: {error}", path.display()))
        })?;
        let mut config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            CliError::Config(format!("Failed to parse config at {}: {error}", path.display()))
        })?;
        config.remote_url = non_blank(config.remote_url.take());
        config
            .engine
            .validate()
            .map_err(|error| CliError::Config(format!("{}: {error}", path.display())))?;
        Ok(config)
    }
}

/// Everything a command needs to open the engine
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub remote_url: Option<String>,
    pub auth_token: Option<String>,
    pub engine: EngineConfig,
}

impl Settings {
    /// Flags win over environment, environment over the config file
    pub fn resolve(
        db_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
        remote_url: Option<String>,
    ) -> Result<Self, CliError> {
        let config_path = config_path.unwrap_or_else(default_config_path);
        let config = CliConfig::load_from_path(&config_path)?;

        let remote_url = pick_remote_url(
            remote_url,
            env::var(REMOTE_URL_ENV).ok(),
            config.remote_url,
        );
        if let Some(url) = remote_url.as_deref() {
            if !has_http_scheme(url) {
                return Err(CliError::Config(format!(
                    "remote URL must start with http:// or https://, got '{url}'"
                )));
            }
        }

        let db_path = db_path
            .or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from))
            .or(config.db_path)
            .unwrap_or_else(default_db_path);

        Ok(Self {
            db_path,
            remote_url,
            auth_token: non_blank(env::var(AUTH_TOKEN_ENV).ok()),
            engine: config.engine,
        })
    }
}

pub fn pick_remote_url(
    flag: Option<String>,
    from_env: Option<String>,
    from_file: Option<String>,
) -> Option<String> {
    non_blank(flag)
        .or_else(|| non_blank(from_env))
        .or_else(|| non_blank(from_file))
}

/// Trimmed value, or `None` when missing or blank
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn has_http_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
