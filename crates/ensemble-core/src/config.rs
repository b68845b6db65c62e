use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::EnsembleError;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "ENSEMBLE_CONFIG";

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub kvs: KvsConfig,
    pub node: NodeConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub remote_config: RemoteConfigSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Roles declared for this node, split from the comma-separated config value.
    pub fn roles(&self) -> Vec<String> {
        self.node
            .roles
            .split(',')
            .map(|role| role.trim().to_string())
            .filter(|role| !role.is_empty())
            .collect()
    }
}

/// Helper to load configuration with guard rails applied at load time.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `ENSEMBLE_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, EnsembleError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| EnsembleError::config_io(candidate.clone(), err))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|err| EnsembleError::InvalidConfiguration(err.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), EnsembleError> {
        if config.kvs.url.trim().is_empty() {
            return Err(EnsembleError::InvalidConfiguration(
                "kvs.url must point at a key/value store agent".into(),
            ));
        }
        if config.roles().is_empty() {
            return Err(EnsembleError::InvalidConfiguration(
                "node.roles must declare at least one role".into(),
            ));
        }
        if config.runtime.base_dir.as_os_str().is_empty() {
            return Err(EnsembleError::InvalidConfiguration(
                "runtime.base_dir must be set".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvsConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Defaults to the OS hostname when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Comma-separated role labels, e.g. `"web,db"`.
    pub roles: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "RuntimeConfig::default_shell")]
    pub shell: String,
    pub base_dir: PathBuf,
    #[serde(default = "RuntimeConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl RuntimeConfig {
    fn default_shell() -> String {
        "/bin/sh".to_string()
    }

    const fn default_poll_interval_ms() -> u64 {
        1_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfigSettings {
    #[serde(default = "RemoteConfigSettings::default_command")]
    pub command: String,
}

impl RemoteConfigSettings {
    fn default_command() -> String {
        "chef-solo".to_string()
    }
}

impl Default for RemoteConfigSettings {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config, EnsembleError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| EnsembleError::InvalidConfiguration(err.to_string()))?;
        ConfigLoader::validate(&config)?;
        Ok(config)
    }

    #[test]
    fn roles_are_split_and_trimmed() {
        let config = parse(
            r#"
            [kvs]
            url = "http://127.0.0.1:8500"

            [node]
            roles = "web, db ,"

            [runtime]
            base_dir = "/opt/ensemble"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.roles(), vec!["web", "db"]);
        assert_eq!(config.runtime.shell, "/bin/sh");
        assert_eq!(config.runtime.poll_interval_ms, 1_000);
        assert_eq!(config.remote_config.command, "chef-solo");
    }

    #[test]
    fn empty_roles_are_rejected() {
        let err = parse(
            r#"
            [kvs]
            url = "http://127.0.0.1:8500"

            [node]
            roles = " , "

            [runtime]
            base_dir = "/opt/ensemble"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, EnsembleError::InvalidConfiguration(_)));
    }
}
