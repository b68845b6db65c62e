mod execute;
mod remote_config;

pub use execute::ExecuteOperation;
pub use remote_config::RemoteConfigOperation;

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::Error as _;

use crate::EnsembleError;
use crate::config::Config;
use crate::kvs::DynKvStore;
use crate::vars::Vars;

/// Runtime facts operations need beyond their manifest payload.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub shell: String,
    pub base_dir: PathBuf,
    pub remote_config_command: String,
    pub roles: Vec<String>,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: config.runtime.shell.clone(),
            base_dir: config.runtime.base_dir.clone(),
            remote_config_command: config.remote_config.command.clone(),
            roles: config.roles(),
        }
    }

    /// Directory a pattern's assets (and manifest) live in.
    pub fn pattern_dir(&self, pattern: &str) -> PathBuf {
        self.base_dir.join("patterns").join(pattern)
    }
}

/// Handles threaded into operations at decode time, instead of the
/// process-wide client a naive port would reach for.
#[derive(Clone)]
pub struct OperationDeps {
    pub kvs: DynKvStore,
    pub settings: Arc<RunnerSettings>,
}

/// One executable step of a task.
///
/// Decoded from a manifest's JSON array via the `type` discriminator; new
/// kinds are added by extending this sum and the match in [`Operation::decode`].
#[derive(Debug)]
pub enum Operation {
    Execute(ExecuteOperation),
    RemoteConfig(RemoteConfigOperation),
}

impl Operation {
    /// Stable name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Execute(_) => "execute",
            Operation::RemoteConfig(_) => "remote-config",
        }
    }

    pub fn set_pattern(&mut self, pattern: &str) {
        match self {
            Operation::Execute(op) => op.set_pattern(pattern),
            Operation::RemoteConfig(op) => op.set_pattern(pattern),
        }
    }

    pub async fn run(&self, vars: &Vars) -> anyhow::Result<()> {
        match self {
            Operation::Execute(op) => op.run(vars).await,
            Operation::RemoteConfig(op) => op.run(vars).await,
        }
    }

    /// Decode a single operation object, selecting the variant by `type`.
    pub fn decode(
        value: &serde_json::Value,
        deps: &OperationDeps,
    ) -> Result<Operation, EnsembleError> {
        let kind = value
            .get("type")
            .and_then(|field| field.as_str())
            .ok_or_else(|| {
                EnsembleError::Decode(serde_json::Error::custom(
                    "operation is missing its `type` discriminator",
                ))
            })?;

        match kind {
            "execute" => Ok(Operation::Execute(ExecuteOperation::decode(value, deps)?)),
            "remote-config" => Ok(Operation::RemoteConfig(RemoteConfigOperation::decode(
                value, deps,
            )?)),
            other => Err(EnsembleError::Decode(serde_json::Error::custom(format!(
                "unknown operation type '{other}'"
            )))),
        }
    }

    /// Decode a manifest's ordered operation array.
    pub fn decode_all(
        values: &[serde_json::Value],
        deps: &OperationDeps,
    ) -> Result<Vec<Operation>, EnsembleError> {
        values.iter().map(|value| Self::decode(value, deps)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::kvs::MemoryKvs;

    fn deps() -> OperationDeps {
        OperationDeps {
            kvs: Arc::new(MemoryKvs::new()),
            settings: Arc::new(RunnerSettings {
                shell: "/bin/sh".to_string(),
                base_dir: PathBuf::from("/opt/ensemble"),
                remote_config_command: "chef-solo".to_string(),
                roles: vec!["web".to_string()],
            }),
        }
    }

    #[test]
    fn discriminator_selects_the_variant() {
        let decoded = Operation::decode_all(
            &[
                json!({"type": "execute", "script": "echo ok"}),
                json!({"type": "remote-config", "run_list": ["role::{{role}}"]}),
            ],
            &deps(),
        )
        .unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].name(), "execute");
        assert_eq!(decoded[1].name(), "remote-config");
    }

    #[test]
    fn unknown_discriminator_is_a_decode_error() {
        let err = Operation::decode(&json!({"type": "teleport"}), &deps()).unwrap_err();
        assert!(matches!(err, EnsembleError::Decode(_)));
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn missing_discriminator_is_a_decode_error() {
        let err = Operation::decode(&json!({"script": "echo ok"}), &deps()).unwrap_err();
        assert!(matches!(err, EnsembleError::Decode(_)));
    }
}
