use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{OperationDeps, RunnerSettings};
use crate::EnsembleError;
use crate::error::OperationError;
use crate::vars::{Vars, subst};

/// Shell step: feeds either a script file path or an inline script to the
/// configured shell over stdin, with the pattern directory as cwd.
#[derive(Debug)]
pub struct ExecuteOperation {
    file: String,
    script: String,
    pattern: String,
    settings: Arc<RunnerSettings>,
}

#[derive(Debug, Deserialize)]
struct ExecutePayload {
    #[serde(default)]
    file: String,
    #[serde(default)]
    script: String,
}

impl ExecuteOperation {
    pub(super) fn decode(
        value: &serde_json::Value,
        deps: &OperationDeps,
    ) -> Result<Self, EnsembleError> {
        let payload: ExecutePayload = serde_json::from_value(value.clone())?;
        Ok(Self {
            file: payload.file,
            script: payload.script,
            pattern: String::new(),
            settings: deps.settings.clone(),
        })
    }

    pub fn set_pattern(&mut self, pattern: &str) {
        self.pattern = pattern.to_string();
    }

    pub async fn run(&self, vars: &Vars) -> anyhow::Result<()> {
        let input = if self.file.is_empty() {
            subst(&self.script, vars)
        } else {
            subst(&self.file, vars)
        };

        let mut child = Command::new(&self.settings.shell)
            .current_dir(self.settings.pattern_dir(&self.pattern))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn shell {}", self.settings.shell))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .context("failed to feed shell stdin")?;
            // Closing stdin lets the shell see end-of-script.
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for shell")?;

        debug!(
            pattern = %self.pattern,
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "shell execution output"
        );

        if output.status.success() {
            Ok(())
        } else {
            Err(OperationError::new("execute", "shell exited with a failure status")
                .with_exit_code(output.status.code())
                .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::kvs::MemoryKvs;

    fn deps_with_base(base: PathBuf) -> OperationDeps {
        OperationDeps {
            kvs: Arc::new(MemoryKvs::new()),
            settings: Arc::new(RunnerSettings {
                shell: "/bin/sh".to_string(),
                base_dir: base,
                remote_config_command: "chef-solo".to_string(),
                roles: vec!["web".to_string()],
            }),
        }
    }

    fn pattern_fixture(root: &std::path::Path, pattern: &str) {
        std::fs::create_dir_all(root.join("patterns").join(pattern)).unwrap();
    }

    #[tokio::test]
    async fn script_runs_with_substituted_vars() {
        let base = tempfile::tempdir().unwrap();
        pattern_fixture(base.path(), "blog");
        let deps = deps_with_base(base.path().to_path_buf());

        let mut op = ExecuteOperation::decode(
            &json!({"type": "execute", "script": "test \"{{node}}\" = web-01"}),
            &deps,
        )
        .unwrap();
        op.set_pattern("blog");

        let vars = HashMap::from([("node".to_string(), "web-01".to_string())]);
        op.run(&vars).await.expect("script should succeed");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_the_status() {
        let base = tempfile::tempdir().unwrap();
        pattern_fixture(base.path(), "blog");
        let deps = deps_with_base(base.path().to_path_buf());

        let mut op =
            ExecuteOperation::decode(&json!({"type": "execute", "script": "exit 3"}), &deps)
                .unwrap();
        op.set_pattern("blog");

        let err = op.run(&HashMap::new()).await.unwrap_err();
        let op_err = err
            .downcast_ref::<OperationError>()
            .expect("error should carry operation detail");
        assert_eq!(op_err.exit_code, Some(3));
    }

    #[tokio::test]
    async fn file_field_takes_precedence_over_script() {
        let base = tempfile::tempdir().unwrap();
        pattern_fixture(base.path(), "blog");
        let script_path = base.path().join("patterns/blog/check.sh");
        std::fs::write(&script_path, "#!/bin/sh\nexit 0\n").unwrap();
        let deps = deps_with_base(base.path().to_path_buf());

        // The file field names a script on disk; the shell receives the path
        // on stdin and runs it as a command line.
        let mut op = ExecuteOperation::decode(
            &json!({
                "type": "execute",
                "file": format!("sh {}", script_path.display()),
                "script": "exit 9",
            }),
            &deps,
        )
        .unwrap();
        op.set_pattern("blog");

        op.run(&HashMap::new()).await.expect("file should win");
    }
}
