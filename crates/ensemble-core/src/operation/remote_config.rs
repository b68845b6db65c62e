use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use super::{OperationDeps, RunnerSettings};
use crate::EnsembleError;
use crate::error::OperationError;
use crate::keys;
use crate::kvs::DynKvStore;
use crate::registry::registered_nodes;
use crate::vars::{Vars, deep_merge, ensure_path, subst_array, subst_map};

const ROLE_MARKER: &str = "{{role}}";
const ALL_ROLES: &str = "all";

/// Configuration-management step: composes a parameter document from the
/// KVS, renders a node-json file plus a conf file, and hands both to the
/// external runner (`<command> -c <conf> -j <json>`).
pub struct RemoteConfigOperation {
    run_list: Vec<String>,
    attributes: Map<String, Value>,
    pattern: String,
    kvs: DynKvStore,
    settings: Arc<RunnerSettings>,
}

impl std::fmt::Debug for RemoteConfigOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfigOperation")
            .field("run_list", &self.run_list)
            .field("attributes", &self.attributes)
            .field("pattern", &self.pattern)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RemoteConfigPayload {
    #[serde(default)]
    run_list: Vec<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

impl RemoteConfigOperation {
    pub(super) fn decode(
        value: &serde_json::Value,
        deps: &OperationDeps,
    ) -> Result<Self, EnsembleError> {
        let payload: RemoteConfigPayload = serde_json::from_value(value.clone())?;
        Ok(Self {
            run_list: payload.run_list,
            attributes: payload.attributes,
            pattern: String::new(),
            kvs: deps.kvs.clone(),
            settings: deps.settings.clone(),
        })
    }

    pub fn set_pattern(&mut self, pattern: &str) {
        self.pattern = pattern.to_string();
    }

    pub async fn run(&self, vars: &Vars) -> anyhow::Result<()> {
        let run_list = subst_array(
            &expand_run_list(&self.run_list, &self.settings.roles),
            vars,
        );
        let attributes = subst_map(&self.attributes, vars);
        let node_json = self.compose_document(run_list, attributes).await?;

        let pattern_dir = self.settings.pattern_dir(&self.pattern);
        let json_file = write_temp_json(&node_json)?;
        let conf_file = write_temp_conf(&conf_entries(&pattern_dir, &self.pattern, vars))?;

        info!(
            pattern = %self.pattern,
            conf = %conf_file.path().display(),
            json = %json_file.path().display(),
            "invoking remote-config runner"
        );

        let output = Command::new(&self.settings.remote_config_command)
            .arg("-c")
            .arg(conf_file.path())
            .arg("-j")
            .arg(json_file.path())
            .current_dir(&pattern_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| {
                format!(
                    "failed to spawn remote-config runner {}",
                    self.settings.remote_config_command
                )
            })?;

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "remote-config runner output"
        );

        // Both temp files are unlinked when the handles drop here.
        if output.status.success() {
            Ok(())
        } else {
            Err(
                OperationError::new("remote-config", "runner exited with a failure status")
                    .with_exit_code(output.status.code())
                    .into(),
            )
        }
    }

    /// Build the node-json document: the stored parameters with this
    /// pattern's user attributes merged in and the current node
    /// registrations embedded under `servers`.
    async fn compose_document(
        &self,
        run_list: Vec<String>,
        overwrite: Map<String, Value>,
    ) -> anyhow::Result<Value> {
        let mut doc = match self.kvs.get(keys::PARAMETERS).await? {
            Some(entry) if !entry.value.is_empty() => serde_json::from_slice(&entry.value)
                .map_err(EnsembleError::Decode)
                .context("stored parameters are not a JSON document")?,
            _ => Value::Object(Map::new()),
        };

        let target = ensure_path(
            &mut doc,
            &[keys::ROOT, "patterns", &self.pattern, "user_attributes"],
        );
        deep_merge(target, Value::Object(overwrite));

        let mut servers = Map::new();
        for (node, registration) in registered_nodes(&*self.kvs).await? {
            servers.insert(node, serde_json::to_value(&registration)?);
        }
        *ensure_path(&mut doc, &[keys::ROOT, "servers"]) = Value::Object(servers);

        let mut node_json = Map::new();
        node_json.insert("run_list".to_string(), Value::from(run_list));
        node_json.insert(
            keys::ROOT.to_string(),
            doc.get(keys::ROOT).cloned().unwrap_or(Value::Object(Map::new())),
        );
        Ok(Value::Object(node_json))
    }
}

/// Expand entries containing the literal `{{role}}` marker: one entry for
/// the pseudo-role `all`, then one per declared role, preserving order.
fn expand_run_list(entries: &[String], roles: &[String]) -> Vec<String> {
    let mut expanded = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.contains(ROLE_MARKER) {
            expanded.push(entry.replace(ROLE_MARKER, ALL_ROLES));
            for role in roles {
                expanded.push(entry.replace(ROLE_MARKER, role));
            }
        } else {
            expanded.push(entry.clone());
        }
    }
    expanded
}

/// The fixed runner configuration keys with pattern-derived defaults.
/// A var whose name equals a conf key overrides its value.
fn conf_entries(pattern_dir: &Path, pattern: &str, vars: &Vars) -> Vec<(String, String)> {
    let quoted = |path: std::path::PathBuf| format!("'{}'", path.display());

    let defaults = [
        ("ssl_verify_mode", ":verify_peer".to_string()),
        (
            "role_path",
            format!("[{}]", quoted(pattern_dir.join("roles"))),
        ),
        ("log_level", ":info".to_string()),
        (
            "log_location",
            quoted(pattern_dir.join("logs").join(format!("{pattern}.log"))),
        ),
        (
            "file_cache_path",
            quoted(pattern_dir.join("tmp").join("cache")),
        ),
        (
            "cookbook_path",
            format!(
                "[{}, {}]",
                quoted(pattern_dir.join("cookbooks")),
                quoted(pattern_dir.join("site-cookbooks"))
            ),
        ),
    ];

    defaults
        .into_iter()
        .map(|(key, value)| {
            let value = vars.get(key).cloned().unwrap_or(value);
            (key.to_string(), value)
        })
        .collect()
}

fn write_temp_json(document: &Value) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("ensemble-node-")
        .suffix(".json")
        .tempfile()
        .context("failed to create node-json temp file")?;
    file.write_all(serde_json::to_vec(document)?.as_slice())
        .context("failed to write node-json temp file")?;
    Ok(file)
}

fn write_temp_conf(entries: &[(String, String)]) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("ensemble-conf-")
        .suffix(".rb")
        .tempfile()
        .context("failed to create conf temp file")?;
    for (key, value) in entries {
        writeln!(file, "{key} {value}").context("failed to write conf temp file")?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::kvs::{KvStore, MemoryKvs};
    use crate::registry::NodeRegistration;

    fn deps(kvs: Arc<MemoryKvs>, base: PathBuf, command: &str) -> OperationDeps {
        OperationDeps {
            kvs,
            settings: Arc::new(RunnerSettings {
                shell: "/bin/sh".to_string(),
                base_dir: base,
                remote_config_command: command.to_string(),
                roles: vec!["web".to_string(), "db".to_string()],
            }),
        }
    }

    #[test]
    fn role_marker_expands_to_all_then_declared_roles() {
        let expanded = expand_run_list(
            &["role::{{role}}".to_string(), "recipe::deploy".to_string()],
            &["web".to_string(), "db".to_string()],
        );
        assert_eq!(
            expanded,
            vec!["role::all", "role::web", "role::db", "recipe::deploy"]
        );
    }

    #[test]
    fn conf_entries_quote_paths_and_accept_var_overrides() {
        let dir = PathBuf::from("/opt/ensemble/patterns/blog");
        let vars = HashMap::from([("log_level".to_string(), ":debug".to_string())]);
        let entries = conf_entries(&dir, "blog", &vars);

        let lookup: HashMap<&str, &str> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        assert_eq!(lookup["ssl_verify_mode"], ":verify_peer");
        assert_eq!(lookup["log_level"], ":debug");
        assert_eq!(
            lookup["role_path"],
            "['/opt/ensemble/patterns/blog/roles']"
        );
        assert_eq!(
            lookup["log_location"],
            "'/opt/ensemble/patterns/blog/logs/blog.log'"
        );
        assert_eq!(
            lookup["cookbook_path"],
            "['/opt/ensemble/patterns/blog/cookbooks', '/opt/ensemble/patterns/blog/site-cookbooks']"
        );
        assert_eq!(entries[0].0, "ssl_verify_mode");
    }

    #[tokio::test]
    async fn document_merges_attributes_and_embeds_servers() {
        let kvs = Arc::new(MemoryKvs::new());
        kvs.put(
            keys::PARAMETERS,
            serde_json::to_vec(&json!({
                "ensemble": {
                    "patterns": {
                        "blog": {"user_attributes": {"kept": 1, "replaced": "old"}}
                    }
                }
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        NodeRegistration {
            roles: vec!["web".to_string()],
            private_ip: "10.0.0.5".to_string(),
        }
        .save(&*kvs, "web-01")
        .await
        .unwrap();

        let base = tempfile::tempdir().unwrap();
        let mut op = RemoteConfigOperation::decode(
            &json!({
                "type": "remote-config",
                "run_list": ["role::app"],
                "attributes": {"replaced": "new", "added": true},
            }),
            &deps(kvs, base.path().to_path_buf(), "true"),
        )
        .unwrap();
        op.set_pattern("blog");

        let document = op
            .compose_document(vec!["role::app".to_string()], op.attributes.clone())
            .await
            .unwrap();

        assert_eq!(document["run_list"], json!(["role::app"]));
        assert_eq!(
            document["ensemble"]["patterns"]["blog"]["user_attributes"],
            json!({"kept": 1, "replaced": "new", "added": true})
        );
        assert_eq!(
            document["ensemble"]["servers"]["web-01"],
            json!({"roles": ["web"], "private_ip": "10.0.0.5"})
        );
    }

    #[tokio::test]
    async fn runner_exit_status_decides_the_outcome() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("patterns/blog")).unwrap();

        let kvs = Arc::new(MemoryKvs::new());
        let mut ok = RemoteConfigOperation::decode(
            &json!({"type": "remote-config"}),
            &deps(kvs.clone(), base.path().to_path_buf(), "true"),
        )
        .unwrap();
        ok.set_pattern("blog");
        ok.run(&HashMap::new()).await.expect("runner exited zero");

        let mut failing = RemoteConfigOperation::decode(
            &json!({"type": "remote-config"}),
            &deps(kvs, base.path().to_path_buf(), "false"),
        )
        .unwrap();
        failing.set_pattern("blog");
        let err = failing.run(&HashMap::new()).await.unwrap_err();
        let op_err = err
            .downcast_ref::<OperationError>()
            .expect("error should carry operation detail");
        assert_eq!(op_err.exit_code, Some(1));
    }
}
