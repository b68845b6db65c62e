//! Node identity: every agent publishes its roles and address under
//! `servers/<name>` at startup so task filters and remote-config runs can
//! see the whole cluster.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::EnsembleError;
use crate::keys;
use crate::kvs::KvStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub roles: Vec<String>,
    pub private_ip: String,
}

impl NodeRegistration {
    pub async fn save(&self, kvs: &dyn KvStore, node: &str) -> Result<(), EnsembleError> {
        kvs.put(&keys::server(node), serde_json::to_vec(self)?).await
    }

    pub async fn load(kvs: &dyn KvStore, node: &str) -> Result<Option<Self>, EnsembleError> {
        match kvs.get(&keys::server(node)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }
}

/// Publish this node's registration, merging into any existing entry so
/// fields written by other tooling survive.
///
/// The advertised address comes from the store's catalog; a node absent
/// from the catalog cannot participate and registration fails.
pub async fn register_node(
    kvs: &dyn KvStore,
    node: &str,
    roles: &[String],
) -> Result<NodeRegistration, EnsembleError> {
    let address = resolve_address(kvs, node).await?;

    let mut entry: Map<String, Value> = match kvs.get(&keys::server(node)).await? {
        Some(existing) if !existing.value.is_empty() => serde_json::from_slice(&existing.value)?,
        _ => Map::new(),
    };
    entry.insert("roles".to_string(), Value::from(roles.to_vec()));
    entry.insert("private_ip".to_string(), Value::from(address.clone()));
    kvs.put(&keys::server(node), serde_json::to_vec(&entry)?)
        .await?;

    info!(node, address = %address, roles = ?roles, "registered node");
    Ok(NodeRegistration {
        roles: roles.to_vec(),
        private_ip: address,
    })
}

/// Every registration currently published under `servers/`, keyed by node name.
pub async fn registered_nodes(
    kvs: &dyn KvStore,
) -> Result<Vec<(String, NodeRegistration)>, EnsembleError> {
    let mut nodes = Vec::new();
    for entry in kvs.list(keys::SERVERS_PREFIX).await? {
        let name = entry
            .key
            .strip_prefix(keys::SERVERS_PREFIX)
            .unwrap_or(&entry.key)
            .to_string();
        nodes.push((name, serde_json::from_slice(&entry.value)?));
    }
    Ok(nodes)
}

async fn resolve_address(kvs: &dyn KvStore, node: &str) -> Result<String, EnsembleError> {
    let nodes = kvs.catalog_nodes().await?;
    nodes
        .into_iter()
        .find(|candidate| candidate.name == node)
        .map(|candidate| candidate.address)
        .ok_or_else(|| EnsembleError::NodeNotRegistered(node.to_string()))
}
