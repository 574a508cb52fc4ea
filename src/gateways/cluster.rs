/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/gateways/cluster.rs
 *
 * Everything the failover controller needs from the Kubernetes cluster:
 * node readiness, label/taint manipulation, cordoning, node deletion, and
 * counting how many stateful workload instances are still pinned to a
 * node before it can be torn down. The stateful workload kind is not
 * hardcoded to any specific CRD - it is read from configuration and
 * accessed through `kube::core::DynamicObject`, so swapping it requires no
 * code change.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Config;
use crate::gateways::bootstrap::{self, BootstrapError};
use crate::gateways::is_custom_label;

const FIELD_MANAGER: &str = "node-failover-operator";
const OUT_OF_SERVICE_TAINT_KEY: &str = "node.kubernetes.io/out-of-service";
const DRAIN_TAINT_KEY: &str = "temporary-node";

/// Sentinel returned by `count_allocated_stateful_instances` when the
/// listing call itself failed. A high count keeps the drain loop waiting
/// rather than risk deleting a node that may still be serving sessions.
pub const STATEFUL_COUNT_ERROR_SENTINEL: u64 = 999;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    Unknown,
}

pub struct ClusterGateway {
    client: Client,
    nodes: Api<Node>,
    stateful_workload_resource: ApiResource,
}

impl ClusterGateway {
    pub fn new(client: Client, config: &Config) -> Self {
        let gvk = GroupVersionKind::gvk(
            &config.stateful_workload_group,
            &config.stateful_workload_version,
            &config.stateful_workload_kind,
        );
        let stateful_workload_resource =
            ApiResource::from_gvk_with_plural(&gvk, &config.stateful_workload_plural);

        ClusterGateway {
            nodes: Api::all(client.clone()),
            stateful_workload_resource,
            client,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn is_node_ready(&self, name: &str) -> Result<Readiness, ClusterError> {
        let node = match self.nodes.get_opt(name).await? {
            Some(n) => n,
            None => return Ok(Readiness::Unknown),
        };
        Ok(readiness_from_node(&node))
    }

    pub async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError> {
        Ok(self.nodes.get_opt(name).await?)
    }

    pub async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, ClusterError> {
        let lp = kube::api::ListParams::default().labels(label_selector);
        Ok(self.nodes.list(&lp).await?.items)
    }

    pub async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let patch = json!({
            "metadata": {
                "labels": labels,
            }
        });
        self.nodes
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    pub async fn get_node_custom_labels(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        let node = match self.get_node(name).await? {
            Some(n) => n,
            None => return Ok(BTreeMap::new()),
        };
        Ok(node
            .labels()
            .iter()
            .filter(|(k, _)| is_custom_label(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub async fn add_node_taint(
        &self,
        name: &str,
        key: &str,
        value: &str,
        effect: &str,
    ) -> Result<(), ClusterError> {
        let node = match self.get_node(name).await? {
            Some(n) => n,
            None => return Ok(()),
        };
        let taints = node.spec.as_ref().and_then(|s| s.taints.clone()).unwrap_or_default();
        if taints.iter().any(|t| t.key == key) {
            return Ok(());
        }
        let mut new_taints = taints;
        new_taints.push(k8s_openapi::api::core::v1::Taint {
            key: key.to_string(),
            value: Some(value.to_string()),
            effect: effect.to_string(),
            time_added: None,
        });
        let patch = json!({ "spec": { "taints": new_taints } });
        self.nodes
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    pub async fn remove_node_taint(&self, name: &str, key: &str) -> Result<(), ClusterError> {
        let node = match self.get_node(name).await? {
            Some(n) => n,
            None => return Ok(()),
        };
        let taints = node.spec.as_ref().and_then(|s| s.taints.clone()).unwrap_or_default();
        if !taints.iter().any(|t| t.key == key) {
            return Ok(());
        }
        let remaining: Vec<_> = taints.into_iter().filter(|t| t.key != key).collect();
        let patch = json!({ "spec": { "taints": remaining } });
        self.nodes
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Applies the standardized out-of-service marker, which causes the
    /// platform to force-terminate pods still bound to this node.
    pub async fn apply_out_of_service_taint(&self, name: &str) -> Result<(), ClusterError> {
        self.add_node_taint(name, OUT_OF_SERVICE_TAINT_KEY, "nodeshutdown", "NoExecute")
            .await
    }

    pub async fn remove_out_of_service_taint(&self, name: &str) -> Result<(), ClusterError> {
        self.remove_node_taint(name, OUT_OF_SERVICE_TAINT_KEY).await
    }

    pub async fn apply_drain_taint(&self, name: &str) -> Result<(), ClusterError> {
        self.add_node_taint(name, DRAIN_TAINT_KEY, "draining", "NoSchedule").await
    }

    pub async fn cordon_node(&self, name: &str) -> Result<(), ClusterError> {
        let patch = json!({ "spec": { "unschedulable": true } });
        match self
            .nodes
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        match self.nodes.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn wait_for_node_join(&self, name: &str, timeout: Duration) -> Result<bool, ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get_node(name).await?.is_some() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_secs(10)).await;
        }
    }

    pub async fn get_ca_cert_hash(&self) -> Result<Option<String>, ClusterError> {
        Ok(bootstrap::get_ca_cert_hash(&self.client).await?)
    }

    pub async fn create_bootstrap_token(
        &self,
        ttl: chrono::Duration,
    ) -> Result<String, ClusterError> {
        Ok(bootstrap::create_bootstrap_token(&self.client, ttl).await?)
    }

    pub async fn delete_bootstrap_token(&self, token_id: &str) -> Result<(), ClusterError> {
        Ok(bootstrap::delete_bootstrap_token(&self.client, token_id).await?)
    }

    /// Counts stateful workload instances pinned to `node_name` whose
    /// status reports them as allocated. The workload kind is whatever
    /// `STATEFUL_WORKLOAD_*` configuration names - the operator never
    /// hardcodes a particular CRD here.
    pub async fn count_allocated_stateful_instances(&self, node_name: &str) -> u64 {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &self.stateful_workload_resource);
        let items = match api.list(&Default::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!(error = %e, "failed to list stateful workload instances, assuming worst case");
                return STATEFUL_COUNT_ERROR_SENTINEL;
            }
        };

        items
            .iter()
            .filter(|obj| pinned_to_node(obj, node_name) && is_allocated(obj))
            .count() as u64
    }
}

pub fn readiness_from_node(node: &Node) -> Readiness {
    let conditions = match node.status.as_ref().and_then(|s| s.conditions.clone()) {
        Some(c) => c,
        None => return Readiness::Unknown,
    };
    match conditions.iter().find(|c| c.type_ == "Ready") {
        Some(c) if c.status == "True" => Readiness::Ready,
        Some(c) if c.status == "False" => Readiness::NotReady,
        _ => Readiness::Unknown,
    }
}

fn pinned_to_node(obj: &DynamicObject, node_name: &str) -> bool {
    obj.data
        .get("status")
        .and_then(|s| s.get("nodeName"))
        .and_then(|v| v.as_str())
        .map(|n| n == node_name)
        .unwrap_or(false)
}

fn is_allocated(obj: &DynamicObject) -> bool {
    obj.data
        .get("status")
        .and_then(|s| s.get("state"))
        .and_then(|v| v.as_str())
        .map(|s| s.eq_ignore_ascii_case("Allocated"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    fn dyn_obj(node_name: &str, state: &str) -> DynamicObject {
        let mut obj = DynamicObject::new("demo", &ApiResource {
            group: "agones.dev".into(),
            version: "v1".into(),
            kind: "GameServer".into(),
            api_version: "agones.dev/v1".into(),
            plural: "gameservers".into(),
        });
        obj.data = j!({ "status": { "nodeName": node_name, "state": state } });
        obj
    }

    #[test]
    fn pinned_and_allocated_filters() {
        let obj = dyn_obj("node-a", "Allocated");
        assert!(pinned_to_node(&obj, "node-a"));
        assert!(is_allocated(&obj));

        let obj = dyn_obj("node-b", "Ready");
        assert!(!pinned_to_node(&obj, "node-a"));
        assert!(!is_allocated(&obj));
    }
}
