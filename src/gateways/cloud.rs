/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/gateways/cloud.rs
 *
 * Talks to the cloud compute API to create, delete, and list the
 * temporary VMs that substitute for failed on-premise nodes. This
 * deliberately does not abstract over multiple cloud providers - the
 * operator targets one substrate, configured by the GCP_* variables - but
 * the REST calls are issued through `reqwest` rather than shelling out to
 * a vendor CLI, so operation polling and error handling stay in our own
 * control flow.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;

const MANAGED_BY_LABEL: &str = "managed-by";
const MANAGED_BY_VALUE: &str = "node-failover-operator";
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("operation {0} failed: {1}")]
    OperationFailed(String, String),

    #[error("operation {0} did not complete within the timeout")]
    OperationTimeout(String),
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

pub struct CloudGateway {
    http: HttpClient,
    base_url: String,
    project: String,
    zone: String,
    machine_type: String,
    network: String,
    subnet: String,
    image_project: String,
    image_name: String,
}

impl CloudGateway {
    pub fn new(config: &Config) -> Self {
        CloudGateway {
            http: HttpClient::new(),
            base_url: "https://compute.googleapis.com/compute/v1".to_string(),
            project: config.gcp_project_id.clone(),
            zone: config.gcp_zone.clone(),
            machine_type: config.gcp_machine_type.clone(),
            network: config.gcp_network.clone(),
            subnet: config.gcp_subnet.clone(),
            image_project: config.gcp_image_project.clone(),
            image_name: config.gcp_image_name.clone(),
        }
    }

    fn instances_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances",
            self.base_url, self.project, self.zone
        )
    }

    /// Creates a VM with a 40 GiB SSD boot disk, the startup script
    /// attached as instance metadata, nested virtualization enabled (the
    /// workload runtime requires it), and the system `managed-by` label
    /// merged with any caller-supplied labels. Blocks until the creation
    /// operation reaches a terminal state.
    pub async fn create_instance(
        &self,
        name: &str,
        startup_script: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool, CloudError> {
        let mut all_labels = labels.clone();
        all_labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let machine_type_url = format!(
            "zones/{}/machineTypes/{}",
            self.zone, self.machine_type
        );
        let source_image = format!(
            "projects/{}/global/images/family/{}",
            self.image_project, self.image_name
        );

        let body = json!({
            "name": name,
            "machineType": machine_type_url,
            "labels": all_labels,
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": source_image,
                    "diskSizeGb": "40",
                    "diskType": format!("zones/{}/diskTypes/pd-ssd", self.zone),
                }
            }],
            "networkInterfaces": [{
                "network": self.network,
                "subnetwork": self.subnet,
            }],
            "metadata": {
                "items": [{
                    "key": "startup-script",
                    "value": startup_script,
                }]
            },
            "advancedMachineFeatures": {
                "enableNestedVirtualization": true
            },
        });

        let resp = self
            .http
            .post(self.instances_url())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let op: Operation = resp.json().await?;
        self.await_operation(&op.name, OPERATION_TIMEOUT).await?;
        info!(vm = %name, "cloud instance created");
        Ok(true)
    }

    pub async fn delete_instance(&self, name: &str) -> Result<bool, CloudError> {
        let url = format!("{}/{}", self.instances_url(), name);
        let resp = self.http.delete(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(true);
        }
        let resp = resp.error_for_status()?;
        let op: Operation = resp.json().await?;
        self.await_operation(&op.name, OPERATION_TIMEOUT).await?;
        Ok(true)
    }

    pub async fn instance_exists(&self, name: &str) -> Result<bool, CloudError> {
        Ok(self.get_instance_status(name).await?.is_some())
    }

    pub async fn get_instance_status(&self, name: &str) -> Result<Option<String>, CloudError> {
        let url = format!("{}/{}", self.instances_url(), name);
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let instance: Instance = resp.error_for_status()?.json().await?;
        Ok(Some(instance.status))
    }

    /// Lists VMs carrying the `managed-by: node-failover-operator` system
    /// label, used by the reconciler to find VMs that were created but
    /// whose record was lost (e.g. across an operator restart).
    pub async fn list_managed_instances(&self) -> Result<Vec<String>, CloudError> {
        let resp = self
            .http
            .get(self.instances_url())
            .query(&[(
                "filter",
                format!("labels.{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"),
            )])
            .send()
            .await?
            .error_for_status()?;
        let list: InstanceList = resp.json().await?;
        Ok(list.items.into_iter().map(|i| i.name).collect())
    }

    async fn await_operation(&self, op_name: &str, timeout: Duration) -> Result<(), CloudError> {
        let url = format!(
            "{}/projects/{}/zones/{}/operations/{}",
            self.base_url, self.project, self.zone, op_name
        );
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let op: Operation = self
                .http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if op.status == "DONE" {
                if let Some(err) = op.error {
                    let message = err
                        .errors
                        .into_iter()
                        .map(|e| e.message)
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(CloudError::OperationFailed(op_name.to_string(), message));
                }
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(operation = %op_name, "cloud operation did not complete in time");
                return Err(CloudError::OperationTimeout(op_name.to_string()));
            }
            sleep(OPERATION_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_type_url_shape() {
        let gw_base = "zones/us-central1-a/machineTypes/n2-standard-4".to_string();
        assert!(gw_base.starts_with("zones/"));
    }
}
