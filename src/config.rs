/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/config.rs
 *
 * Environment-driven configuration, loaded and validated once at startup.
 * Mirrors the fail-fast validation the reference implementation performs in
 * its `validate_environment` step, but as a typed constructor rather than a
 * free function that exits the process directly.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gcp_project_id: String,
    pub gcp_zone: String,
    pub gcp_machine_type: String,
    pub gcp_network: String,
    pub gcp_subnet: String,
    pub gcp_image_project: String,
    pub gcp_image_name: String,

    pub k8s_api_server: String,

    pub gcp_node_copy_labels: Vec<String>,

    pub node_flapping_grace: Duration,
    pub max_vm_creation_attempts: u32,
    pub reconciliation_interval: Duration,
    pub onprem_recovery_wait: Duration,
    pub gameserver_max_wait: Duration,

    pub stateful_workload_group: String,
    pub stateful_workload_version: String,
    pub stateful_workload_kind: String,
    pub stateful_workload_plural: String,

    pub alert_webhook_url: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            gcp_project_id: required("GCP_PROJECT_ID")?,
            gcp_zone: required("GCP_ZONE")?,
            gcp_machine_type: required("GCP_MACHINE_TYPE")?,
            gcp_network: required("GCP_NETWORK")?,
            gcp_subnet: required("GCP_SUBNET")?,
            gcp_image_project: required("GCP_IMAGE_PROJECT")?,
            gcp_image_name: required("GCP_IMAGE_NAME")?,

            k8s_api_server: required("K8S_API_SERVER")?,

            gcp_node_copy_labels: optional("GCP_NODE_COPY_LABELS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),

            node_flapping_grace: Duration::from_secs(optional_u64(
                "NODE_FLAPPING_GRACE_SECONDS",
                30,
            )?),
            max_vm_creation_attempts: optional_u32("MAX_VM_CREATION_ATTEMPTS", 3)?,
            reconciliation_interval: Duration::from_secs(optional_u64(
                "RECONCILIATION_INTERVAL_SECONDS",
                60,
            )?),
            onprem_recovery_wait: Duration::from_secs(
                optional_u64("ONPREM_RECOVERY_WAIT_MINUTES", 10)? * 60,
            ),
            gameserver_max_wait: Duration::from_secs(
                optional_u64("GAMESERVER_MAX_WAIT_HOURS", 3)? * 3600,
            ),

            stateful_workload_group: optional("STATEFUL_WORKLOAD_GROUP", "agones.dev"),
            stateful_workload_version: optional("STATEFUL_WORKLOAD_VERSION", "v1"),
            stateful_workload_kind: optional("STATEFUL_WORKLOAD_KIND", "GameServer"),
            stateful_workload_plural: optional("STATEFUL_WORKLOAD_PLURAL", "gameservers"),

            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok(),
            log_level: optional("LOG_LEVEL", "info"),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid { name, value: v }),
        Err(_) => Ok(default),
    }
}

fn optional_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid { name, value: v }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_falls_back_to_default() {
        assert_eq!(optional("NODE_FAILOVER_DOES_NOT_EXIST", "fallback"), "fallback");
    }

    #[test]
    fn optional_u64_rejects_non_numeric() {
        std::env::set_var("NODE_FAILOVER_TEST_BAD_NUM", "not-a-number");
        let err = optional_u64("NODE_FAILOVER_TEST_BAD_NUM", 5).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        std::env::remove_var("NODE_FAILOVER_TEST_BAD_NUM");
    }
}
