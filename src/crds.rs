/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/crds.rs
 *
 * Defines the `NodeFailover` custom resource (group `failover.k8s.io`,
 * version `v1`, plural `nodefailovers`) that backs every FailoverRecord.
 * The CRD is cluster-scoped: one record exists per on-premise node name,
 * and the record itself - not any in-memory cache - is the source of
 * truth for the failover state machine.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "failover.k8s.io",
    version = "v1",
    kind = "NodeFailover",
    plural = "nodefailovers",
    shortname = "nfo",
    status = "NodeFailoverStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"CloudVM", "type":"string", "jsonPath":".status.cloudVmName"}"#,
    printcolumn = r#"{"name":"Attempts", "type":"integer", "jsonPath":".status.vmCreationAttempts"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailoverSpec {
    pub onprem_node_name: String,
    #[serde(default)]
    pub target_node_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    #[default]
    Pending,
    Creating,
    Active,
    Recovering,
    Draining,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    VmCreated,
    NodeJoined,
    TaintApplied,
    OnPremRecovered,
    GameServersDrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailoverStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_vm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vm_creation_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl NodeFailoverStatus {
    /// Removes any existing condition of the same type and appends the new
    /// one, matching the upsert-by-type semantics the reference
    /// implementation's `set_condition` performs against the status dict.
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: Option<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.conditions.retain(|c| c.type_ != type_);
        self.conditions.push(Condition {
            type_,
            status,
            reason,
            message,
            last_transition_time: now,
        });
    }

    pub fn condition(&self, type_: &ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| &c.type_ == type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn set_condition_replaces_same_type_only() {
        let mut status = NodeFailoverStatus::default();
        status.set_condition(ConditionType::VmCreated, ConditionStatus::False, None, None, now());
        status.set_condition(ConditionType::NodeJoined, ConditionStatus::True, None, None, now());
        assert_eq!(status.conditions.len(), 2);

        status.set_condition(
            ConditionType::VmCreated,
            ConditionStatus::True,
            Some("Created".into()),
            None,
            now(),
        );
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(
            status.condition(&ConditionType::VmCreated).unwrap().status,
            ConditionStatus::True
        );
    }
}
