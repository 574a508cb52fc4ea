/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/store.rs
 *
 * CRUD over the `NodeFailover` custom resource. This is the single source
 * of truth for failover state - there is deliberately no in-memory cache
 * layered in front of it. Callers that need a snapshot re-list; the
 * reconciler re-derives everything it needs on every sweep rather than
 * trusting anything cached across ticks.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;

use chrono::Utc;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;

use crate::crds::{Condition, ConditionStatus, ConditionType, NodeFailover, NodeFailoverSpec, NodeFailoverStatus, Phase};

const FIELD_MANAGER: &str = "node-failover-operator";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Default)]
pub struct StatusPatch {
    pub phase: Option<Phase>,
    pub cloud_vm_name: Option<String>,
    pub recovery_detected_at: Option<chrono::DateTime<Utc>>,
    pub vm_creation_attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
}

pub struct FailoverRecordStore {
    api: Api<NodeFailover>,
}

impl FailoverRecordStore {
    pub fn new(client: Client) -> Self {
        FailoverRecordStore {
            api: Api::all(client),
        }
    }

    /// Idempotent: returns the existing record untouched if one already
    /// exists for this node.
    pub async fn create(
        &self,
        node_name: &str,
        target_labels: BTreeMap<String, String>,
    ) -> Result<NodeFailover, StoreError> {
        if let Some(existing) = self.get(node_name).await? {
            return Ok(existing);
        }

        let record = NodeFailover {
            metadata: ObjectMeta {
                name: Some(node_name.to_string()),
                ..Default::default()
            },
            spec: NodeFailoverSpec {
                onprem_node_name: node_name.to_string(),
                target_node_labels: target_labels,
            },
            status: Some(NodeFailoverStatus {
                phase: Phase::Pending,
                failed_at: Some(Utc::now()),
                ..Default::default()
            }),
        };

        match self.api.create(&PostParams::default(), &record).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Ok(self.get(node_name).await?.expect("just raced on creation"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, node_name: &str) -> Result<Option<NodeFailover>, StoreError> {
        Ok(self.api.get_opt(node_name).await?)
    }

    pub async fn list(&self) -> Result<Vec<NodeFailover>, StoreError> {
        Ok(self.api.list(&Default::default()).await?.items)
    }

    pub async fn delete(&self, node_name: &str) -> Result<(), StoreError> {
        match self.api.delete(node_name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sparse-patches the status subresource. Only fields set to `Some`
    /// in `patch` are touched.
    pub async fn update_status(
        &self,
        node_name: &str,
        patch: StatusPatch,
    ) -> Result<(), StoreError> {
        let mut body = serde_json::Map::new();
        if let Some(phase) = &patch.phase {
            body.insert("phase".into(), serde_json::to_value(phase).unwrap());
        }
        if let Some(vm) = &patch.cloud_vm_name {
            body.insert("cloudVmName".into(), json!(vm));
        }
        if let Some(t) = &patch.recovery_detected_at {
            body.insert("recoveryDetectedAt".into(), json!(t));
        }
        if let Some(a) = &patch.vm_creation_attempts {
            body.insert("vmCreationAttempts".into(), json!(a));
        }
        if let Some(err) = &patch.last_error {
            body.insert("lastError".into(), json!(err));
        }

        let status_patch = json!({ "status": body });
        self.api
            .patch_status(
                node_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    /// Read-modify-write a single condition into the status, matching the
    /// remove-then-append upsert-by-type semantics `NodeFailoverStatus::set_condition`
    /// implements.
    pub async fn set_condition(
        &self,
        node_name: &str,
        type_: ConditionType,
        status: ConditionStatus,
        reason: Option<String>,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let record = match self.get(node_name).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let mut current_status = record.status.unwrap_or_default();
        current_status.set_condition(type_, status, reason, message, Utc::now());

        let patch = json!({ "status": { "conditions": current_status.conditions } });
        self.api
            .patch_status(
                node_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    pub async fn get_condition(
        &self,
        node_name: &str,
        type_: &ConditionType,
    ) -> Result<Option<Condition>, StoreError> {
        Ok(self
            .get(node_name)
            .await?
            .and_then(|r| r.status)
            .and_then(|s| s.condition(type_).cloned()))
    }
}
