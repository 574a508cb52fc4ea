/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/event_router.rs
 *
 * The single subscription to on-premise node readiness transitions. There
 * is exactly one watch stream here - no duplicated subscriptions for the
 * same event kind - and every branch is written to be a no-op on replay,
 * so redelivery of the same event never produces extra state changes.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::controller::ControllerContext;
use crate::crds::{ConditionStatus, ConditionType, Phase};
use crate::gateways::cluster::{readiness_from_node, Readiness};
use crate::gateways::is_custom_label;
use crate::store::StatusPatch;

const ONPREM_LABEL_SELECTOR: &str = "node-type=onpremise";

pub async fn run(ctx: Arc<ControllerContext>) {
    let nodes: kube::Api<Node> = kube::Api::all(ctx.cluster.client().clone());
    let config = watcher::Config::default().labels(ONPREM_LABEL_SELECTOR);
    let mut stream = watcher::watcher(nodes, config).boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                if let Err(e) = handle_node_event(&ctx, &node).await {
                    warn!(error = %e, "event router failed to process node event");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "node watch stream error"),
        }
    }
}

async fn handle_node_event(
    ctx: &ControllerContext,
    node: &Node,
) -> Result<(), crate::error::Error> {
    let node_name = node.name_any();
    let readiness = readiness_from_node(node);
    let existing = ctx.store.get(&node_name).await?;

    match (readiness, existing) {
        (Readiness::NotReady, None) => {
            start_new_cycle(ctx, node, &node_name).await?;
        }
        (Readiness::NotReady, Some(record)) => {
            let phase = record.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default();
            if phase == Phase::Completed {
                ctx.store.delete(&node_name).await?;
                start_new_cycle(ctx, node, &node_name).await?;
            }
            // Any other phase: the controller already owns this cycle.
        }
        (Readiness::Ready, Some(record)) => {
            let phase = record.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default();
            if !matches!(phase, Phase::Recovering | Phase::Draining | Phase::Completed) {
                ctx.store
                    .update_status(
                        &node_name,
                        StatusPatch {
                            phase: Some(Phase::Recovering),
                            recovery_detected_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                ctx.store
                    .set_condition(&node_name, ConditionType::OnPremRecovered, ConditionStatus::True, None, None)
                    .await?;
                info!(node = %node_name, "ready event observed, phase -> Recovering");
            }
        }
        (Readiness::Ready, None) | (Readiness::Unknown, _) => {}
    }

    Ok(())
}

async fn start_new_cycle(
    ctx: &ControllerContext,
    node: &Node,
    node_name: &str,
) -> Result<(), crate::error::Error> {
    let custom_labels: BTreeMap<String, String> = node
        .labels()
        .iter()
        .filter(|(k, _)| is_custom_label(k))
        .filter(|(k, _)| ctx.config.gcp_node_copy_labels.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    ctx.store.create(node_name, custom_labels).await?;
    info!(node = node_name, "unready on-premise node observed, opened failover record");
    Ok(())
}
