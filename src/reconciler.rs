/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/reconciler.rs
 *
 * The periodic sweep: a startup pass that rebuilds missing state purely
 * from the cluster and the cloud (never from an in-memory cache, since
 * none is kept), plus a fixed-interval pass that drives Draining records
 * toward Completed. Distinct from the event-driven router in
 * `event_router.rs` - this task never reacts to a single event, only to
 * the ticking clock.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::controller::ControllerContext;
use crate::crds::{ConditionStatus, ConditionType, NodeFailover, Phase};
use crate::error::Error;
use crate::gateways::cluster::{Readiness, STATEFUL_COUNT_ERROR_SENTINEL};
use crate::store::StatusPatch;

pub async fn run(ctx: Arc<ControllerContext>) {
    if let Err(e) = startup_pass(&ctx).await {
        error!(error = %e, "startup reconciliation pass failed");
    }

    let mut ticker = tokio::time::interval(ctx.config.reconciliation_interval);
    loop {
        ticker.tick().await;
        if let Err(e) = periodic_pass(&ctx).await {
            error!(error = %e, "periodic reconciliation pass failed");
        }
    }
}

/// Rebuilds FailoverRecord state for every on-premise node from scratch:
/// the record store, the live node list, and the cloud instance list are
/// the only inputs. Running this twice in a row against the same cluster
/// state must yield the same record set.
async fn startup_pass(ctx: &ControllerContext) -> Result<(), Error> {
    let onprem_nodes = ctx.cluster.list_nodes("node-type=onpremise").await?;
    let managed_instances = ctx.cloud.list_managed_instances().await?;

    for node in onprem_nodes {
        let node_name = match node.metadata.name.clone() {
            Some(n) => n,
            None => continue,
        };
        let readiness = crate::gateways::cluster::readiness_from_node(&node);
        if readiness != Readiness::NotReady {
            if let Some(record) = ctx.store.get(&node_name).await? {
                let phase = record.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default();
                if phase == Phase::Active {
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
                }
            }
            continue;
        }

        if let Some(record) = ctx.store.get(&node_name).await? {
            if let Some(status) = &record.status {
                if status.phase == Phase::Active {
                    if let Some(vm_name) = &status.cloud_vm_name {
                        reapply_substitute_labels(ctx, &record, vm_name).await?;
                    }
                }
            }
            continue;
        }

        let prefix = crate::controller::naming::vm_name_prefix(&node_name);
        let matching_vm = managed_instances.iter().find(|i| i.starts_with(&prefix)).cloned();

        match matching_vm {
            Some(vm_name) => {
                warn!(node = %node_name, vm = %vm_name, "rebuilding in-flight failover record from cluster/cloud state");
                ctx.store.create(&node_name, Default::default()).await?;
                ctx.store
                    .update_status(
                        &node_name,
                        StatusPatch {
                            phase: Some(Phase::Active),
                            cloud_vm_name: Some(vm_name),
                            ..Default::default()
                        },
                    )
                    .await?;
                ctx.store
                    .set_condition(&node_name, ConditionType::VmCreated, ConditionStatus::True, None, None)
                    .await?;
                ctx.store
                    .set_condition(&node_name, ConditionType::NodeJoined, ConditionStatus::True, None, None)
                    .await?;
                ctx.cluster.apply_out_of_service_taint(&node_name).await?;
            }
            None => {
                ctx.store.create(&node_name, Default::default()).await?;
                info!(node = %node_name, "startup pass opened a pending failover record");
            }
        }
    }

    Ok(())
}

/// Re-patches the substitute's expected label set. The patch is a merge,
/// so this is a no-op when labels are already current and self-heals them
/// when a prior label write was lost (operator restart mid-patch, a stale
/// cache, manual tampering).
async fn reapply_substitute_labels(
    ctx: &ControllerContext,
    record: &NodeFailover,
    vm_name: &str,
) -> Result<(), Error> {
    let mut labels = record.spec.target_node_labels.clone();
    labels.insert("node-type".to_string(), "gcp-temporary".to_string());
    labels.insert("node-location".to_string(), "gcp".to_string());
    ctx.cluster.patch_node_labels(vm_name, &labels).await?;
    Ok(())
}

/// Drives every Draining record toward Completed once its stateful
/// workload instances have drained, or once its cluster node has already
/// vanished out from under a still-live VM. Applies the substitute's drain
/// taint itself, gated on `ONPREM_RECOVERY_WAIT_MINUTES` since
/// `recoveryDetectedAt`, before doing any drain bookkeeping.
async fn periodic_pass(ctx: &ControllerContext) -> Result<(), Error> {
    for record in ctx.store.list().await? {
        let status = match &record.status {
            Some(s) if s.phase == Phase::Draining => s,
            _ => continue,
        };
        let node_name = &record.spec.onprem_node_name;
        let vm_name = match &status.cloud_vm_name {
            Some(vm) => vm.clone(),
            None => continue,
        };

        let node_exists = ctx.cluster.get_node(&vm_name).await?.is_some();
        if !node_exists {
            if ctx.cloud.instance_exists(&vm_name).await? {
                ctx.cloud.delete_instance(&vm_name).await?;
            }
            ctx.store
                .update_status(node_name, StatusPatch { phase: Some(Phase::Completed), ..Default::default() })
                .await?;
            continue;
        }

        // Leave the substitute untainted until ONPREM_RECOVERY_WAIT_MINUTES
        // has elapsed since recovery was first observed, then taint it so
        // the scheduler stops placing new work there while it drains.
        let dwell = chrono::Duration::from_std(ctx.config.onprem_recovery_wait).unwrap();
        let dwell_elapsed = status
            .recovery_detected_at
            .map(|t| Utc::now() - t >= dwell)
            .unwrap_or(true);
        if !dwell_elapsed {
            continue;
        }
        ctx.cluster.apply_drain_taint(&vm_name).await?;

        let allocated = ctx.cluster.count_allocated_stateful_instances(&vm_name).await;
        if allocated == 0 {
            ctx.store
                .set_condition(node_name, ConditionType::GameServersDrained, ConditionStatus::True, None, None)
                .await?;
            ctx.cluster.cordon_node(&vm_name).await?;
            ctx.cluster.delete_node(&vm_name).await?;
            ctx.cloud.delete_instance(&vm_name).await?;
            ctx.store
                .update_status(node_name, StatusPatch { phase: Some(Phase::Completed), ..Default::default() })
                .await?;
            info!(node = %node_name, vm = %vm_name, "drain complete, substitute torn down");
            continue;
        }

        if allocated == STATEFUL_COUNT_ERROR_SENTINEL {
            warn!(node = %node_name, vm = %vm_name, "could not count stateful instances, deferring to next sweep");
            continue;
        }

        if let Some(recovered_at) = status.recovery_detected_at {
            if Utc::now() - recovered_at > chrono::Duration::from_std(ctx.config.gameserver_max_wait).unwrap() {
                error!(
                    node = %node_name,
                    vm = %vm_name,
                    allocated,
                    "drain wait exceeded the configured maximum, alerting instead of tearing the substitute down"
                );
                crate::health::alert(ctx, &format!(
                    "node-failover: {node_name} substitute {vm_name} still has {allocated} allocated instances past the drain deadline"
                )).await;
            }
        }
    }

    Ok(())
}
