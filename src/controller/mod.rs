/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controller/mod.rs
 *
 * The failover state machine. One `reconcile` call handles one
 * `NodeFailover` record's current phase and decides what, if anything,
 * needs to run next. Long operations (grace sleeps, VM creation, the join
 * wait) are spawned as detached tasks so the reconcile call itself stays
 * fast, mirroring how `dr_controller.rs` keeps its `reconcile` function a
 * thin dispatcher around phase-specific handlers.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod naming;
pub mod startup_script;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::crds::{ConditionStatus, ConditionType, NodeFailover, Phase};
use crate::error::Error;
use crate::gateways::cloud::CloudGateway;
use crate::gateways::cluster::{ClusterGateway, Readiness};
use crate::gateways::lock::{DistributedLock, LockError};
use crate::store::{FailoverRecordStore, StatusPatch};

const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);
const JOIN_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const BOOTSTRAP_TOKEN_TTL_SECONDS: i64 = 1800;

pub struct ControllerContext {
    pub cluster: ClusterGateway,
    pub cloud: CloudGateway,
    pub lock: DistributedLock,
    pub store: FailoverRecordStore,
    pub config: Config,
}

/// Top-level dispatcher, analogous to `dr_controller::reconcile`: matches
/// on the record's current phase and hands off to the phase handler. Each
/// handler is responsible for its own transition(s); this function never
/// mutates status itself.
#[instrument(skip(record, ctx), fields(node = %record.spec.onprem_node_name, phase = ?record.status.as_ref().map(|s| &s.phase)))]
pub async fn reconcile(
    record: Arc<NodeFailover>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, Error> {
    let node_name = record.spec.onprem_node_name.clone();
    let phase = record
        .status
        .as_ref()
        .map(|s| s.phase.clone())
        .unwrap_or_default();

    match phase {
        Phase::Pending => handle_pending(&ctx, &node_name).await?,
        Phase::Creating => {
            // Creation runs as a detached task spawned from handle_pending;
            // nothing to do here but wait for it to advance the phase.
        }
        Phase::Active => handle_active(&ctx, &record).await?,
        Phase::Recovering => handle_recovering(&ctx, &record).await?,
        Phase::Draining => {
            // Driven by the reconciler's periodic sweep, not by record events.
        }
        Phase::Completed => {}
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

pub fn error_policy(record: Arc<NodeFailover>, err: &Error, _ctx: Arc<ControllerContext>) -> Action {
    error!(
        node = %record.spec.onprem_node_name,
        error = %err,
        "reconcile failed, requeuing"
    );
    Action::requeue(Duration::from_secs(15))
}

/// Pending: wait out the anti-flap grace period, then re-check readiness
/// before committing to VM creation.
async fn handle_pending(ctx: &ControllerContext, node_name: &str) -> Result<(), Error> {
    tokio::time::sleep(ctx.config.node_flapping_grace).await;

    match ctx.cluster.is_node_ready(node_name).await? {
        Readiness::Ready => {
            ctx.store
                .update_status(node_name, StatusPatch { phase: Some(Phase::Completed), ..Default::default() })
                .await?;
            info!(node = node_name, "node recovered during flap grace, no VM created");
            return Ok(());
        }
        Readiness::NotReady | Readiness::Unknown => {}
    }

    create_failover_vm(ctx, node_name).await
}

/// Creates (or adopts) the cloud substitute for `node_name`. The
/// distributed lock guards only the pre-check and the commit of
/// `cloudVmName`, never the VM-creation network call itself.
async fn create_failover_vm(ctx: &ControllerContext, node_name: &str) -> Result<(), Error> {
    let lock_key = format!("vm-create-{node_name}");
    if !ctx.lock.acquire(&lock_key, LOCK_ACQUIRE_TIMEOUT).await? {
        warn!(node = node_name, "could not acquire create-lock, another replica owns this failover");
        return Ok(());
    }

    let result = create_failover_vm_locked(ctx, node_name).await;
    ctx.lock.release(&lock_key).await?;
    result
}

async fn create_failover_vm_locked(ctx: &ControllerContext, node_name: &str) -> Result<(), Error> {
    let record = match ctx.store.get(node_name).await? {
        Some(r) => r,
        None => return Ok(()),
    };
    let status = record.status.unwrap_or_default();

    if status.vm_creation_attempts >= ctx.config.max_vm_creation_attempts {
        ctx.store
            .update_status(
                node_name,
                StatusPatch {
                    last_error: Some(Some("vm creation attempts exhausted".to_string())),
                    ..Default::default()
                },
            )
            .await?;
        return Ok(());
    }

    // Adopt a VM that a previous, crashed attempt already created.
    let prefix = naming::vm_name_prefix(node_name);
    for existing in ctx.cloud.list_managed_instances().await? {
        if existing.starts_with(&prefix) {
            info!(node = node_name, vm = existing, "adopting pre-existing cloud instance");
            ctx.store
                .update_status(
                    node_name,
                    StatusPatch { cloud_vm_name: Some(existing.clone()), phase: Some(Phase::Creating), ..Default::default() },
                )
                .await?;
            ctx.store
                .set_condition(node_name, ConditionType::VmCreated, ConditionStatus::True, None, None)
                .await?;
            spawn_wait_and_label(ctx, node_name.to_string(), existing);
            return Ok(());
        }
    }

    let vm_name = naming::generate_vm_name(node_name, Utc::now().timestamp());
    debug_assert!(naming::is_valid_vm_name(&vm_name), "generated vm name must satisfy the cloud naming regex");

    ctx.store
        .update_status(
            node_name,
            StatusPatch {
                phase: Some(Phase::Creating),
                vm_creation_attempts: Some(status.vm_creation_attempts + 1),
                ..Default::default()
            },
        )
        .await?;

    let mut labels = ctx.cluster.get_node_custom_labels(node_name).await?;
    labels.retain(|k, _| ctx.config.gcp_node_copy_labels.contains(k));
    labels.insert("onprem-node".to_string(), naming::sanitize_node_name(node_name));
    labels.insert("created-at".to_string(), Utc::now().timestamp().to_string());

    let token = ctx
        .cluster
        .create_bootstrap_token(chrono::Duration::seconds(BOOTSTRAP_TOKEN_TTL_SECONDS))
        .await?;
    let ca_hash = ctx.cluster.get_ca_cert_hash().await?.unwrap_or_default();

    let script = startup_script::render(&startup_script::StartupScriptParams {
        api_server: &ctx.config.k8s_api_server,
        bootstrap_token: &token,
        ca_cert_hash: &ca_hash,
        cloud_provider_name: "gce",
    });

    match ctx.cloud.create_instance(&vm_name, &script, &labels).await {
        Ok(_) => {
            ctx.store
                .update_status(node_name, StatusPatch { cloud_vm_name: Some(vm_name.clone()), ..Default::default() })
                .await?;
            ctx.store
                .set_condition(node_name, ConditionType::VmCreated, ConditionStatus::True, None, None)
                .await?;
            spawn_wait_and_label(ctx, node_name.to_string(), vm_name);
            Ok(())
        }
        Err(e) => {
            ctx.store
                .update_status(node_name, StatusPatch { last_error: Some(Some(e.to_string())), ..Default::default() })
                .await?;
            ctx.store
                .set_condition(
                    node_name,
                    ConditionType::VmCreated,
                    ConditionStatus::False,
                    Some("CreationFailed".to_string()),
                    Some(e.to_string()),
                )
                .await?;
            if status.vm_creation_attempts + 1 < ctx.config.max_vm_creation_attempts {
                spawn_vm_creation_retry(ctx, node_name.to_string(), status.vm_creation_attempts + 1);
            }
            Err(e.into())
        }
    }
}

/// Schedules the next `createFailoverVm` attempt after an exponential
/// backoff (`min(2^attempts * 60s, 300s)`), run as a detached task rather
/// than a recursive call so the attempts cap is the only thing bounding
/// how many times this fires.
fn spawn_vm_creation_retry(ctx: &ControllerContext, node_name: String, attempts: u32) {
    let backoff_secs = 60u64.saturating_mul(2u64.saturating_pow(attempts));
    let backoff = Duration::from_secs(backoff_secs.min(300));
    let cluster_client = ctx.cluster.client().clone();
    let config = ctx.config.clone();
    let lock = ctx.lock.clone();
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        let retry_ctx = ControllerContext {
            cluster: ClusterGateway::new(cluster_client.clone(), &config),
            cloud: CloudGateway::new(&config),
            lock,
            store: FailoverRecordStore::new(cluster_client),
            config,
        };
        if let Err(e) = create_failover_vm(&retry_ctx, &node_name).await {
            error!(node = %node_name, error = %e, "scheduled vm creation retry failed");
        }
    });
}

fn spawn_wait_and_label(ctx: &ControllerContext, node_name: String, vm_name: String) {
    // The controller's gateways hold only owned data / cheap-to-clone
    // clients, so the detached task gets its own handles rather than
    // borrowing from `ctx`, which does not outlive this reconcile call.
    let cluster = ctx.cluster.client().clone();
    let config = ctx.config.clone();
    tokio::spawn(async move {
        let cluster_gateway = ClusterGateway::new(cluster, &config);
        let cloud_gateway = CloudGateway::new(&config);
        let store = FailoverRecordStore::new(cluster_gateway.client().clone());
        if let Err(e) =
            wait_and_label(&cluster_gateway, &cloud_gateway, &store, &node_name, &vm_name).await
        {
            error!(node = %node_name, vm = %vm_name, error = %e, "wait-and-label task failed");
        }
    });
}

async fn wait_and_label(
    cluster: &ClusterGateway,
    cloud: &CloudGateway,
    store: &FailoverRecordStore,
    node_name: &str,
    vm_name: &str,
) -> Result<(), Error> {
    let joined = cluster.wait_for_node_join(vm_name, JOIN_WAIT_TIMEOUT).await?;
    if !joined {
        store
            .set_condition(
                node_name,
                ConditionType::NodeJoined,
                ConditionStatus::False,
                Some("JoinTimeout".to_string()),
                None,
            )
            .await?;
        warn!(node = node_name, vm = vm_name, "join timed out, deleting partially created instance");
        cloud.delete_instance(vm_name).await?;
        return Ok(());
    }

    let record = store.get(node_name).await?;
    let mut labels = record
        .as_ref()
        .map(|r| r.spec.target_node_labels.clone())
        .unwrap_or_default();
    labels.insert("node-type".to_string(), "gcp-temporary".to_string());
    labels.insert("node-location".to_string(), "gcp".to_string());

    cluster.patch_node_labels(vm_name, &labels).await?;
    store
        .set_condition(node_name, ConditionType::NodeJoined, ConditionStatus::True, None, None)
        .await?;
    store
        .update_status(node_name, StatusPatch { phase: Some(Phase::Active), ..Default::default() })
        .await?;
    info!(node = node_name, vm = vm_name, "substitute joined and labeled, phase -> Active");
    Ok(())
}

/// The fixed dwell the Active-phase handler sleeps before re-checking
/// on-premise readiness. Distinct from `ONPREM_RECOVERY_WAIT_MINUTES`,
/// which gates how long the substitute is left untainted after recovery
/// is first observed (see the reconciler's drain-taint gate).
const ACTIVE_RECHECK_GRACE: Duration = Duration::from_secs(300);

/// Active: after a fixed recheck dwell, either the on-premise node has
/// recovered (move to Recovering) or it has not (apply the out-of-service
/// taint so the platform force-terminates stranded pods).
async fn handle_active(ctx: &ControllerContext, record: &NodeFailover) -> Result<(), Error> {
    let node_name = &record.spec.onprem_node_name;
    tokio::time::sleep(ACTIVE_RECHECK_GRACE).await;

    match ctx.cluster.is_node_ready(node_name).await? {
        Readiness::Ready => {
            ctx.store
                .update_status(
                    node_name,
                    StatusPatch {
                        phase: Some(Phase::Recovering),
                        recovery_detected_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            ctx.store
                .set_condition(node_name, ConditionType::OnPremRecovered, ConditionStatus::True, None, None)
                .await?;
            info!(node = %node_name, "on-prem node recovered, phase -> Recovering");
        }
        Readiness::NotReady | Readiness::Unknown => {
            ctx.cluster.apply_out_of_service_taint(node_name).await?;
            ctx.store
                .set_condition(node_name, ConditionType::TaintApplied, ConditionStatus::True, None, None)
                .await?;
        }
    }
    Ok(())
}

/// Recovering: remove the out-of-service taint now that the on-premise
/// node is back, then move to Draining. The substitute's drain taint is
/// applied separately by the reconciler's periodic pass once
/// `ONPREM_RECOVERY_WAIT_MINUTES` has elapsed since `recoveryDetectedAt`;
/// teardown of the substitute is likewise the reconciler's job.
async fn handle_recovering(ctx: &ControllerContext, record: &NodeFailover) -> Result<(), Error> {
    let node_name = &record.spec.onprem_node_name;
    ctx.cluster.remove_out_of_service_taint(node_name).await?;

    ctx.store
        .update_status(node_name, StatusPatch { phase: Some(Phase::Draining), ..Default::default() })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use kube::Client;

    fn test_config() -> Config {
        Config {
            gcp_project_id: "test-project".into(),
            gcp_zone: "us-central1-a".into(),
            gcp_machine_type: "n2-standard-4".into(),
            gcp_network: "default".into(),
            gcp_subnet: "default".into(),
            gcp_image_project: "test-project".into(),
            gcp_image_name: "test-image".into(),
            k8s_api_server: "https://10.0.0.1:6443".into(),
            gcp_node_copy_labels: vec![],
            node_flapping_grace: Duration::from_secs(30),
            max_vm_creation_attempts: 3,
            reconciliation_interval: Duration::from_secs(60),
            onprem_recovery_wait: Duration::from_secs(600),
            gameserver_max_wait: Duration::from_secs(3 * 3600),
            stateful_workload_group: "agones.dev".into(),
            stateful_workload_version: "v1".into(),
            stateful_workload_kind: "GameServer".into(),
            stateful_workload_plural: "gameservers".into(),
            alert_webhook_url: None,
            log_level: "info".into(),
        }
    }

    // In real tests, you'd use a mock client.
    fn create_test_context() -> ControllerContext {
        let client = Client::try_default().unwrap_or_else(|_| panic!("failed to create k8s client for tests"));
        let config = test_config();
        ControllerContext {
            cluster: ClusterGateway::new(client.clone(), &config),
            cloud: CloudGateway::new(&config),
            lock: DistributedLock::new(client.clone(), "test-replica"),
            store: FailoverRecordStore::new(client),
            config,
        }
    }

    fn test_record() -> NodeFailover {
        NodeFailover {
            metadata: ObjectMeta {
                name: Some("worker-01".to_string()),
                ..Default::default()
            },
            spec: crate::crds::NodeFailoverSpec {
                onprem_node_name: "worker-01".to_string(),
                target_node_labels: Default::default(),
            },
            status: None,
        }
    }

    #[test]
    fn error_policy_always_requeues() {
        let record = Arc::new(test_record());
        let err = Error::Lock(LockError::Timeout("vm-create-worker-01".into()));
        let ctx = Arc::new(create_test_context());

        let action = error_policy(record, &err, ctx);

        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
    }
}
