/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/gateways/lock.rs
 *
 * A cluster-wide expiring mutex backed by a coordination.k8s.io Lease,
 * used to serialize VM creation across controller replicas. Only the
 * pre-check/commit of `cloudVmName` runs inside the guarded section; the
 * VM-creation call itself happens outside the lock so a 15s lease never
 * has to outlive a multi-minute cloud operation.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const LOCK_NAMESPACE: &str = "default";
const LEASE_DURATION_SECONDS: i32 = 15;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("timed out waiting to acquire lock {0}")]
    Timeout(String),
}

#[derive(Clone)]
pub struct DistributedLock {
    leases: Api<Lease>,
    holder_identity: String,
}

impl DistributedLock {
    pub fn new(client: Client, holder_identity: impl Into<String>) -> Self {
        DistributedLock {
            leases: Api::namespaced(client, LOCK_NAMESPACE),
            holder_identity: holder_identity.into(),
        }
    }

    fn lease_name(resource: &str) -> String {
        format!("node-failover-lock-{resource}")
    }

    /// Attempts to acquire the named lock within `timeout`, retrying once
    /// a second on conflict or on an unexpired lease held by another
    /// replica.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<bool, LockError> {
        let name = Self::lease_name(resource);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.leases.get_opt(&name).await? {
                None => match self.create_lease(&name).await {
                    Ok(()) => return Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        debug!(lease = %name, "lease creation conflict, retrying");
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(lease) => {
                    if is_expired(&lease) {
                        match self.take_over_lease(&name, &lease).await {
                            Ok(()) => return Ok(true),
                            Err(kube::Error::Api(e)) if e.code == 409 => {
                                debug!(lease = %name, "lease update conflict, retrying");
                            }
                            Err(e) => return Err(e.into()),
                        }
                    } else if held_by(&lease, &self.holder_identity) {
                        return Ok(true);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    pub async fn release(&self, resource: &str) -> Result<(), LockError> {
        let name = Self::lease_name(resource);
        match self.leases.delete(&name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, name: &str) -> Result<(), kube::Error> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(LOCK_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder_identity.clone()),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                ..Default::default()
            }),
        };
        self.leases.create(&PostParams::default(), &lease).await?;
        Ok(())
    }

    async fn take_over_lease(&self, name: &str, current: &Lease) -> Result<(), kube::Error> {
        warn!(lease = %name, "lease expired, taking over");
        let now = MicroTime(Utc::now());
        let mut updated = current.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.holder_identity = Some(self.holder_identity.clone());
        spec.acquire_time = Some(now.clone());
        spec.renew_time = Some(now);
        spec.lease_duration_seconds = Some(LEASE_DURATION_SECONDS);

        self.leases
            .patch(
                name,
                &PatchParams::apply("node-failover-operator"),
                &Patch::Merge(&updated),
            )
            .await?;
        Ok(())
    }
}

fn is_expired(lease: &Lease) -> bool {
    let spec = match &lease.spec {
        Some(s) => s,
        None => return true,
    };
    let renew_time = match &spec.renew_time {
        Some(t) => t.0,
        None => return true,
    };
    let duration = spec
        .lease_duration_seconds
        .unwrap_or(LEASE_DURATION_SECONDS);
    Utc::now() - renew_time >= chrono::Duration::seconds(duration as i64)
}

fn held_by(lease: &Lease, identity: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .map(|h| h == identity)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_with_renew(seconds_ago: i64, holder: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(String::from),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(seconds_ago))),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn expired_lease_detected() {
        let lease = lease_with_renew(20, Some("replica-b"));
        assert!(is_expired(&lease));
    }

    #[test]
    fn fresh_lease_not_expired() {
        let lease = lease_with_renew(1, Some("replica-b"));
        assert!(!is_expired(&lease));
    }

    #[test]
    fn held_by_self_matches_identity() {
        let lease = lease_with_renew(1, Some("replica-a"));
        assert!(held_by(&lease, "replica-a"));
        let lease = lease_with_renew(1, Some("replica-b"));
        assert!(!held_by(&lease, "replica-a"));
    }
}
