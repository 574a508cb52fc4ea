/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/error.rs
 *
 * Top-level error type for the node-failover-operator binary. Each module
 * that talks to an external system (cluster, cloud, lock, record store)
 * defines its own `thiserror` enum; this type composes them at the
 * boundaries that need to return a single error (the reconciler sweep, the
 * controller's top-level dispatch, `main`).
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use thiserror::Error;

use crate::gateways::cloud::CloudError;
use crate::gateways::cluster::ClusterError;
use crate::gateways::lock::LockError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster gateway error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("cloud gateway error: {0}")]
    Cloud(#[from] CloudError),

    #[error("distributed lock error: {0}")]
    Lock(#[from] LockError),

    #[error("failover record store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
