/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/main.rs
 *
 * Entrypoint. Builds the cluster client, assembles the shared
 * `ControllerContext`, and runs the event router, the reconciler, the
 * `kube::runtime::Controller` watch loop, and the liveness server
 * concurrently - the same `tokio::join!` fan-out `ph_operator`'s `main.rs`
 * uses to run several controllers side by side.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

mod config;
mod controller;
mod crds;
mod error;
mod event_router;
mod gateways;
mod health;
mod reconciler;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::controller::ControllerContext;
use crate::crds::NodeFailover;
use crate::gateways::cloud::CloudGateway;
use crate::gateways::cluster::ClusterGateway;
use crate::gateways::lock::DistributedLock;
use crate::store::FailoverRecordStore;

fn init_telemetry(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    init_telemetry(&config.log_level);

    info!("starting node-failover-operator");

    let client = Client::try_default().await?;
    let holder_identity = hostname();

    let ctx = Arc::new(ControllerContext {
        cluster: ClusterGateway::new(client.clone(), &config),
        cloud: CloudGateway::new(&config),
        lock: DistributedLock::new(client.clone(), holder_identity),
        store: FailoverRecordStore::new(client.clone()),
        config,
    });

    let liveness_addr: SocketAddr = ([0, 0, 0, 0], 8080).into();

    let records: Api<NodeFailover> = Api::all(client.clone());

    let controller_fut = Controller::new(records, watcher::Config::default())
        .run(controller::reconcile, controller::error_policy, ctx.clone())
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = %e, "controller reported a reconcile error");
            }
        });

    let router_fut = event_router::run(ctx.clone());
    let reconciler_fut = reconciler::run(ctx.clone());
    let liveness_fut = health::run_liveness_server(liveness_addr);

    tokio::join!(controller_fut, router_fut, reconciler_fut, liveness_fut);

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node-failover-operator".to_string())
}
