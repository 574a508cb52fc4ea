/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/health.rs
 *
 * Liveness endpoint and the optional alert webhook notifier, both served
 * the way `ph_operator`'s metrics/webhook servers are: a small `warp`
 * filter tree bound to a fixed port.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::net::SocketAddr;

use serde::Serialize;
use tracing::{error, info, warn};
use warp::Filter;

use crate::controller::ControllerContext;

pub async fn run_liveness_server(addr: SocketAddr) {
    let healthz = warp::path("healthz").map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

    info!(%addr, "liveness endpoint listening");
    warp::serve(healthz).run(addr).await;
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    text: &'a str,
}

/// Best-effort notification to `ALERT_WEBHOOK_URL`. Failures are logged,
/// never propagated - an alert that cannot be sent must not stall the
/// reconciliation pass that raised it.
pub async fn alert(ctx: &ControllerContext, message: &str) {
    let Some(url) = &ctx.config.alert_webhook_url else {
        return;
    };

    let client = reqwest::Client::new();
    let payload = AlertPayload { text: message };
    match client.post(url).json(&payload).send().await {
        Ok(resp) if !resp.status().is_success() => {
            warn!(status = %resp.status(), "alert webhook returned an error status");
        }
        Err(e) => error!(error = %e, "failed to deliver alert webhook"),
        Ok(_) => {}
    }
}
