/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/gateways/bootstrap.rs
 *
 * Bootstrap-token issuance and CA certificate hash derivation for the
 * cluster-join protocol. The hash must be computed over the DER-encoded
 * SubjectPublicKeyInfo of the cluster CA certificate found in the
 * `kube-public/cluster-info` ConfigMap - that specific derivation is what
 * makes the discovery-token-ca-cert-hash kubeadm passes back verifiable.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;

const CLUSTER_INFO_NAMESPACE: &str = "kube-public";
const CLUSTER_INFO_NAME: &str = "cluster-info";
const BOOTSTRAP_NAMESPACE: &str = "kube-system";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cluster-info configmap is missing the kubeconfig key")]
    MissingKubeconfigKey,

    #[error("failed to parse cluster-info kubeconfig yaml: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("cluster-info kubeconfig has no clusters entries")]
    NoClusters,

    #[error("failed to decode certificate-authority-data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("failed to parse CA certificate: {0}")]
    InvalidCertificate(String),
}

/// Computes the SHA-256 hex digest of the DER-encoded SubjectPublicKeyInfo
/// of the cluster CA, as published in `kube-public/cluster-info`.
pub async fn get_ca_cert_hash(client: &Client) -> Result<Option<String>, BootstrapError> {
    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), CLUSTER_INFO_NAMESPACE);
    let cm = match configmaps.get_opt(CLUSTER_INFO_NAME).await? {
        Some(cm) => cm,
        None => return Ok(None),
    };

    let kubeconfig_yaml = cm
        .data
        .as_ref()
        .and_then(|d| d.get("kubeconfig"))
        .ok_or(BootstrapError::MissingKubeconfigKey)?;

    let doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig_yaml)?;
    let ca_data_b64 = doc
        .get("clusters")
        .and_then(|c| c.as_sequence())
        .and_then(|seq| seq.first())
        .and_then(|entry| entry.get("cluster"))
        .and_then(|cluster| cluster.get("certificate-authority-data"))
        .and_then(|v| v.as_str())
        .ok_or(BootstrapError::NoClusters)?;

    // certificate-authority-data is base64-encoded PEM text, not raw DER -
    // strip the PEM envelope before handing the bytes to the DER parser.
    let pem_bytes = B64.decode(ca_data_b64)?;
    let (_, pem) = parse_x509_pem(&pem_bytes)
        .map_err(|e| BootstrapError::InvalidCertificate(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| BootstrapError::InvalidCertificate(e.to_string()))?;
    let spki_der = cert.public_key().raw;

    let mut hasher = Sha256::new();
    hasher.update(spki_der);
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Mints a `bootstrap.kubernetes.io/token` secret good for `ttl` and
/// returns the `<tokenId>.<tokenSecret>` joined form kubeadm expects.
pub async fn create_bootstrap_token(
    client: &Client,
    ttl: ChronoDuration,
) -> Result<String, BootstrapError> {
    let token_id = hex_token(3);
    let token_secret = hex_token(8);
    let expiration = (Utc::now() + ttl).format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let mut string_data = BTreeMap::new();
    string_data.insert("token-id".to_string(), token_id.clone());
    string_data.insert("token-secret".to_string(), token_secret.clone());
    string_data.insert("usage-bootstrap-authentication".to_string(), "true".to_string());
    string_data.insert("usage-bootstrap-signing".to_string(), "true".to_string());
    string_data.insert(
        "auth-extra-groups".to_string(),
        "system:bootstrappers:kubeadm:default-node-token".to_string(),
    );
    string_data.insert("expiration".to_string(), expiration);

    let secret = Secret {
        metadata: kube::api::ObjectMeta {
            name: Some(format!("bootstrap-token-{token_id}")),
            namespace: Some(BOOTSTRAP_NAMESPACE.to_string()),
            ..Default::default()
        },
        type_: Some("bootstrap.kubernetes.io/token".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), BOOTSTRAP_NAMESPACE);
    secrets.create(&PostParams::default(), &secret).await?;

    Ok(format!("{token_id}.{token_secret}"))
}

pub async fn delete_bootstrap_token(client: &Client, token_id: &str) -> Result<(), BootstrapError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), BOOTSTRAP_NAMESPACE);
    match secrets
        .delete(&format!("bootstrap-token-{token_id}"), &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn hex_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_token_has_expected_length() {
        assert_eq!(hex_token(3).len(), 6);
        assert_eq!(hex_token(8).len(), 16);
    }
}
