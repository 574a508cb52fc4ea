/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controller/startup_script.rs
 *
 * Renders the POSIX shell script attached to a temporary VM as its boot
 * metadata. Unlike the original implementation's startup script, this one
 * also writes a kubelet extra-args file pointed at cloud metadata before
 * joining, so the kubelet registers with the right `--provider-id` from
 * its first heartbeat instead of needing a later patch.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

pub struct StartupScriptParams<'a> {
    pub api_server: &'a str,
    pub bootstrap_token: &'a str,
    pub ca_cert_hash: &'a str,
    pub cloud_provider_name: &'a str,
}

pub fn render(params: &StartupScriptParams<'_>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail

PROJECT_ID=$(curl -s -H "Metadata-Flavor: Google" "http://metadata.google.internal/computeMetadata/v1/project/project-id")
ZONE=$(curl -s -H "Metadata-Flavor: Google" "http://metadata.google.internal/computeMetadata/v1/instance/zone" | awk -F/ '{{print $NF}}')
INSTANCE_NAME=$(curl -s -H "Metadata-Flavor: Google" "http://metadata.google.internal/computeMetadata/v1/instance/name")

mkdir -p /etc/default
cat <<EOF > /etc/default/kubelet
KUBELET_EXTRA_ARGS="--cloud-provider=external --provider-id={cloud_provider_name}://${{PROJECT_ID}}/${{ZONE}}/${{INSTANCE_NAME}}"
EOF

kubeadm join {api_server} \
    --token {bootstrap_token} \
    --discovery-token-ca-cert-hash sha256:{ca_cert_hash}

echo "SETUP_COMPLETE"
"#,
        cloud_provider_name = params.cloud_provider_name,
        api_server = params.api_server,
        bootstrap_token = params.bootstrap_token,
        ca_cert_hash = params.ca_cert_hash,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_join_command_and_completion_marker() {
        let script = render(&StartupScriptParams {
            api_server: "https://10.0.0.1:6443",
            bootstrap_token: "abcdef.0123456789abcdef",
            ca_cert_hash: "deadbeef",
            cloud_provider_name: "gce",
        });

        assert!(script.contains("kubeadm join https://10.0.0.1:6443"));
        assert!(script.contains("--token abcdef.0123456789abcdef"));
        assert!(script.contains("--discovery-token-ca-cert-hash sha256:deadbeef"));
        assert!(script.contains("provider-id=gce://"));
        assert!(script.trim_end().ends_with("SETUP_COMPLETE"));
    }
}
