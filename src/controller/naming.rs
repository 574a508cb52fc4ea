/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controller/naming.rs
 *
 * VM naming: sanitizes an on-premise node name into a cloud-safe prefix
 * and appends a timestamp so concurrent attempts never collide. The
 * sanitization and truncation rules are load-bearing - cloud instance
 * names must match `^[a-z]([a-z0-9-]{0,62})?$`.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

const VM_NAME_PREFIX: &str = "cloud-temp-";
const MAX_VM_NAME_LEN: usize = 63;

/// Lowercases, maps underscores to hyphens, strips everything outside
/// `[a-z0-9-]`, and prepends `node-` if the result would not start with a
/// letter.
pub fn sanitize_node_name(node_name: &str) -> String {
    let lowered = node_name.to_lowercase().replace('_', "-");
    let filtered: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    match filtered.chars().next() {
        Some(c) if c.is_ascii_lowercase() => filtered,
        _ => format!("node-{filtered}"),
    }
}

/// Builds `cloud-temp-<sanitized>-<unixSeconds>`, truncated to 63
/// characters while preserving the prefix and the timestamp suffix.
pub fn generate_vm_name(node_name: &str, unix_seconds: i64) -> String {
    let sanitized = sanitize_node_name(node_name);
    let suffix = format!("-{unix_seconds}");
    let budget = MAX_VM_NAME_LEN - VM_NAME_PREFIX.len() - suffix.len();
    let truncated_sanitized: String = sanitized.chars().take(budget).collect();
    let truncated_sanitized = truncated_sanitized.trim_end_matches('-').to_string();

    format!("{VM_NAME_PREFIX}{truncated_sanitized}{suffix}")
}

/// The prefix the reconciler and the adopt-existing-VM path scan for: any
/// live cloud instance beginning with this string belongs to this node's
/// failover cycle.
pub fn vm_name_prefix(node_name: &str) -> String {
    format!("{VM_NAME_PREFIX}{}-", sanitize_node_name(node_name))
}

pub fn is_valid_vm_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_VM_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_underscores_and_case() {
        assert_eq!(sanitize_node_name("Worker_01"), "worker-01");
    }

    #[test]
    fn strips_disallowed_characters() {
        assert_eq!(sanitize_node_name("worker.01!@#"), "worker01");
    }

    #[test]
    fn prepends_node_when_not_starting_with_letter() {
        assert_eq!(sanitize_node_name("01-worker"), "node-01-worker");
    }

    #[test]
    fn generated_name_matches_regex_and_is_short() {
        let name = generate_vm_name("Worker_01", 1_700_000_000);
        assert!(name.starts_with("cloud-temp-worker-01-"));
        assert!(is_valid_vm_name(&name));
        assert!(name.len() <= 63);
    }

    #[test]
    fn long_node_name_is_truncated_but_stays_valid() {
        let long_name = "a".repeat(120);
        let name = generate_vm_name(&long_name, 1_700_000_000);
        assert!(name.len() <= 63);
        assert!(is_valid_vm_name(&name));
        assert!(name.ends_with("-1700000000"));
    }

    #[test]
    fn prefix_used_for_adoption_scan() {
        assert_eq!(vm_name_prefix("Worker_01"), "cloud-temp-worker-01-");
    }
}
