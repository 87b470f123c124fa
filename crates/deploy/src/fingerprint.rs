//! Fingerprint of the inputs that produced a stack.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::StackDescriptor;

/// The descriptor fields that change what the control plane deploys.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    name: &'a str,
    template: String,
    parameters: Vec<(&'a str, &'a str)>,
    capabilities: Vec<&'a str>,
    execution_role: Option<&'a str>,
}

/// Hex-encoded SHA-256 over a descriptor.
///
/// Deterministic: parameters and capabilities are hashed in sorted order.
pub fn descriptor_fingerprint(descriptor: &StackDescriptor) -> String {
    let input = FingerprintInput {
        name: &descriptor.name,
        template: descriptor.template.to_string(),
        parameters: descriptor
            .parameters
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
        capabilities: descriptor.capabilities.iter().map(String::as_str).collect(),
        execution_role: descriptor.execution_role.as_deref(),
    };

    // Serializing plain strings and tuples cannot fail.
    let json = serde_json::to_vec(&input).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}
