//! Shared fixtures for integration tests: bundle document builders and an
//! engine wired to a channel stream so tests can observe emitted records.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::Receiver;

use mpe_core::backend::{Backend, LocalBackend};
use mpe_core::compiler::CompilerOptions;
use mpe_core::record::AccessRecord;
use mpe_core::registry::{Registry, ValidationErrors};
use mpe_core::stream::ChannelStreamFactory;
use mpe_core::PolicyEngine;

/// System policy that neither grants nor denies.
pub const OP_CONTINUE: &str = "package authz\n\ndefault allow = 0\n";

pub const ALLOW: &str = "package authz\n\ndefault allow = true\n";

pub const DENY: &str = "package authz\n\ndefault allow = false\n";

/// `allow` is an integer, so reading it as a boolean raises.
pub const BROKEN_BOOL: &str = "package authz\n\nallow = 1\n";

pub fn policy(mrn: &str, rego: &str) -> Value {
    json!({"mrn": mrn, "rego": rego})
}

pub fn domain(name: &str, spec: Value) -> Value {
    json!({
        "apiVersion": "policy.manetu.io/v1alpha1",
        "kind": "PolicyDomain",
        "metadata": {"name": name},
        "spec": spec,
    })
}

/// Bundle files are written as JSON, which the YAML parser accepts.
pub fn write_bundle(dir: &Path, name: &str, doc: &Value) -> PathBuf {
    let path = dir.join(format!("{name}.yaml"));
    std::fs::write(&path, doc.to_string()).expect("write bundle fixture");
    path
}

pub fn registry_from(docs: &[Value]) -> Result<Registry, ValidationErrors> {
    let parsed = docs
        .iter()
        .map(|doc| serde_json::from_value(doc.clone()).expect("bundle fixture shape"))
        .collect();
    Registry::from_documents(parsed, CompilerOptions::default())
}

pub fn engine_for(registry: Registry) -> (PolicyEngine, Receiver<AccessRecord>) {
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(Arc::new(registry)));
    engine_with_backend(backend)
}

pub fn engine_with_backend(
    backend: Arc<dyn Backend>,
) -> (PolicyEngine, Receiver<AccessRecord>) {
    let (factory, rx) = ChannelStreamFactory::new(16);
    let engine = PolicyEngine::builder()
        .backend(move || backend.clone())
        .access_log(factory)
        .build();
    (engine, rx)
}

/// A bundle covering the common grant path: catch-all operation, an
/// allowing admin role, a denying visitor role, a group carrying the admin
/// role, a default resource group, and one allowing plus one denying
/// scope.
pub fn standard_bundle(name: &str) -> Value {
    domain(
        name,
        json!({
            "policies": [
                policy("mrn:iam:policy:op-continue", OP_CONTINUE),
                policy("mrn:iam:policy:allow", ALLOW),
                policy("mrn:iam:policy:deny", DENY),
            ],
            "operations": [
                {"selectors": [".*"], "policy": "mrn:iam:policy:op-continue"},
            ],
            "roles": [
                {"mrn": "mrn:iam:role:admin", "policy": "mrn:iam:policy:allow"},
                {"mrn": "mrn:iam:role:visitor", "policy": "mrn:iam:policy:deny"},
            ],
            "groups": [
                {"mrn": "mrn:iam:group:ops", "roles": ["mrn:iam:role:admin"]},
            ],
            "resource-groups": [
                {"mrn": "mrn:iam:rg:default", "policy": "mrn:iam:policy:allow", "default": true},
            ],
            "scopes": [
                {"mrn": "mrn:iam:scope:read", "policy": "mrn:iam:policy:allow"},
                {"mrn": "mrn:iam:scope:write", "policy": "mrn:iam:policy:deny"},
            ],
        }),
    )
}
