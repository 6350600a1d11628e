//! Registry construction: loading, validation accumulation, cycle
//! rejection, precedence, and backend lookups over the loaded snapshot.

mod common;

use anyhow::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use common::{domain, policy, registry_from, standard_bundle, write_bundle, ALLOW, DENY, OP_CONTINUE};
use mpe_core::backend::{Backend, LocalBackend};
use mpe_core::compiler::CompilerOptions;
use mpe_core::registry::{Registry, ValidationKind};

fn local_backend(registry: Registry) -> LocalBackend {
    LocalBackend::new(Arc::new(registry))
}

#[tokio::test]
async fn loads_bundle_files_from_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write_bundle(dir.path(), "iam", &standard_bundle("iam"));

    let registry = Registry::load(&[path], CompilerOptions::default())
        .await
        .expect("registry should load");
    assert_eq!(registry.bundle_names(), vec!["iam"]);
    Ok(())
}

#[tokio::test]
async fn unreadable_bundle_is_a_validation_error() -> Result<()> {
    let dir = TempDir::new()?;
    let missing = dir.path().join("missing.yaml");

    let errors = Registry::load(&[missing], CompilerOptions::default())
        .await
        .expect_err("missing file must be rejected");
    assert_eq!(errors.len(), 1);
    assert!(errors.all()[0].message.contains("failed to read"));
    Ok(())
}

#[test]
fn validation_accumulates_every_error() {
    let bundle = domain(
        "iam",
        json!({
            "policies": [
                policy("mrn:iam:policy:ok", ALLOW),
                policy("mrn:iam:policy:broken", "package authz\n\nallow {"),
            ],
            "roles": [
                {"mrn": "mrn:iam:role:dangling", "policy": "mrn:iam:policy:missing"},
            ],
            "resources": [
                {"mrn": "mrn:iam:resource:bad", "selectors": ["["], "group": "mrn:iam:rg:nope"},
            ],
        }),
    );

    let errors = registry_from(&[bundle]).expect_err("invalid bundle must be rejected");

    // dangling role policy, dangling resource group, bad selector, rego
    // parse failure - all reported at once
    assert_eq!(errors.len(), 4);
    assert_eq!(errors.for_domain("iam").len(), 4);

    let by_kind = errors.by_kind();
    assert_eq!(by_kind[&ValidationKind::Reference].len(), 3);
    assert_eq!(by_kind[&ValidationKind::Rego].len(), 1);

    let summary = errors.summary();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.by_domain["iam"], 4);
    assert_eq!(summary.by_kind["reference"], 3);
    assert_eq!(summary.by_kind["rego"], 1);
}

#[test]
fn cross_bundle_library_cycle_is_rejected() {
    let alpha = domain(
        "alpha",
        json!({
            "policy-libraries": [
                {"mrn": "lib-a", "dependencies": ["beta/lib-b"], "rego": "package lib.a\n"},
            ],
        }),
    );
    let beta = domain(
        "beta",
        json!({
            "policy-libraries": [
                {"mrn": "lib-b", "dependencies": ["alpha/lib-a"], "rego": "package lib.b\n"},
            ],
        }),
    );

    let errors = registry_from(&[alpha, beta]).expect_err("cycle must be rejected");
    let cycles = errors.by_kind();
    let cycles = &cycles[&ValidationKind::Cycle];
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].message.contains("alpha/lib-a"));
    assert!(cycles[0].message.contains("beta/lib-b"));
}

#[test]
fn duplicate_mrns_and_bundle_names_are_rejected() {
    let first = domain(
        "iam",
        json!({
            "policies": [
                policy("mrn:iam:policy:p", ALLOW),
                policy("mrn:iam:policy:p", DENY),
            ],
        }),
    );
    let second = domain("iam", json!({}));

    let errors = registry_from(&[first, second]).expect_err("duplicates must be rejected");
    let messages: Vec<&str> = errors.all().iter().map(|e| e.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.contains("duplicate policy MRN")));
    assert!(messages.iter().any(|m| m.contains("duplicate bundle name")));
}

#[test]
fn reference_kind_bundles_are_rejected() {
    let doc = json!({
        "apiVersion": "policy.manetu.io/v1alpha1",
        "kind": "PolicyDomainReference",
        "metadata": {"name": "unresolved"},
    });
    let errors = registry_from(&[doc]).expect_err("reference bundles must be rejected");
    assert!(errors.all()[0].message.contains("resolved by the build tool"));
}

#[test]
fn exactly_one_default_resource_group_per_bundle() {
    let none_default = domain(
        "iam",
        json!({
            "policies": [policy("mrn:iam:policy:allow", ALLOW)],
            "resource-groups": [
                {"mrn": "mrn:iam:rg:a", "policy": "mrn:iam:policy:allow"},
                {"mrn": "mrn:iam:rg:b", "policy": "mrn:iam:policy:allow"},
            ],
        }),
    );
    let errors = registry_from(&[none_default]).expect_err("zero defaults must be rejected");
    assert!(errors.all()[0].message.contains("found 0"));

    let two_defaults = domain(
        "iam",
        json!({
            "policies": [policy("mrn:iam:policy:allow", ALLOW)],
            "resource-groups": [
                {"mrn": "mrn:iam:rg:a", "policy": "mrn:iam:policy:allow", "default": true},
                {"mrn": "mrn:iam:rg:b", "policy": "mrn:iam:policy:allow", "default": true},
            ],
        }),
    );
    let errors = registry_from(&[two_defaults]).expect_err("two defaults must be rejected");
    assert!(errors.all()[0].message.contains("found 2"));
}

#[test]
fn disallowed_builtins_fail_registry_load() {
    let bundle = domain(
        "iam",
        json!({
            "policies": [policy(
                "mrn:iam:policy:phone-home",
                "package authz\n\ndefault allow = false\n\nallow {\n    http.send({\"url\": \"http://x\"})\n}\n",
            )],
        }),
    );
    let errors = registry_from(&[bundle]).expect_err("unsafe builtin must be rejected");
    assert_eq!(errors.by_kind()[&ValidationKind::Rego].len(), 1);
    assert!(errors.all()[0].message.contains("http.send"));
}

#[tokio::test]
async fn first_bundle_wins_collisions() {
    let first = domain(
        "first",
        json!({
            "policies": [policy("mrn:iam:policy:allow", ALLOW)],
            "roles": [{"mrn": "mrn:iam:role:shared", "policy": "mrn:iam:policy:allow"}],
        }),
    );
    let second = domain(
        "second",
        json!({
            "policies": [policy("mrn:iam:policy:deny", DENY)],
            "roles": [{"mrn": "mrn:iam:role:shared", "policy": "mrn:iam:policy:deny"}],
        }),
    );

    let backend = local_backend(registry_from(&[first, second]).unwrap());

    let role = backend.get_role("mrn:iam:role:shared").await.unwrap();
    assert_eq!(role.bundle, "first");

    // qualified references bypass precedence
    let role = backend.get_role("second/mrn:iam:role:shared").await.unwrap();
    assert_eq!(role.bundle, "second");
}

#[tokio::test]
async fn resource_selectors_first_match_in_load_order() {
    let first = domain(
        "first",
        json!({
            "policies": [policy("mrn:iam:policy:allow", ALLOW)],
            "resource-groups": [
                {"mrn": "mrn:first:rg", "policy": "mrn:iam:policy:allow", "default": true},
            ],
            "resources": [
                {"mrn": "mrn:first:resource:docs", "selectors": ["^mrn:doc:.*$"], "group": "mrn:first:rg"},
            ],
        }),
    );
    let second = domain(
        "second",
        json!({
            "policies": [policy("mrn:iam:policy:allow2", ALLOW)],
            "resource-groups": [
                {"mrn": "mrn:second:rg", "policy": "mrn:iam:policy:allow2", "default": true},
            ],
            "resources": [
                {"mrn": "mrn:second:resource:docs", "selectors": ["^mrn:doc:.*$"], "group": "mrn:second:rg"},
            ],
        }),
    );

    let backend = local_backend(registry_from(&[first, second]).unwrap());

    let resource = backend.get_resource("mrn:doc:42").await;
    assert_eq!(resource.mrn, "mrn:first:resource:docs");
    assert_eq!(resource.group, "mrn:first:rg");

    // no selector match: synthesized onto the first bundle's default group
    let resource = backend.get_resource("mrn:vault:7").await;
    assert_eq!(resource.mrn, "mrn:vault:7");
    assert_eq!(resource.group, "mrn:first:rg");
    assert!(resource.annotations.is_empty());
}

#[tokio::test]
async fn operation_selectors_match_in_declaration_order() {
    let bundle = domain(
        "iam",
        json!({
            "policies": [
                policy("mrn:iam:policy:health", "package authz\n\ndefault allow = 1\n"),
                policy("mrn:iam:policy:general", OP_CONTINUE),
            ],
            "operations": [
                {"selectors": ["^public:health:.*$"], "policy": "mrn:iam:policy:health"},
                {"selectors": [".*"], "policy": "mrn:iam:policy:general"},
            ],
        }),
    );

    let backend = local_backend(registry_from(&[bundle]).unwrap());

    let op = backend.get_operation("public:health:check").await.unwrap();
    assert_eq!(op.policy.mrn, "mrn:iam:policy:health");

    let op = backend.get_operation("api:doc:read").await.unwrap();
    assert_eq!(op.policy.mrn, "mrn:iam:policy:general");

    let empty = domain("empty", json!({}));
    let backend = local_backend(registry_from(&[empty]).unwrap());
    assert!(backend.get_operation("api:doc:read").await.is_err());
}

#[tokio::test]
async fn fingerprints_are_stable_across_reloads() {
    let bundle = |lib_a: &str| {
        domain(
            "iam",
            json!({
                "policies": [
                    {"mrn": "mrn:iam:policy:allow", "dependencies": ["lib-a", "lib-b"],
                     "rego": "package authz\n\nimport data.lib.a\n\ndefault allow = true\n"},
                ],
                "policy-libraries": [
                    {"mrn": "lib-a", "rego": lib_a},
                    {"mrn": "lib-b", "rego": "package lib.b\n"},
                ],
            }),
        )
    };

    let fingerprint = |docs: Vec<serde_json::Value>| async move {
        local_backend(registry_from(&docs).unwrap())
            .get_policy("mrn:iam:policy:allow")
            .await
            .unwrap()
            .fingerprint
    };

    let fp_a = fingerprint(vec![bundle("package lib.a\n")]).await;
    let fp_b = fingerprint(vec![bundle("package lib.a\n")]).await;
    assert_eq!(fp_a, fp_b);

    // changing a dependency source changes the fingerprint
    let fp_c = fingerprint(vec![bundle("package lib.a\n\nchanged = true\n")]).await;
    assert_ne!(fp_a, fp_c);
}

#[tokio::test]
async fn mappers_resolve_by_bundle_or_first() {
    let alpha = domain(
        "alpha",
        json!({
            "mappers": [{"selectors": [".*"], "rego": "package mapper\n\nporc = {\"operation\": \"a\"}\n"}],
        }),
    );
    let beta = domain(
        "beta",
        json!({
            "mappers": [{"selectors": [".*"], "rego": "package mapper\n\nporc = {\"operation\": \"b\"}\n"}],
        }),
    );

    let backend = local_backend(registry_from(&[alpha, beta]).unwrap());

    let mapper = backend.get_mapper(None).await.unwrap();
    assert_eq!(mapper.bundle, "alpha");

    let mapper = backend.get_mapper(Some("beta")).await.unwrap();
    assert_eq!(mapper.bundle, "beta");

    assert!(backend.get_mapper(Some("gamma")).await.is_err());
}
