//! The four-phase decision conjunction.
//!
//! SYSTEM runs first; its tri-state integer may short-circuit the rest.
//! IDENTITY (OR across roles), RESOURCE, and SCOPE (AND across scopes) run
//! as parallel tasks over the enriched input. Every fetch or evaluation
//! failure is folded into a DENY reference; phases never panic and never
//! abort their sibling fetches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, PolicyRef, ResourceRef};
use crate::error::ReasonCode;
use crate::record::{
    deny_reason_for, grant_reason_for, BundleReference, Decision, DenyReason, GrantReason, Phase,
    PolicyFingerprint,
};

/// Outcome of one of the parallel phases.
#[derive(Debug)]
pub(crate) struct PhaseOutcome {
    pub granted: bool,
    pub references: Vec<BundleReference>,
}

/// Outcome of the system phase.
#[derive(Debug)]
pub(crate) enum SystemOutcome {
    /// Positive integer: immediate grant, phases 2-4 are skipped.
    Grant {
        reason: GrantReason,
        reference: BundleReference,
    },
    /// Negative integer: immediate deny.
    Deny {
        reason: DenyReason,
        reference: BundleReference,
    },
    /// Zero: the conjunction continues.
    Continue { reference: BundleReference },
    /// Lookup or evaluation failure: deny without an override.
    Fail { reference: BundleReference },
}

fn fingerprints(policy: &PolicyRef) -> Vec<PolicyFingerprint> {
    vec![PolicyFingerprint {
        mrn: policy.mrn.clone(),
        fingerprint: policy.fingerprint,
    }]
}

fn reference(
    id: impl Into<String>,
    phase: Phase,
    policies: Vec<PolicyFingerprint>,
    decision: Decision,
    reason_code: ReasonCode,
    reason: impl Into<String>,
    started: Instant,
) -> BundleReference {
    BundleReference {
        id: id.into(),
        phase,
        policies,
        decision,
        reason_code,
        reason: reason.into(),
        duration_ns: started.elapsed().as_nanos() as u64,
    }
}

/// Phase 1 - SYSTEM. Resolves the operation policy and evaluates it as a
/// tri-state integer.
pub(crate) async fn system_phase(
    backend: &Arc<dyn Backend>,
    operation: &str,
    input: &Value,
) -> SystemOutcome {
    let started = Instant::now();

    let op = match backend.get_operation(operation).await {
        Ok(op) => op,
        Err(e) => {
            debug!("Operation {:?} did not resolve: {}", operation, e);
            return SystemOutcome::Fail {
                reference: reference(
                    operation,
                    Phase::System,
                    vec![],
                    Decision::Deny,
                    e.reason(),
                    e.to_string(),
                    started,
                ),
            };
        }
    };

    match op.policy.ast.eval_int(input) {
        Ok(value) if value > 0 => SystemOutcome::Grant {
            reason: grant_reason_for(value),
            reference: reference(
                op.bundle.clone(),
                Phase::System,
                fingerprints(&op.policy),
                Decision::Grant,
                ReasonCode::PolicyOutcome,
                format!("system override ({value})"),
                started,
            ),
        },
        Ok(0) => SystemOutcome::Continue {
            reference: reference(
                op.bundle.clone(),
                Phase::System,
                fingerprints(&op.policy),
                Decision::Grant,
                ReasonCode::PolicyOutcome,
                "",
                started,
            ),
        },
        Ok(value) => SystemOutcome::Deny {
            reason: deny_reason_for(value),
            reference: reference(
                op.bundle.clone(),
                Phase::System,
                fingerprints(&op.policy),
                Decision::Deny,
                ReasonCode::PolicyOutcome,
                format!("system override ({value})"),
                started,
            ),
        },
        Err(e) => {
            warn!("System policy evaluation failed: {}", e);
            SystemOutcome::Fail {
                reference: reference(
                    op.bundle.clone(),
                    Phase::System,
                    fingerprints(&op.policy),
                    Decision::Deny,
                    ReasonCode::EvaluationError,
                    e.to_string(),
                    started,
                ),
            }
        }
    }
}

/// Phase 2 - IDENTITY. Roles from `mroles` and all groups' roles,
/// deduplicated, each fetched and evaluated concurrently. The phase grants
/// when any role grants; an empty role set denies.
pub(crate) async fn identity_phase(
    backend: &Arc<dyn Backend>,
    mroles: &[String],
    mgroups: &[String],
    input: &Value,
) -> PhaseOutcome {
    let mut references = Vec::new();

    let group_results = join_all(mgroups.iter().map(|mrn| {
        let backend = backend.clone();
        let mrn = mrn.clone();
        async move {
            let started = Instant::now();
            (mrn.clone(), started, backend.get_group(&mrn).await)
        }
    }))
    .await;

    let mut roles: BTreeSet<String> = mroles.iter().cloned().collect();
    for (mrn, started, result) in group_results {
        match result {
            Ok(group) => roles.extend(group.roles.iter().cloned()),
            Err(e) => {
                warn!("Group {} did not resolve: {}", mrn, e);
                references.push(reference(
                    mrn,
                    Phase::Identity,
                    vec![],
                    Decision::Deny,
                    e.reason(),
                    e.to_string(),
                    started,
                ));
            }
        }
    }

    if roles.is_empty() {
        debug!("No roles to evaluate - identity phase denies");
        return PhaseOutcome {
            granted: false,
            references,
        };
    }

    let evaluations = join_all(roles.iter().map(|mrn| {
        let backend = backend.clone();
        let mrn = mrn.clone();
        let input = input.clone();
        async move {
            let started = Instant::now();
            match backend.get_role(&mrn).await {
                Ok(role) => match role.policy.ast.eval_bool(&input) {
                    Ok(granted) => (
                        granted,
                        reference(
                            role.bundle.clone(),
                            Phase::Identity,
                            fingerprints(&role.policy),
                            if granted { Decision::Grant } else { Decision::Deny },
                            ReasonCode::PolicyOutcome,
                            "",
                            started,
                        ),
                    ),
                    Err(e) => (
                        false,
                        reference(
                            role.bundle.clone(),
                            Phase::Identity,
                            fingerprints(&role.policy),
                            Decision::Deny,
                            ReasonCode::EvaluationError,
                            e.to_string(),
                            started,
                        ),
                    ),
                },
                Err(e) => (
                    false,
                    reference(
                        mrn,
                        Phase::Identity,
                        vec![],
                        Decision::Deny,
                        e.reason(),
                        e.to_string(),
                        started,
                    ),
                ),
            }
        }
    }))
    .await;

    let mut granted = false;
    for (vote, bundle_ref) in evaluations {
        granted |= vote;
        references.push(bundle_ref);
    }

    PhaseOutcome {
        granted,
        references,
    }
}

/// Phase 3 - RESOURCE. Evaluates the policy of the resolved resource's
/// group.
pub(crate) async fn resource_phase(
    backend: &Arc<dyn Backend>,
    resource: &ResourceRef,
    input: &Value,
) -> PhaseOutcome {
    let started = Instant::now();

    let rg = match backend.get_resource_group(&resource.group).await {
        Ok(rg) => rg,
        Err(e) => {
            warn!("Resource group {:?} did not resolve: {}", resource.group, e);
            return PhaseOutcome {
                granted: false,
                references: vec![reference(
                    resource.group.clone(),
                    Phase::Resource,
                    vec![],
                    Decision::Deny,
                    e.reason(),
                    e.to_string(),
                    started,
                )],
            };
        }
    };

    match rg.policy.ast.eval_bool(input) {
        Ok(granted) => PhaseOutcome {
            granted,
            references: vec![reference(
                rg.bundle.clone(),
                Phase::Resource,
                fingerprints(&rg.policy),
                if granted { Decision::Grant } else { Decision::Deny },
                ReasonCode::PolicyOutcome,
                "",
                started,
            )],
        },
        Err(e) => PhaseOutcome {
            granted: false,
            references: vec![reference(
                rg.bundle.clone(),
                Phase::Resource,
                fingerprints(&rg.policy),
                Decision::Deny,
                ReasonCode::EvaluationError,
                e.to_string(),
                started,
            )],
        },
    }
}

/// Phase 4 - SCOPE. Every scope must grant; an empty scope list is
/// trivially satisfied.
pub(crate) async fn scope_phase(
    backend: &Arc<dyn Backend>,
    scopes: &[String],
    input: &Value,
) -> PhaseOutcome {
    if scopes.is_empty() {
        return PhaseOutcome {
            granted: true,
            references: vec![],
        };
    }

    let evaluations = join_all(scopes.iter().map(|mrn| {
        let backend = backend.clone();
        let mrn = mrn.clone();
        let input = input.clone();
        async move {
            let started = Instant::now();
            match backend.get_scope(&mrn).await {
                Ok(scope) => match scope.policy.ast.eval_bool(&input) {
                    Ok(granted) => (
                        granted,
                        reference(
                            scope.bundle.clone(),
                            Phase::Scope,
                            fingerprints(&scope.policy),
                            if granted { Decision::Grant } else { Decision::Deny },
                            ReasonCode::PolicyOutcome,
                            "",
                            started,
                        ),
                    ),
                    Err(e) => (
                        false,
                        reference(
                            scope.bundle.clone(),
                            Phase::Scope,
                            fingerprints(&scope.policy),
                            Decision::Deny,
                            ReasonCode::EvaluationError,
                            e.to_string(),
                            started,
                        ),
                    ),
                },
                Err(e) => (
                    false,
                    reference(
                        mrn,
                        Phase::Scope,
                        vec![],
                        Decision::Deny,
                        e.reason(),
                        e.to_string(),
                        started,
                    ),
                ),
            }
        }
    }))
    .await;

    let mut granted = true;
    let mut references = Vec::new();
    for (vote, bundle_ref) in evaluations {
        granted &= vote;
        references.push(bundle_ref);
    }

    PhaseOutcome {
        granted,
        references,
    }
}
