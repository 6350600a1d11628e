//! AccessRecord data model.
//!
//! Every decision produces one normalized, auditable record: metadata,
//! principal, the raw PORC as canonical JSON, the decision, and one bundle
//! reference per phase actually executed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compiler::Fingerprint;
use crate::error::ReasonCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Grant,
    Deny,
    Unspecified,
}

/// Phase a bundle reference was produced in, in conjunction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    System,
    Identity,
    Resource,
    Scope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantReason {
    Unspecified,
    /// Operation is public; no principal required.
    Public,
    /// Operation admits unauthenticated visitors.
    Visitor,
    /// Operation must stay reachable to avoid locking operators out.
    AntiLockout,
    /// Normal conjunction outcome.
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    Unspecified,
    /// Operation requires an authenticated principal.
    JwtRequired,
    /// Operation requires an operator principal.
    OperatorRequired,
    /// Normal conjunction outcome.
    Policy,
}

/// The system-phase integer encodes the override reason: positive values
/// grant, negative values deny, zero continues the conjunction.
pub fn grant_reason_for(value: i64) -> GrantReason {
    match value {
        1 => GrantReason::Public,
        2 => GrantReason::Visitor,
        3 => GrantReason::AntiLockout,
        _ => GrantReason::Unspecified,
    }
}

pub fn deny_reason_for(value: i64) -> DenyReason {
    match value {
        -1 => DenyReason::JwtRequired,
        -2 => DenyReason::OperatorRequired,
        _ => DenyReason::Unspecified,
    }
}

/// One evaluated policy within a bundle reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFingerprint {
    pub mrn: String,
    pub fingerprint: Fingerprint,
}

/// The audit trail of one phase consulting one bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleReference {
    /// Bundle name, or the identifier being resolved when no bundle could
    /// be determined (e.g. an unknown MRN).
    pub id: String,

    pub phase: Phase,

    #[serde(default)]
    pub policies: Vec<PolicyFingerprint>,

    pub decision: Decision,

    pub reason_code: ReasonCode,

    #[serde(default)]
    pub reason: String,

    pub duration_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: String,
    pub timestamp: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPrincipal {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub realm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub metadata: RecordMetadata,

    pub principal: RecordPrincipal,

    pub operation: String,

    pub resource: String,

    pub decision: Decision,

    pub references: Vec<BundleReference>,

    /// The raw request as canonical JSON.
    pub porc: String,

    pub system_override: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_reason: Option<GrantReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<DenyReason>,
}

/// Canonical JSON. serde_json objects are BTreeMap-backed, so member order
/// is already key-sorted.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Deterministic reference order: phase order first, then bundle id, then
/// the first policy MRN. Re-sorting here makes records reproducible
/// regardless of task scheduling inside a phase.
pub fn sort_references(references: &mut [BundleReference]) {
    references.sort_by(|a, b| {
        (a.phase, &a.id, a.policies.first().map(|p| &p.mrn))
            .cmp(&(b.phase, &b.id, b.policies.first().map(|p| &p.mrn)))
    });
}

/// Prune to the decisive subset when `bundles.includeall` is off: a DENY
/// keeps only the denying references; a GRANT keeps everything, since the
/// whole conjunction justifies it.
pub fn prune_references(references: Vec<BundleReference>, decision: Decision) -> Vec<BundleReference> {
    match decision {
        Decision::Deny => references
            .into_iter()
            .filter(|r| r.decision == Decision::Deny)
            .collect(),
        _ => references,
    }
}
