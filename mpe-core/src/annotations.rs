//! Annotation merging.
//!
//! Annotations are `{value, strategy}` entries attached to roles, groups,
//! scopes, and the PORC principal. Before policy evaluation they are folded
//! across the fixed priority hierarchy role < group < scope < PORC, the
//! higher-priority entry merging into the accumulated result.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::backend::Backend;

/// Per-entry merge strategy. An absent strategy inherits the domain
/// default, which is `deep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Replace,
    Append,
    Prepend,
    Union,
    Deep,
}

pub const DEFAULT_STRATEGY: MergeStrategy = MergeStrategy::Deep;

/// A single annotation entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MergeStrategy>,
}

impl Annotation {
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            strategy: None,
        }
    }

    pub fn with_strategy(value: Value, strategy: MergeStrategy) -> Self {
        Self {
            value,
            strategy: Some(strategy),
        }
    }
}

// Bundle authors may write either a bare value or the tagged
// `{value, strategy}` form; an empty strategy string means inherit-default.
impl<'de> Deserialize<'de> for Annotation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Tagged {
            value: Value,
            #[serde(default)]
            strategy: Option<String>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Tagged(Tagged),
            Raw(Value),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Tagged(t) => {
                let strategy = match t.strategy.as_deref() {
                    None | Some("") => None,
                    Some("replace") => Some(MergeStrategy::Replace),
                    Some("append") => Some(MergeStrategy::Append),
                    Some("prepend") => Some(MergeStrategy::Prepend),
                    Some("union") => Some(MergeStrategy::Union),
                    Some("deep") => Some(MergeStrategy::Deep),
                    Some(other) => {
                        return Err(serde::de::Error::custom(format!(
                            "unknown merge strategy {other:?}"
                        )))
                    }
                };
                Ok(Annotation {
                    value: t.value,
                    strategy,
                })
            }
            Repr::Raw(value) => Ok(Annotation::plain(value)),
        }
    }
}

pub type AnnotationMap = BTreeMap<String, Annotation>;

/// Convert a raw JSON object (e.g. PORC `principal.annotations`) into an
/// annotation map with inherited-default strategies.
pub fn from_plain(obj: &Map<String, Value>) -> AnnotationMap {
    obj.iter()
        .map(|(k, v)| (k.clone(), Annotation::plain(v.clone())))
        .collect()
}

/// Strip strategies, leaving the merged values.
pub fn to_plain(map: &AnnotationMap) -> Map<String, Value> {
    map.iter()
        .map(|(k, a)| (k.clone(), a.value.clone()))
        .collect()
}

/// Merge a higher-priority value into a lower-priority one.
///
/// When the two values differ in top-level kind the higher value wins
/// unconditionally, regardless of strategy.
pub fn merge_values(lower: &Value, higher: &Value, strategy: MergeStrategy) -> Value {
    match (lower, higher) {
        (Value::Array(l), Value::Array(h)) => merge_arrays(l, h, strategy),
        (Value::Object(l), Value::Object(h)) => merge_objects(l, h, strategy),
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            higher.clone()
        }
        _ => merge_scalars(lower, higher, strategy),
    }
}

fn merge_arrays(lower: &[Value], higher: &[Value], strategy: MergeStrategy) -> Value {
    match strategy {
        MergeStrategy::Replace => Value::Array(higher.to_vec()),
        MergeStrategy::Prepend => {
            let mut out = lower.to_vec();
            out.extend(higher.iter().cloned());
            Value::Array(out)
        }
        // append and deep both order higher elements first
        MergeStrategy::Append | MergeStrategy::Deep => {
            let mut out = higher.to_vec();
            out.extend(lower.iter().cloned());
            Value::Array(out)
        }
        MergeStrategy::Union => {
            let mut seen = BTreeSet::new();
            let mut out = Vec::new();
            for item in higher.iter().chain(lower.iter()) {
                let key = dedup_key(item);
                if seen.insert(key) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
    }
}

/// Dedup key for `union`: scalars key directly, composites by canonical
/// JSON. serde_json objects are BTreeMap-backed, so serialization is
/// already key-sorted.
fn dedup_key(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

fn merge_objects(
    lower: &Map<String, Value>,
    higher: &Map<String, Value>,
    strategy: MergeStrategy,
) -> Value {
    match strategy {
        MergeStrategy::Replace => Value::Object(higher.clone()),
        MergeStrategy::Append => {
            // shallow merge, higher wins
            let mut out = lower.clone();
            for (k, v) in higher {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        MergeStrategy::Prepend => {
            // shallow merge, lower wins
            let mut out = higher.clone();
            for (k, v) in lower {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        MergeStrategy::Union | MergeStrategy::Deep => {
            let mut out = lower.clone();
            for (k, v) in higher {
                match out.get(k) {
                    Some(existing) => {
                        let merged = merge_values(existing, v, MergeStrategy::Deep);
                        out.insert(k.clone(), merged);
                    }
                    None => {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
    }
}

fn merge_scalars(lower: &Value, higher: &Value, strategy: MergeStrategy) -> Value {
    match strategy {
        MergeStrategy::Prepend => lower.clone(),
        _ => higher.clone(),
    }
}

/// Merge a higher-priority map into the accumulated lower-priority map.
///
/// Per-entry strategy precedence: the higher entry's strategy, then the
/// lower entry's, then the domain default (`deep`).
pub fn merge_maps(lower: &AnnotationMap, higher: &AnnotationMap) -> AnnotationMap {
    let mut out = lower.clone();
    for (key, high) in higher {
        match lower.get(key) {
            Some(low) => {
                let strategy = high
                    .strategy
                    .or(low.strategy)
                    .unwrap_or(DEFAULT_STRATEGY);
                out.insert(
                    key.clone(),
                    Annotation {
                        value: merge_values(&low.value, &high.value, strategy),
                        strategy: high.strategy.or(low.strategy),
                    },
                );
            }
            None => {
                out.insert(key.clone(), high.clone());
            }
        }
    }
    out
}

/// Resolve the effective annotations for a request.
///
/// Group, role, and scope entities are fetched concurrently; a fetch
/// failure logs and omits that source. Roles inherited from groups are
/// unioned with the explicit roles before role annotations are fetched.
/// Entities within one tier merge in sorted-MRN order.
pub async fn gather_annotations(
    backend: &Arc<dyn Backend>,
    porc_annotations: &Map<String, Value>,
    scopes: &[String],
    groups: &[String],
    roles: &[String],
) -> Map<String, Value> {
    let group_fetches = join_all(groups.iter().map(|mrn| {
        let backend = backend.clone();
        let mrn = mrn.clone();
        async move { (mrn.clone(), backend.get_group(&mrn).await) }
    }));
    let scope_fetches = join_all(scopes.iter().map(|mrn| {
        let backend = backend.clone();
        let mrn = mrn.clone();
        async move { (mrn.clone(), backend.get_scope(&mrn).await) }
    }));
    let (group_results, scope_results) = tokio::join!(group_fetches, scope_fetches);

    let mut group_annotations: BTreeMap<String, AnnotationMap> = BTreeMap::new();
    let mut all_roles: BTreeSet<String> = roles.iter().cloned().collect();
    for (mrn, result) in group_results {
        match result {
            Ok(group) => {
                all_roles.extend(group.roles.iter().cloned());
                group_annotations.insert(mrn, group.annotations);
            }
            Err(e) => warn!("Annotation source group {} omitted: {}", mrn, e),
        }
    }

    let role_results = join_all(all_roles.iter().map(|mrn| {
        let backend = backend.clone();
        let mrn = mrn.clone();
        async move { (mrn.clone(), backend.get_role(&mrn).await) }
    }))
    .await;

    let mut role_annotations: BTreeMap<String, AnnotationMap> = BTreeMap::new();
    for (mrn, result) in role_results {
        match result {
            Ok(role) => {
                role_annotations.insert(mrn, role.annotations);
            }
            Err(e) => warn!("Annotation source role {} omitted: {}", mrn, e),
        }
    }

    let mut scope_annotations: BTreeMap<String, AnnotationMap> = BTreeMap::new();
    for (mrn, result) in scope_results {
        match result {
            Ok(scope) => {
                scope_annotations.insert(mrn, scope.annotations);
            }
            Err(e) => warn!("Annotation source scope {} omitted: {}", mrn, e),
        }
    }

    let mut merged = AnnotationMap::new();
    for annotations in role_annotations.values() {
        merged = merge_maps(&merged, annotations);
    }
    for annotations in group_annotations.values() {
        merged = merge_maps(&merged, annotations);
    }
    for annotations in scope_annotations.values() {
        merged = merge_maps(&merged, annotations);
    }
    merged = merge_maps(&merged, &from_plain(porc_annotations));

    debug!("Merged {} annotation entries", merged.len());
    to_plain(&merged)
}
