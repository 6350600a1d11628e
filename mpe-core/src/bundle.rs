//! Bundle (PolicyDomain) document model.
//!
//! A bundle is a self-contained YAML document declaring policies, policy
//! libraries, roles, groups, resource groups, resources, scopes,
//! operations, and mappers. Reference-kind documents carry
//! `rego_filename:` pointers and are resolved by the build tool before they
//! reach the registry.

use serde::{Deserialize, Serialize};

use crate::annotations::AnnotationMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDoc {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: BundleKind,

    pub metadata: BundleMetadata,

    #[serde(default)]
    pub spec: BundleSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleKind {
    PolicyDomain,
    PolicyDomainReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleSpec {
    #[serde(default)]
    pub policies: Vec<PolicyDef>,

    #[serde(default, rename = "policy-libraries")]
    pub policy_libraries: Vec<PolicyDef>,

    #[serde(default)]
    pub roles: Vec<RoleDef>,

    #[serde(default)]
    pub groups: Vec<GroupDef>,

    #[serde(default, rename = "resource-groups")]
    pub resource_groups: Vec<ResourceGroupDef>,

    #[serde(default)]
    pub resources: Vec<ResourceDef>,

    #[serde(default)]
    pub scopes: Vec<ScopeDef>,

    #[serde(default)]
    pub operations: Vec<OperationDef>,

    #[serde(default)]
    pub mappers: Vec<MapperDef>,
}

/// A policy or policy library: inline Rego plus library dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDef {
    pub mrn: String,

    /// Library references, local (`lib-x`) or qualified (`bundle/lib-x`).
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub rego: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDef {
    pub mrn: String,

    pub policy: String,

    #[serde(default)]
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDef {
    pub mrn: String,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGroupDef {
    pub mrn: String,

    pub policy: String,

    #[serde(default)]
    pub annotations: AnnotationMap,

    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    pub mrn: String,

    /// Regexes resolving unknown resource MRNs to this resource.
    #[serde(default)]
    pub selectors: Vec<String>,

    pub group: String,

    #[serde(default)]
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDef {
    pub mrn: String,

    pub policy: String,

    #[serde(default)]
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDef {
    #[serde(default)]
    pub mrn: Option<String>,

    /// Regexes matched against the PORC operation string, in declaration
    /// order.
    #[serde(default)]
    pub selectors: Vec<String>,

    pub policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperDef {
    #[serde(default)]
    pub selectors: Vec<String>,

    pub rego: String,
}
