//! Backend interface.
//!
//! A pure read-through facade over the registry. The engine only ever
//! talks to a [`Backend`]; the local implementation answers from the
//! in-memory registry, while remote implementations may add NETWORK
//! failures. All returned policies are compiled and immutable.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::annotations::AnnotationMap;
use crate::compiler::{CompiledPolicy, Fingerprint};
use crate::error::ReasonCode;
use crate::registry::Registry;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("backend communication failed: {0}")]
    Network(String),
}

impl BackendError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            BackendError::NotFound(_) => ReasonCode::NotfoundError,
            BackendError::Network(_) => ReasonCode::NetworkError,
        }
    }
}

/// A compiled policy handle: MRN, fingerprint, and the executable AST.
#[derive(Debug, Clone)]
pub struct PolicyRef {
    pub mrn: String,
    pub fingerprint: Fingerprint,
    pub ast: Arc<CompiledPolicy>,
}

#[derive(Debug, Clone)]
pub struct OperationRef {
    /// Bundle whose selector matched.
    pub bundle: String,
    pub policy: PolicyRef,
}

#[derive(Debug, Clone)]
pub struct RoleRef {
    pub mrn: String,
    pub bundle: String,
    pub policy: PolicyRef,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct GroupRef {
    pub mrn: String,
    pub bundle: String,
    pub roles: Vec<String>,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct ScopeRef {
    pub mrn: String,
    pub bundle: String,
    pub policy: PolicyRef,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct ResourceGroupRef {
    pub mrn: String,
    pub bundle: String,
    pub policy: PolicyRef,
    pub annotations: AnnotationMap,
}

/// A resolved resource. May be synthesized: an MRN matching no selector
/// resolves to the default resource group with empty annotations.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub mrn: String,
    pub group: String,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct MapperRef {
    pub bundle: String,
    pub ast: Arc<CompiledPolicy>,
}

/// Typed fetchers over the registry.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The first bundle whose first matching operation selector matches.
    async fn get_operation(&self, operation: &str) -> Result<OperationRef, BackendError>;

    async fn get_role(&self, mrn: &str) -> Result<RoleRef, BackendError>;

    async fn get_group(&self, mrn: &str) -> Result<GroupRef, BackendError>;

    async fn get_scope(&self, mrn: &str) -> Result<ScopeRef, BackendError>;

    async fn get_resource_group(&self, mrn: &str) -> Result<ResourceGroupRef, BackendError>;

    /// Never fails: an unmatched MRN synthesizes a resource bound to the
    /// default resource group.
    async fn get_resource(&self, mrn: &str) -> ResourceRef;

    async fn get_mapper(&self, bundle: Option<&str>) -> Result<MapperRef, BackendError>;

    async fn get_policy(&self, mrn: &str) -> Result<PolicyRef, BackendError>;
}

/// Constructs backends for the engine.
pub trait BackendFactory: Send + Sync {
    fn new_backend(&self) -> Arc<dyn Backend>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync,
{
    fn new_backend(&self) -> Arc<dyn Backend> {
        self()
    }
}

fn policy_ref(entity: &crate::registry::PolicyEntity) -> PolicyRef {
    PolicyRef {
        mrn: entity.mrn.clone(),
        fingerprint: entity.fingerprint,
        ast: entity.ast.clone(),
    }
}

/// Read-through backend over an in-memory registry snapshot.
#[derive(Clone)]
pub struct LocalBackend {
    registry: Arc<Registry>,
}

impl LocalBackend {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get_operation(&self, operation: &str) -> Result<OperationRef, BackendError> {
        let (bundle, entity) = self
            .registry
            .match_operation(operation)
            .ok_or_else(|| BackendError::NotFound(format!("operation {operation}")))?;
        Ok(OperationRef {
            bundle: bundle.to_string(),
            policy: policy_ref(&entity.policy),
        })
    }

    async fn get_role(&self, mrn: &str) -> Result<RoleRef, BackendError> {
        let (bundle, entity) = self
            .registry
            .find_role(mrn)
            .ok_or_else(|| BackendError::NotFound(format!("role {mrn}")))?;
        Ok(RoleRef {
            mrn: entity.mrn.clone(),
            bundle: bundle.to_string(),
            policy: policy_ref(&entity.policy),
            annotations: entity.annotations.clone(),
        })
    }

    async fn get_group(&self, mrn: &str) -> Result<GroupRef, BackendError> {
        let (bundle, entity) = self
            .registry
            .find_group(mrn)
            .ok_or_else(|| BackendError::NotFound(format!("group {mrn}")))?;
        Ok(GroupRef {
            mrn: entity.mrn.clone(),
            bundle: bundle.to_string(),
            roles: entity.roles.clone(),
            annotations: entity.annotations.clone(),
        })
    }

    async fn get_scope(&self, mrn: &str) -> Result<ScopeRef, BackendError> {
        let (bundle, entity) = self
            .registry
            .find_scope(mrn)
            .ok_or_else(|| BackendError::NotFound(format!("scope {mrn}")))?;
        Ok(ScopeRef {
            mrn: entity.mrn.clone(),
            bundle: bundle.to_string(),
            policy: policy_ref(&entity.policy),
            annotations: entity.annotations.clone(),
        })
    }

    async fn get_resource_group(&self, mrn: &str) -> Result<ResourceGroupRef, BackendError> {
        let (bundle, entity) = self
            .registry
            .find_resource_group(mrn)
            .ok_or_else(|| BackendError::NotFound(format!("resource group {mrn}")))?;
        Ok(ResourceGroupRef {
            mrn: entity.mrn.clone(),
            bundle: bundle.to_string(),
            policy: policy_ref(&entity.policy),
            annotations: entity.annotations.clone(),
        })
    }

    async fn get_resource(&self, mrn: &str) -> ResourceRef {
        if let Some((_, entity)) = self.registry.match_resource(mrn) {
            return ResourceRef {
                mrn: entity.mrn.clone(),
                group: entity.group.clone(),
                annotations: entity.annotations.clone(),
            };
        }

        let group = self
            .registry
            .default_resource_group()
            .map(|(_, rg)| rg.mrn.clone())
            .unwrap_or_default();
        debug!("Resource {} matched no selector - using default group {:?}", mrn, group);
        ResourceRef {
            mrn: mrn.to_string(),
            group,
            annotations: AnnotationMap::new(),
        }
    }

    async fn get_mapper(&self, bundle: Option<&str>) -> Result<MapperRef, BackendError> {
        let (bundle, entity) = self.registry.find_mapper(bundle).ok_or_else(|| {
            BackendError::NotFound(format!("mapper in bundle {bundle:?}"))
        })?;
        Ok(MapperRef {
            bundle: bundle.to_string(),
            ast: entity.ast.clone(),
        })
    }

    async fn get_policy(&self, mrn: &str) -> Result<PolicyRef, BackendError> {
        let (_, entity) = self
            .registry
            .find_policy(mrn)
            .ok_or_else(|| BackendError::NotFound(format!("policy {mrn}")))?;
        Ok(policy_ref(entity))
    }
}

/// In-memory backend answering from explicitly inserted tables. Used by
/// tests and when `mock.enabled` is set; never in production paths.
#[derive(Default)]
pub struct MockBackend {
    operations: Vec<(regex::Regex, OperationRef)>,
    roles: BTreeMap<String, RoleRef>,
    groups: BTreeMap<String, GroupRef>,
    scopes: BTreeMap<String, ScopeRef>,
    resource_groups: BTreeMap<String, ResourceGroupRef>,
    resources: BTreeMap<String, ResourceRef>,
    mappers: BTreeMap<String, MapperRef>,
    policies: BTreeMap<String, PolicyRef>,
    default_group: Option<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, selector: regex::Regex, reference: OperationRef) -> Self {
        self.operations.push((selector, reference));
        self
    }

    pub fn with_role(mut self, reference: RoleRef) -> Self {
        self.roles.insert(reference.mrn.clone(), reference);
        self
    }

    pub fn with_group(mut self, reference: GroupRef) -> Self {
        self.groups.insert(reference.mrn.clone(), reference);
        self
    }

    pub fn with_scope(mut self, reference: ScopeRef) -> Self {
        self.scopes.insert(reference.mrn.clone(), reference);
        self
    }

    pub fn with_resource_group(mut self, reference: ResourceGroupRef) -> Self {
        self.resource_groups.insert(reference.mrn.clone(), reference);
        self
    }

    pub fn with_resource(mut self, reference: ResourceRef) -> Self {
        self.resources.insert(reference.mrn.clone(), reference);
        self
    }

    pub fn with_default_group(mut self, mrn: impl Into<String>) -> Self {
        self.default_group = Some(mrn.into());
        self
    }

    pub fn with_mapper(mut self, bundle: impl Into<String>, reference: MapperRef) -> Self {
        self.mappers.insert(bundle.into(), reference);
        self
    }

    pub fn with_policy(mut self, reference: PolicyRef) -> Self {
        self.policies.insert(reference.mrn.clone(), reference);
        self
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_operation(&self, operation: &str) -> Result<OperationRef, BackendError> {
        self.operations
            .iter()
            .find(|(selector, _)| selector.is_match(operation))
            .map(|(_, reference)| reference.clone())
            .ok_or_else(|| BackendError::NotFound(format!("operation {operation}")))
    }

    async fn get_role(&self, mrn: &str) -> Result<RoleRef, BackendError> {
        self.roles
            .get(mrn)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("role {mrn}")))
    }

    async fn get_group(&self, mrn: &str) -> Result<GroupRef, BackendError> {
        self.groups
            .get(mrn)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("group {mrn}")))
    }

    async fn get_scope(&self, mrn: &str) -> Result<ScopeRef, BackendError> {
        self.scopes
            .get(mrn)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("scope {mrn}")))
    }

    async fn get_resource_group(&self, mrn: &str) -> Result<ResourceGroupRef, BackendError> {
        self.resource_groups
            .get(mrn)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("resource group {mrn}")))
    }

    async fn get_resource(&self, mrn: &str) -> ResourceRef {
        if let Some(resource) = self.resources.get(mrn) {
            return resource.clone();
        }
        ResourceRef {
            mrn: mrn.to_string(),
            group: self.default_group.clone().unwrap_or_default(),
            annotations: AnnotationMap::new(),
        }
    }

    async fn get_mapper(&self, bundle: Option<&str>) -> Result<MapperRef, BackendError> {
        match bundle {
            Some(name) => self.mappers.get(name).cloned(),
            None => self.mappers.values().next().cloned(),
        }
        .ok_or_else(|| BackendError::NotFound(format!("mapper in bundle {bundle:?}")))
    }

    async fn get_policy(&self, mrn: &str) -> Result<PolicyRef, BackendError> {
        self.policies
            .get(mrn)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("policy {mrn}")))
    }
}
