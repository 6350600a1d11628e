//! The policy-domain registry.
//!
//! Loads one or more bundles, indexes every entity by MRN, validates all
//! intra- and inter-bundle references in a single accumulating pass,
//! rejects dependency cycles, and compiles each policy and mapper with its
//! transitive library closure. After construction the registry is
//! immutable; hosts replace the whole `Arc<Registry>` to swap bundles.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use crate::annotations::AnnotationMap;
use crate::bundle::{BundleDoc, BundleKind, PolicyDef};
use crate::compiler::{
    CompiledPolicy, CompilerOptions, CompilerOverrides, Fingerprint, PolicyCompiler,
};
use crate::mrn::EntityKey;

pub mod validate;

pub use validate::{ValidationError, ValidationErrors, ValidationKind, ValidationSummary};

/// A compiled policy or policy library.
#[derive(Debug, Clone)]
pub struct PolicyEntity {
    pub mrn: String,
    pub bundle: String,
    pub dependencies: Vec<String>,
    pub source: String,
    pub fingerprint: Fingerprint,
    pub ast: Arc<CompiledPolicy>,
}

#[derive(Debug, Clone)]
pub struct RoleEntity {
    pub mrn: String,
    pub policy: Arc<PolicyEntity>,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct GroupEntity {
    pub mrn: String,
    pub roles: Vec<String>,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct ResourceGroupEntity {
    pub mrn: String,
    pub policy: Arc<PolicyEntity>,
    pub annotations: AnnotationMap,
    pub default: bool,
}

#[derive(Debug, Clone)]
pub struct ResourceEntity {
    pub mrn: String,
    pub selectors: Vec<Regex>,
    pub group: String,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct ScopeEntity {
    pub mrn: String,
    pub policy: Arc<PolicyEntity>,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Clone)]
pub struct OperationEntity {
    pub mrn: Option<String>,
    pub selectors: Vec<Regex>,
    pub policy: Arc<PolicyEntity>,
}

#[derive(Debug, Clone)]
pub struct MapperEntity {
    pub selectors: Vec<Regex>,
    pub source: String,
    pub ast: Arc<CompiledPolicy>,
}

#[derive(Debug)]
struct BundleEntry {
    name: String,
    policies: BTreeMap<String, Arc<PolicyEntity>>,
    libraries: BTreeMap<String, Arc<PolicyEntity>>,
    roles: BTreeMap<String, Arc<RoleEntity>>,
    groups: BTreeMap<String, Arc<GroupEntity>>,
    resource_groups: BTreeMap<String, Arc<ResourceGroupEntity>>,
    resources: Vec<Arc<ResourceEntity>>,
    scopes: BTreeMap<String, Arc<ScopeEntity>>,
    operations: Vec<Arc<OperationEntity>>,
    mappers: Vec<Arc<MapperEntity>>,
    default_resource_group: Option<String>,
}

/// Immutable registry over one or more loaded bundles.
///
/// Bundles are consulted in load order; the first-listed bundle wins name
/// collisions.
#[derive(Debug)]
pub struct Registry {
    bundles: Vec<BundleEntry>,
}

impl Registry {
    /// Load and validate bundle files. Every validation error across all
    /// bundles is accumulated; any error rejects the whole set.
    pub async fn load(
        paths: &[impl AsRef<Path>],
        compiler_opts: CompilerOptions,
    ) -> Result<Self, ValidationErrors> {
        let mut docs = Vec::new();
        let mut errors = Vec::new();

        for path in paths {
            let path = path.as_ref();
            match tokio::fs::read_to_string(path).await {
                Ok(content) => match serde_yaml_ng::from_str::<BundleDoc>(&content) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => errors.push(ValidationError {
                        kind: ValidationKind::Reference,
                        domain: path.display().to_string(),
                        entity: path.display().to_string(),
                        message: format!("failed to parse bundle: {e}"),
                    }),
                },
                Err(e) => errors.push(ValidationError {
                    kind: ValidationKind::Reference,
                    domain: path.display().to_string(),
                    entity: path.display().to_string(),
                    message: format!("failed to read bundle: {e}"),
                }),
            }
        }

        if !errors.is_empty() {
            return Err(ValidationErrors::new(errors));
        }
        Self::from_documents(docs, compiler_opts)
    }

    /// Build a registry from already-parsed bundle documents.
    pub fn from_documents(
        docs: Vec<BundleDoc>,
        compiler_opts: CompilerOptions,
    ) -> Result<Self, ValidationErrors> {
        Builder::new(docs, compiler_opts).build()
    }

    pub fn bundle_names(&self) -> Vec<&str> {
        self.bundles.iter().map(|b| b.name.as_str()).collect()
    }

    fn bundle(&self, name: &str) -> Option<&BundleEntry> {
        self.bundles.iter().find(|b| b.name == name)
    }

    fn find_in_class<'a, T>(
        &'a self,
        mrn: &str,
        class: impl Fn(&'a BundleEntry) -> &'a BTreeMap<String, Arc<T>>,
    ) -> Option<(&'a str, &'a Arc<T>)> {
        if EntityKey::is_qualified(mrn) {
            let key = EntityKey::parse(mrn, "");
            let bundle = self.bundle(&key.bundle)?;
            return class(bundle).get(&key.id).map(|e| (bundle.name.as_str(), e));
        }
        for bundle in &self.bundles {
            if let Some(entity) = class(bundle).get(mrn) {
                return Some((bundle.name.as_str(), entity));
            }
        }
        None
    }

    /// Policies first, then libraries; both are compiled units.
    pub(crate) fn find_policy(&self, mrn: &str) -> Option<(&str, &Arc<PolicyEntity>)> {
        self.find_in_class(mrn, |b| &b.policies)
            .or_else(|| self.find_in_class(mrn, |b| &b.libraries))
    }

    pub(crate) fn find_role(&self, mrn: &str) -> Option<(&str, &Arc<RoleEntity>)> {
        self.find_in_class(mrn, |b| &b.roles)
    }

    pub(crate) fn find_group(&self, mrn: &str) -> Option<(&str, &Arc<GroupEntity>)> {
        self.find_in_class(mrn, |b| &b.groups)
    }

    pub(crate) fn find_scope(&self, mrn: &str) -> Option<(&str, &Arc<ScopeEntity>)> {
        self.find_in_class(mrn, |b| &b.scopes)
    }

    pub(crate) fn find_resource_group(
        &self,
        mrn: &str,
    ) -> Option<(&str, &Arc<ResourceGroupEntity>)> {
        self.find_in_class(mrn, |b| &b.resource_groups)
    }

    /// First bundle whose first matching operation selector matches, in
    /// load order.
    pub(crate) fn match_operation(&self, operation: &str) -> Option<(&str, &Arc<OperationEntity>)> {
        for bundle in &self.bundles {
            for op in &bundle.operations {
                if op.selectors.iter().any(|s| s.is_match(operation)) {
                    return Some((bundle.name.as_str(), op));
                }
            }
        }
        None
    }

    /// First resource selector match in bundle load order.
    pub(crate) fn match_resource(&self, mrn: &str) -> Option<(&str, &Arc<ResourceEntity>)> {
        for bundle in &self.bundles {
            for resource in &bundle.resources {
                if resource.selectors.iter().any(|s| s.is_match(mrn)) {
                    return Some((bundle.name.as_str(), resource));
                }
            }
        }
        None
    }

    /// The default resource group: bundles are consulted in load order.
    pub(crate) fn default_resource_group(&self) -> Option<(&str, &Arc<ResourceGroupEntity>)> {
        for bundle in &self.bundles {
            if let Some(mrn) = &bundle.default_resource_group {
                if let Some(rg) = bundle.resource_groups.get(mrn) {
                    return Some((bundle.name.as_str(), rg));
                }
            }
        }
        None
    }

    pub(crate) fn find_mapper(&self, bundle: Option<&str>) -> Option<(&str, &Arc<MapperEntity>)> {
        match bundle {
            Some(name) => {
                let bundle = self.bundle(name)?;
                bundle.mappers.first().map(|m| (bundle.name.as_str(), m))
            }
            None => self
                .bundles
                .iter()
                .find_map(|b| b.mappers.first().map(|m| (b.name.as_str(), m))),
        }
    }
}

/// Registry construction: validate everything, compile everything, then
/// freeze.
struct Builder {
    docs: Vec<BundleDoc>,
    errors: Vec<ValidationError>,
    policy_compiler: PolicyCompiler,
    mapper_compiler: PolicyCompiler,
}

impl Builder {
    fn new(docs: Vec<BundleDoc>, compiler_opts: CompilerOptions) -> Self {
        let policy_compiler = PolicyCompiler::new(compiler_opts);
        // mappers get the full builtin set
        let mapper_compiler = policy_compiler.clone_with(CompilerOverrides {
            unsafe_builtins: Some(vec![]),
            ..Default::default()
        });
        Self {
            docs,
            errors: Vec::new(),
            policy_compiler,
            mapper_compiler,
        }
    }

    fn error(&mut self, kind: ValidationKind, domain: &str, entity: &str, message: String) {
        self.errors.push(ValidationError {
            kind,
            domain: domain.to_string(),
            entity: entity.to_string(),
            message,
        });
    }

    fn build(mut self) -> Result<Registry, ValidationErrors> {
        self.check_bundle_shape();
        self.check_duplicates();
        self.check_references();
        self.check_selectors();
        self.check_cycles();

        let compiled = self.compile_pass();

        if !self.errors.is_empty() {
            return Err(ValidationErrors::new(self.errors));
        }

        let registry = self.assemble(compiled);
        info!(
            "Registry loaded: {} bundles ({})",
            registry.bundles.len(),
            registry.bundle_names().join(", ")
        );
        Ok(registry)
    }

    fn check_bundle_shape(&mut self) {
        let mut seen = BTreeSet::new();
        let shapes: Vec<(String, BundleKind)> = self
            .docs
            .iter()
            .map(|d| (d.metadata.name.clone(), d.kind))
            .collect();
        for (name, kind) in shapes {
            if kind == BundleKind::PolicyDomainReference {
                self.error(
                    ValidationKind::Reference,
                    &name,
                    &name,
                    "reference bundles must be resolved by the build tool before loading".into(),
                );
            }
            if !seen.insert(name.clone()) {
                self.error(
                    ValidationKind::Reference,
                    &name,
                    &name,
                    "duplicate bundle name".into(),
                );
            }
        }
    }

    fn check_duplicates(&mut self) {
        let mut duplicates = Vec::new();
        for doc in &self.docs {
            let name = &doc.metadata.name;
            let classes: [(&str, Vec<&str>); 7] = [
                ("policy", doc.spec.policies.iter().map(|p| p.mrn.as_str()).collect()),
                (
                    "policy-library",
                    doc.spec.policy_libraries.iter().map(|p| p.mrn.as_str()).collect(),
                ),
                ("role", doc.spec.roles.iter().map(|r| r.mrn.as_str()).collect()),
                ("group", doc.spec.groups.iter().map(|g| g.mrn.as_str()).collect()),
                (
                    "resource-group",
                    doc.spec.resource_groups.iter().map(|g| g.mrn.as_str()).collect(),
                ),
                (
                    "resource",
                    doc.spec.resources.iter().map(|r| r.mrn.as_str()).collect(),
                ),
                ("scope", doc.spec.scopes.iter().map(|s| s.mrn.as_str()).collect()),
            ];
            for (class, mrns) in classes {
                let mut seen = BTreeSet::new();
                for mrn in mrns {
                    if !seen.insert(mrn) {
                        duplicates.push((name.clone(), mrn.to_string(), class));
                    }
                }
            }
        }
        for (domain, mrn, class) in duplicates {
            self.error(
                ValidationKind::Reference,
                &domain,
                &mrn,
                format!("duplicate {class} MRN"),
            );
        }
    }

    fn find_policy_def(&self, key: &EntityKey) -> Option<&PolicyDef> {
        self.docs
            .iter()
            .find(|d| d.metadata.name == key.bundle)?
            .spec
            .policies
            .iter()
            .find(|p| p.mrn == key.id)
    }

    fn find_library_def(&self, key: &EntityKey) -> Option<&PolicyDef> {
        self.docs
            .iter()
            .find(|d| d.metadata.name == key.bundle)?
            .spec
            .policy_libraries
            .iter()
            .find(|p| p.mrn == key.id)
    }

    fn find_role_def(&self, key: &EntityKey) -> bool {
        self.docs
            .iter()
            .find(|d| d.metadata.name == key.bundle)
            .map(|d| d.spec.roles.iter().any(|r| r.mrn == key.id))
            .unwrap_or(false)
    }

    fn check_references(&mut self) {
        let mut pending = Vec::new();
        for doc in &self.docs {
            let home = &doc.metadata.name;

            for policy in doc.spec.policies.iter().chain(&doc.spec.policy_libraries) {
                for dep in &policy.dependencies {
                    let key = EntityKey::parse(dep, home);
                    if self.find_library_def(&key).is_none() {
                        pending.push((
                            home.clone(),
                            policy.mrn.clone(),
                            format!("unknown policy library {key}"),
                        ));
                    }
                }
            }

            for role in &doc.spec.roles {
                let key = EntityKey::parse(&role.policy, home);
                if self.find_policy_def(&key).is_none() {
                    pending.push((
                        home.clone(),
                        role.mrn.clone(),
                        format!("unknown policy {key}"),
                    ));
                }
            }

            for group in &doc.spec.groups {
                for role in &group.roles {
                    let key = EntityKey::parse(role, home);
                    if !self.find_role_def(&key) {
                        pending.push((
                            home.clone(),
                            group.mrn.clone(),
                            format!("unknown role {key}"),
                        ));
                    }
                }
            }

            for rg in &doc.spec.resource_groups {
                let key = EntityKey::parse(&rg.policy, home);
                if self.find_policy_def(&key).is_none() {
                    pending.push((home.clone(), rg.mrn.clone(), format!("unknown policy {key}")));
                }
            }

            for resource in &doc.spec.resources {
                let key = EntityKey::parse(&resource.group, home);
                let known = self
                    .docs
                    .iter()
                    .find(|d| d.metadata.name == key.bundle)
                    .map(|d| d.spec.resource_groups.iter().any(|g| g.mrn == key.id))
                    .unwrap_or(false);
                if !known {
                    pending.push((
                        home.clone(),
                        resource.mrn.clone(),
                        format!("unknown resource group {key}"),
                    ));
                }
            }

            for scope in &doc.spec.scopes {
                let key = EntityKey::parse(&scope.policy, home);
                if self.find_policy_def(&key).is_none() {
                    pending.push((
                        home.clone(),
                        scope.mrn.clone(),
                        format!("unknown policy {key}"),
                    ));
                }
            }

            for (idx, op) in doc.spec.operations.iter().enumerate() {
                let key = EntityKey::parse(&op.policy, home);
                if self.find_policy_def(&key).is_none() {
                    let entity = op
                        .mrn
                        .clone()
                        .unwrap_or_else(|| format!("operations[{idx}]"));
                    pending.push((home.clone(), entity, format!("unknown policy {key}")));
                }
            }

            // exactly one default resource group per bundle (when any are
            // declared)
            if !doc.spec.resource_groups.is_empty() {
                let defaults = doc.spec.resource_groups.iter().filter(|g| g.default).count();
                if defaults != 1 {
                    pending.push((
                        home.clone(),
                        home.clone(),
                        format!("expected exactly one default resource group, found {defaults}"),
                    ));
                }
            }
        }

        for (domain, entity, message) in pending {
            self.error(ValidationKind::Reference, &domain, &entity, message);
        }
    }

    fn check_selectors(&mut self) {
        let mut pending = Vec::new();
        for doc in &self.docs {
            let home = &doc.metadata.name;
            for resource in &doc.spec.resources {
                for selector in &resource.selectors {
                    if let Err(e) = Regex::new(selector) {
                        pending.push((home.clone(), resource.mrn.clone(), selector.clone(), e));
                    }
                }
            }
            for (idx, op) in doc.spec.operations.iter().enumerate() {
                let entity = op.mrn.clone().unwrap_or_else(|| format!("operations[{idx}]"));
                for selector in &op.selectors {
                    if let Err(e) = Regex::new(selector) {
                        pending.push((home.clone(), entity.clone(), selector.clone(), e));
                    }
                }
            }
            for (idx, mapper) in doc.spec.mappers.iter().enumerate() {
                for selector in &mapper.selectors {
                    if let Err(e) = Regex::new(selector) {
                        pending.push((
                            home.clone(),
                            format!("mappers[{idx}]"),
                            selector.clone(),
                            e,
                        ));
                    }
                }
            }
        }
        for (domain, entity, selector, e) in pending {
            self.error(
                ValidationKind::Reference,
                &domain,
                &entity,
                format!("selector {selector:?} does not compile: {e}"),
            );
        }
    }

    fn check_cycles(&mut self) {
        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for doc in &self.docs {
            let home = &doc.metadata.name;
            for lib in &doc.spec.policy_libraries {
                let node = EntityKey::new(home.clone(), lib.mrn.clone()).to_string();
                let edges = lib
                    .dependencies
                    .iter()
                    .map(|dep| EntityKey::parse(dep, home).to_string())
                    .collect();
                graph.insert(node, edges);
            }
        }

        for cycle in validate::detect_cycles(&graph) {
            let entity = cycle.first().cloned().unwrap_or_default();
            let path = cycle.join(" -> ");
            let domain = entity.split('/').next().unwrap_or_default().to_string();
            self.error(
                ValidationKind::Cycle,
                &domain,
                &entity,
                format!("policy library dependency cycle: {path}"),
            );
        }
    }

    /// Transitive library closure of a unit, cycle-safe via the visited
    /// set. Returns `(qualified mrn, source)` pairs.
    fn library_closure(&self, home: &str, dependencies: &[String]) -> Vec<(String, String)> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<EntityKey> = dependencies
            .iter()
            .map(|d| EntityKey::parse(d, home))
            .collect();
        let mut closure = Vec::new();

        while let Some(key) = queue.pop() {
            let qualified = key.to_string();
            if !visited.insert(qualified.clone()) {
                continue;
            }
            if let Some(lib) = self.find_library_def(&key) {
                closure.push((qualified, lib.rego.clone()));
                for dep in &lib.dependencies {
                    queue.push(EntityKey::parse(dep, &key.bundle));
                }
            }
        }

        closure.sort_by(|a, b| a.0.cmp(&b.0));
        closure
    }

    fn compile_unit(
        &self,
        compiler: &PolicyCompiler,
        bundle: &str,
        def: &PolicyDef,
    ) -> Result<Arc<PolicyEntity>, crate::compiler::CompileError> {
        let qualified = EntityKey::new(bundle, def.mrn.clone()).to_string();
        let closure = self.library_closure(bundle, &def.dependencies);

        let mut modules: BTreeMap<String, String> = closure.iter().cloned().collect();
        modules.insert(qualified.clone(), def.rego.clone());

        let fingerprint = Fingerprint::compute(&def.mrn, &def.rego, &closure);
        let ast = compiler.compile(&qualified, &modules)?;

        debug!("Compiled {} ({})", qualified, fingerprint);
        Ok(Arc::new(PolicyEntity {
            mrn: def.mrn.clone(),
            bundle: bundle.to_string(),
            dependencies: def.dependencies.clone(),
            source: def.rego.clone(),
            fingerprint,
            ast: Arc::new(ast),
        }))
    }

    /// Compile every policy, library, and mapper, sorted by MRN within each
    /// bundle so diagnostics and fingerprint work are reproducible.
    #[allow(clippy::type_complexity)]
    fn compile_pass(
        &mut self,
    ) -> (
        BTreeMap<EntityKey, Arc<PolicyEntity>>,
        BTreeMap<EntityKey, Arc<PolicyEntity>>,
        BTreeMap<String, Vec<Arc<MapperEntity>>>,
    ) {
        let mut policies = BTreeMap::new();
        let mut libraries = BTreeMap::new();
        let mut mappers: BTreeMap<String, Vec<Arc<MapperEntity>>> = BTreeMap::new();
        let mut pending_errors = Vec::new();

        for doc in &self.docs {
            let home = doc.metadata.name.clone();

            let mut sorted_policies: Vec<&PolicyDef> = doc.spec.policies.iter().collect();
            sorted_policies.sort_by(|a, b| a.mrn.cmp(&b.mrn));
            for def in sorted_policies {
                match self.compile_unit(&self.policy_compiler, &home, def) {
                    Ok(entity) => {
                        policies.insert(EntityKey::new(home.clone(), def.mrn.clone()), entity);
                    }
                    Err(e) => pending_errors.push((home.clone(), def.mrn.clone(), e.to_string())),
                }
            }

            let mut sorted_libs: Vec<&PolicyDef> = doc.spec.policy_libraries.iter().collect();
            sorted_libs.sort_by(|a, b| a.mrn.cmp(&b.mrn));
            for def in sorted_libs {
                match self.compile_unit(&self.policy_compiler, &home, def) {
                    Ok(entity) => {
                        libraries.insert(EntityKey::new(home.clone(), def.mrn.clone()), entity);
                    }
                    Err(e) => pending_errors.push((home.clone(), def.mrn.clone(), e.to_string())),
                }
            }

            for (idx, def) in doc.spec.mappers.iter().enumerate() {
                let id = format!("{home}/mappers[{idx}]");
                let modules: BTreeMap<String, String> =
                    [(id.clone(), def.rego.clone())].into();
                match self.mapper_compiler.compile(&id, &modules) {
                    Ok(ast) => {
                        let selectors = def
                            .selectors
                            .iter()
                            .filter_map(|s| Regex::new(s).ok())
                            .collect();
                        mappers.entry(home.clone()).or_default().push(Arc::new(
                            MapperEntity {
                                selectors,
                                source: def.rego.clone(),
                                ast: Arc::new(ast),
                            },
                        ));
                    }
                    Err(e) => pending_errors.push((home.clone(), id, e.to_string())),
                }
            }
        }

        for (domain, entity, message) in pending_errors {
            self.error(ValidationKind::Rego, &domain, &entity, message);
        }

        (policies, libraries, mappers)
    }

    /// Resolution cannot fail here: every reference was validated and every
    /// unit compiled before assembly runs.
    fn assemble(
        self,
        compiled: (
            BTreeMap<EntityKey, Arc<PolicyEntity>>,
            BTreeMap<EntityKey, Arc<PolicyEntity>>,
            BTreeMap<String, Vec<Arc<MapperEntity>>>,
        ),
    ) -> Registry {
        let (policies, libraries, mut mappers) = compiled;
        let mut bundles = Vec::new();

        for doc in &self.docs {
            let home = &doc.metadata.name;
            let policy = |reference: &str| -> Arc<PolicyEntity> {
                let key = EntityKey::parse(reference, home);
                policies[&key].clone()
            };

            let roles: BTreeMap<String, Arc<RoleEntity>> = doc
                .spec
                .roles
                .iter()
                .map(|def| {
                    (
                        def.mrn.clone(),
                        Arc::new(RoleEntity {
                            mrn: def.mrn.clone(),
                            policy: policy(&def.policy),
                            annotations: def.annotations.clone(),
                        }),
                    )
                })
                .collect();

            let groups: BTreeMap<String, Arc<GroupEntity>> = doc
                .spec
                .groups
                .iter()
                .map(|def| {
                    (
                        def.mrn.clone(),
                        Arc::new(GroupEntity {
                            mrn: def.mrn.clone(),
                            roles: def.roles.clone(),
                            annotations: def.annotations.clone(),
                        }),
                    )
                })
                .collect();

            let resource_groups: BTreeMap<String, Arc<ResourceGroupEntity>> = doc
                .spec
                .resource_groups
                .iter()
                .map(|def| {
                    (
                        def.mrn.clone(),
                        Arc::new(ResourceGroupEntity {
                            mrn: def.mrn.clone(),
                            policy: policy(&def.policy),
                            annotations: def.annotations.clone(),
                            default: def.default,
                        }),
                    )
                })
                .collect();

            let default_resource_group = doc
                .spec
                .resource_groups
                .iter()
                .find(|g| g.default)
                .map(|g| g.mrn.clone());

            let resources: Vec<Arc<ResourceEntity>> = doc
                .spec
                .resources
                .iter()
                .map(|def| {
                    Arc::new(ResourceEntity {
                        mrn: def.mrn.clone(),
                        selectors: def
                            .selectors
                            .iter()
                            .filter_map(|s| Regex::new(s).ok())
                            .collect(),
                        group: def.group.clone(),
                        annotations: def.annotations.clone(),
                    })
                })
                .collect();

            let scopes: BTreeMap<String, Arc<ScopeEntity>> = doc
                .spec
                .scopes
                .iter()
                .map(|def| {
                    (
                        def.mrn.clone(),
                        Arc::new(ScopeEntity {
                            mrn: def.mrn.clone(),
                            policy: policy(&def.policy),
                            annotations: def.annotations.clone(),
                        }),
                    )
                })
                .collect();

            let operations: Vec<Arc<OperationEntity>> = doc
                .spec
                .operations
                .iter()
                .map(|def| {
                    Arc::new(OperationEntity {
                        mrn: def.mrn.clone(),
                        selectors: def
                            .selectors
                            .iter()
                            .filter_map(|s| Regex::new(s).ok())
                            .collect(),
                        policy: policy(&def.policy),
                    })
                })
                .collect();

            let bundle_policies: BTreeMap<String, Arc<PolicyEntity>> = policies
                .iter()
                .filter(|(key, _)| key.bundle == *home)
                .map(|(key, entity)| (key.id.clone(), entity.clone()))
                .collect();
            let bundle_libraries: BTreeMap<String, Arc<PolicyEntity>> = libraries
                .iter()
                .filter(|(key, _)| key.bundle == *home)
                .map(|(key, entity)| (key.id.clone(), entity.clone()))
                .collect();

            bundles.push(BundleEntry {
                name: home.clone(),
                policies: bundle_policies,
                libraries: bundle_libraries,
                roles,
                groups,
                resource_groups,
                resources,
                scopes,
                operations,
                mappers: mappers.remove(home).unwrap_or_default(),
                default_resource_group,
            });
        }

        Registry { bundles }
    }
}
