//! The PolicyEngine facade.
//!
//! Wires options, backend, stream, and the four-phase conjunction into the
//! single `authorize` entry point. One record is emitted per decision,
//! before the decision returns to the caller; probe calls suppress
//! emission while producing the same decision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendFactory, MockBackend, ResourceRef};
use crate::compiler::CompilerOptions;
use crate::config;
use crate::error::{PolicyError, ReasonCode};
use crate::record::{
    canonical_json, prune_references, sort_references, AccessRecord, BundleReference, Decision,
    DenyReason, GrantReason, Phase, RecordMetadata, RecordPrincipal,
};
use crate::annotations;
use crate::stream::{AccessLogStream, StdoutStreamFactory, StreamFactory};

mod phases;
pub mod porc;

use phases::{PhaseOutcome, SystemOutcome};
use porc::Porc;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Produce the decision without emitting an AccessRecord. Used by UI
    /// capability probes that must not pollute the audit trail.
    pub probe: bool,

    /// Abort evaluation after this long. Outstanding phase tasks are
    /// dropped; see `authorize` for the record semantics.
    pub deadline: Option<Duration>,
}

impl AuthorizeOptions {
    pub fn probe() -> Self {
        Self {
            probe: true,
            ..Self::default()
        }
    }
}

pub struct PolicyEngineBuilder {
    backend: Option<Box<dyn BackendFactory>>,
    access_log: Option<Box<dyn StreamFactory>>,
    compiler_options: Option<CompilerOptions>,
}

impl PolicyEngineBuilder {
    /// Backend factory. Omitted, the engine falls back to the in-memory
    /// mock backend, which is only meaningful in tests.
    pub fn backend(mut self, factory: impl BackendFactory + 'static) -> Self {
        self.backend = Some(Box::new(factory));
        self
    }

    /// Access-log stream factory. Omitted, records go to stdout as JSON
    /// lines.
    pub fn access_log(mut self, factory: impl StreamFactory + 'static) -> Self {
        self.access_log = Some(Box::new(factory));
        self
    }

    /// Compiler options handed to hosts that construct registries through
    /// this engine's configuration.
    pub fn compiler_options(mut self, opts: CompilerOptions) -> Self {
        self.compiler_options = Some(opts);
        self
    }

    pub fn build(self) -> PolicyEngine {
        let cfg = config::load();

        let backend = if cfg.mock.enabled {
            warn!("mock.enabled is set - answering from the mock backend");
            Arc::new(MockBackend::new()) as Arc<dyn Backend>
        } else {
            match &self.backend {
                Some(factory) => factory.new_backend(),
                None => {
                    warn!("No backend configured - using the mock backend (test only)");
                    Arc::new(MockBackend::new()) as Arc<dyn Backend>
                }
            }
        };

        let stream = match &self.access_log {
            Some(factory) => factory.new_stream(),
            None => StdoutStreamFactory.new_stream(),
        };

        let compiler_options = self
            .compiler_options
            .unwrap_or_else(|| CompilerOptions::from_config(&cfg));

        let env = config::resolve_audit_env(&cfg);
        info!(
            "PolicyEngine ready (includeall={}, {} audit env entries)",
            cfg.bundles.includeall,
            env.len()
        );

        PolicyEngine {
            backend,
            stream,
            compiler_options,
            env,
            include_all: cfg.bundles.includeall,
        }
    }
}

/// The Policy Decision Point.
pub struct PolicyEngine {
    backend: Arc<dyn Backend>,
    stream: Arc<dyn AccessLogStream>,
    compiler_options: CompilerOptions,
    env: BTreeMap<String, String>,
    include_all: bool,
}

impl PolicyEngine {
    pub fn builder() -> PolicyEngineBuilder {
        PolicyEngineBuilder {
            backend: None,
            access_log: None,
            compiler_options: None,
        }
    }

    /// The backend, for auxiliary calls (mapper lookup, preflight
    /// inspection).
    pub fn get_backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn compiler_options(&self) -> &CompilerOptions {
        &self.compiler_options
    }

    pub async fn close(&self) {
        self.stream.close().await;
    }

    /// Evaluate one PORC request.
    ///
    /// Returns `Ok(decision)` for a completed evaluation; the AccessRecord
    /// carries the per-phase reason codes. Returns `Err` only for
    /// infrastructural failures: a malformed request (nothing is emitted)
    /// or a deadline hit (no emission if the system phase never completed;
    /// otherwise a DENY record with one EVALUATION_ERROR reference per
    /// unfinished phase is emitted first).
    #[instrument(
        name = "authorize",
        skip(self, porc_json, opts),
        fields(
            record_id = tracing::field::Empty,
            operation = tracing::field::Empty,
            decision = tracing::field::Empty,
        )
    )]
    pub async fn authorize(
        &self,
        porc_json: &str,
        opts: AuthorizeOptions,
    ) -> Result<bool, PolicyError> {
        let porc = Porc::parse(porc_json)?;
        let raw_input = porc.to_value();
        let record_id = Uuid::now_v7().to_string();

        let span = tracing::Span::current();
        span.record("record_id", record_id.as_str());
        span.record("operation", porc.operation.as_str());

        let deadline = opts.deadline.map(|d| tokio::time::Instant::now() + d);

        // Phase 1 must finish first: its tri-state may short-circuit, and
        // the operation lookup precedes enrichment. A deadline hit here
        // emits nothing.
        let system = match deadline {
            Some(at) => tokio::time::timeout_at(at, phases::system_phase(
                &self.backend,
                &porc.operation,
                &raw_input,
            ))
            .await
            .map_err(|_| PolicyError::Cancelled)?,
            None => phases::system_phase(&self.backend, &porc.operation, &raw_input).await,
        };

        let system_reference = match system {
            SystemOutcome::Grant { reason, reference } => {
                let record = self.assemble(
                    &porc,
                    &raw_input,
                    record_id,
                    Decision::Grant,
                    vec![reference],
                    true,
                    Some(reason),
                    None,
                );
                self.emit(&record, opts.probe).await;
                span.record("decision", "GRANT");
                return Ok(true);
            }
            SystemOutcome::Deny { reason, reference } => {
                let record = self.assemble(
                    &porc,
                    &raw_input,
                    record_id,
                    Decision::Deny,
                    vec![reference],
                    true,
                    None,
                    Some(reason),
                );
                self.emit(&record, opts.probe).await;
                span.record("decision", "DENY");
                return Ok(false);
            }
            SystemOutcome::Fail { reference } => {
                let record = self.assemble(
                    &porc,
                    &raw_input,
                    record_id,
                    Decision::Deny,
                    vec![reference],
                    false,
                    None,
                    Some(DenyReason::Unspecified),
                );
                self.emit(&record, opts.probe).await;
                span.record("decision", "DENY");
                return Ok(false);
            }
            SystemOutcome::Continue { reference } => reference,
        };

        // Enrichment and the parallel phases share the remaining deadline.
        let evaluation = self.evaluate_phases(&porc);
        let outcome = match deadline {
            Some(at) => tokio::time::timeout_at(at, evaluation).await,
            None => Ok(evaluation.await),
        };

        match outcome {
            Ok((identity, resource, scope)) => {
                let granted = identity.granted && resource.granted && scope.granted;
                let decision = if granted { Decision::Grant } else { Decision::Deny };

                let mut references = vec![system_reference];
                references.extend(identity.references);
                references.extend(resource.references);
                references.extend(scope.references);

                let record = self.assemble(
                    &porc,
                    &raw_input,
                    record_id,
                    decision,
                    references,
                    false,
                    granted.then_some(GrantReason::Policy),
                    (!granted).then_some(DenyReason::Policy),
                );
                self.emit(&record, opts.probe).await;
                span.record("decision", if granted { "GRANT" } else { "DENY" });
                debug!("Authorization complete: {:?}", decision);
                Ok(granted)
            }
            Err(_) => {
                // Outstanding phase tasks were dropped with the join
                // future. Record the cancellation for each unfinished
                // phase.
                let mut references = vec![system_reference];
                for phase in [Phase::Identity, Phase::Resource, Phase::Scope] {
                    references.push(BundleReference {
                        id: "cancelled".to_string(),
                        phase,
                        policies: vec![],
                        decision: Decision::Deny,
                        reason_code: ReasonCode::EvaluationError,
                        reason: "context cancelled".to_string(),
                        duration_ns: 0,
                    });
                }
                let record = self.assemble(
                    &porc,
                    &raw_input,
                    record_id,
                    Decision::Deny,
                    references,
                    false,
                    None,
                    Some(DenyReason::Unspecified),
                );
                self.emit(&record, opts.probe).await;
                span.record("decision", "DENY");
                Err(PolicyError::Cancelled)
            }
        }
    }

    /// Enrich the input, then run phases 2-4 in parallel.
    async fn evaluate_phases(&self, porc: &Porc) -> (PhaseOutcome, PhaseOutcome, PhaseOutcome) {
        let mroles = porc.mroles();
        let mgroups = porc.mgroups();
        let scopes = porc.scopes();

        let resource = self.resolve_resource(porc).await;
        let merged = annotations::gather_annotations(
            &self.backend,
            &porc.annotations(),
            &scopes,
            &mgroups,
            &mroles,
        )
        .await;
        let input = porc::enriched_input(porc, merged, &resource);

        tokio::join!(
            phases::identity_phase(&self.backend, &mroles, &mgroups, &input),
            phases::resource_phase(&self.backend, &resource, &input),
            phases::scope_phase(&self.backend, &scopes, &input),
        )
    }

    /// Resolve the request resource: a string MRN goes through the
    /// backend; an object is used directly, with its group defaulted when
    /// absent.
    async fn resolve_resource(&self, porc: &Porc) -> ResourceRef {
        match &porc.resource {
            Value::String(mrn) => self.backend.get_resource(mrn).await,
            Value::Object(obj) => {
                let mrn = obj
                    .get("id")
                    .or_else(|| obj.get("mrn"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let annotations = obj
                    .get("annotations")
                    .and_then(Value::as_object)
                    .map(annotations::from_plain)
                    .unwrap_or_default();
                match obj.get("group").and_then(Value::as_str) {
                    Some(group) => ResourceRef {
                        mrn,
                        group: group.to_string(),
                        annotations,
                    },
                    None => {
                        // group resolution still applies to inline objects
                        let synthesized = self.backend.get_resource(&mrn).await;
                        ResourceRef {
                            mrn,
                            group: synthesized.group,
                            annotations,
                        }
                    }
                }
            }
            _ => self.backend.get_resource("").await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        porc: &Porc,
        raw_input: &Value,
        record_id: String,
        decision: Decision,
        mut references: Vec<BundleReference>,
        system_override: bool,
        grant_reason: Option<GrantReason>,
        deny_reason: Option<DenyReason>,
    ) -> AccessRecord {
        sort_references(&mut references);
        if !self.include_all {
            references = prune_references(references, decision);
        }

        let resource = match &porc.resource {
            Value::String(mrn) => mrn.clone(),
            other => canonical_json(other),
        };

        AccessRecord {
            metadata: RecordMetadata {
                id: record_id,
                timestamp: chrono::Utc::now().to_rfc3339(),
                env: self.env.clone(),
            },
            principal: RecordPrincipal {
                subject: porc.subject().to_string(),
                realm: porc.realm().to_string(),
            },
            operation: porc.operation.clone(),
            resource,
            decision,
            references,
            porc: canonical_json(raw_input),
            system_override,
            grant_reason,
            deny_reason,
        }
    }

    /// Audit-before-act: called before the decision is returned. Stream
    /// failures are logged and dropped.
    async fn emit(&self, record: &AccessRecord, probe: bool) {
        if probe {
            debug!("Probe call - record {} suppressed", record.metadata.id);
            return;
        }
        if let Err(e) = self.stream.send(record).await {
            warn!("Access log send failed for {}: {}", record.metadata.id, e);
        }
    }
}
