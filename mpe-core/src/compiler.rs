//! Policy compilation over the embedded Rego interpreter.
//!
//! A compiled unit holds every module of a policy's dependency closure in
//! one prepared engine, so the entry module may import its libraries by
//! package. Evaluation clones the prepared engine; compiled units are
//! immutable and shared freely across tasks.

use std::collections::BTreeMap;

use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::error::PolicyError;

/// Rule evaluated for policy decisions.
pub const POLICY_ENTRYPOINT: &str = "data.authz.allow";
/// Rule evaluated for mapper transforms.
pub const MAPPER_ENTRYPOINT: &str = "data.mapper.porc";

pub const DEFAULT_UNSAFE_BUILTINS: &[&str] = &["http.send"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegoVersion {
    #[default]
    V0,
    V1,
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub rego_version: RegoVersion,

    /// Builtins removed from the capability set. Policies invoking any of
    /// these fail compilation; mappers are compiled with the list cleared.
    pub unsafe_builtins: Vec<String>,

    /// Gather `print()` output during evaluation.
    pub default_tracing: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            rego_version: RegoVersion::V0,
            unsafe_builtins: DEFAULT_UNSAFE_BUILTINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_tracing: false,
        }
    }
}

impl CompilerOptions {
    /// Options seeded from the process configuration.
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            unsafe_builtins: cfg.opa.unsafebuiltins.clone(),
            ..Self::default()
        }
    }
}

/// Overrides applied by [`PolicyCompiler::clone_with`].
#[derive(Debug, Clone, Default)]
pub struct CompilerOverrides {
    pub unsafe_builtins: Option<Vec<String>>,
    pub default_tracing: Option<bool>,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("policy {id}: module {module}: {message}")]
    Parse {
        id: String,
        module: String,
        message: String,
    },

    #[error("policy {id}: module {module} uses disallowed builtin {builtin}")]
    DisallowedBuiltin {
        id: String,
        module: String,
        builtin: String,
    },

    #[error("invalid unsafe-builtin pattern {builtin}: {message}")]
    InvalidCapability { builtin: String, message: String },
}

/// Compiles policy modules into executable units.
#[derive(Debug, Clone)]
pub struct PolicyCompiler {
    opts: CompilerOptions,
}

impl PolicyCompiler {
    pub fn new(opts: CompilerOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.opts
    }

    /// A compiler inheriting this configuration with capability overrides.
    /// The registry uses this to hand mappers the full builtin set.
    pub fn clone_with(&self, overrides: CompilerOverrides) -> Self {
        let mut opts = self.opts.clone();
        if let Some(unsafe_builtins) = overrides.unsafe_builtins {
            opts.unsafe_builtins = unsafe_builtins;
        }
        if let Some(tracing) = overrides.default_tracing {
            opts.default_tracing = tracing;
        }
        Self { opts }
    }

    /// Compile the modules of one unit. Keys are module identifiers (MRNs);
    /// values are Rego source.
    pub fn compile(
        &self,
        id: &str,
        modules: &BTreeMap<String, String>,
    ) -> Result<CompiledPolicy, CompileError> {
        for (module, source) in modules {
            self.check_capabilities(id, module, source)?;
        }

        let mut engine = regorus::Engine::new();
        engine.set_rego_v0(matches!(self.opts.rego_version, RegoVersion::V0));
        engine.set_strict_builtin_errors(false);
        engine.set_gather_prints(self.opts.default_tracing);

        for (module, source) in modules {
            engine
                .add_policy(module.clone(), source.clone())
                .map_err(|e| CompileError::Parse {
                    id: id.to_string(),
                    module: module.clone(),
                    message: e.to_string(),
                })?;
        }

        debug!("Compiled {} ({} modules)", id, modules.len());
        Ok(CompiledPolicy { engine })
    }

    /// The interpreter has no capability document, so disallowed builtins
    /// are rejected by a call-site scan of each module before parse.
    fn check_capabilities(
        &self,
        id: &str,
        module: &str,
        source: &str,
    ) -> Result<(), CompileError> {
        for builtin in &self.opts.unsafe_builtins {
            let pattern = format!(r"(^|[^\w.]){}\s*\(", regex::escape(builtin));
            let re = Regex::new(&pattern).map_err(|e| CompileError::InvalidCapability {
                builtin: builtin.clone(),
                message: e.to_string(),
            })?;
            if re.is_match(source) {
                return Err(CompileError::DisallowedBuiltin {
                    id: id.to_string(),
                    module: module.to_string(),
                    builtin: builtin.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A compiled, immutable policy unit.
#[derive(Clone)]
pub struct CompiledPolicy {
    engine: regorus::Engine,
}

impl std::fmt::Debug for CompiledPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPolicy").finish_non_exhaustive()
    }
}

impl CompiledPolicy {
    fn eval(&self, rule: &str, input: &Value) -> Result<Value, PolicyError> {
        let mut engine = self.engine.clone();
        let input: regorus::Value = serde_json::from_value(input.clone())
            .map_err(|e| PolicyError::Evaluation(format!("input conversion: {e}")))?;
        engine.set_input(input);

        let value = engine
            .eval_rule(rule.to_string())
            .map_err(|e| PolicyError::Evaluation(e.to_string()))?;
        if value == regorus::Value::Undefined {
            return Err(PolicyError::Evaluation(format!("{rule} is undefined")));
        }
        serde_json::to_value(&value).map_err(|e| PolicyError::Evaluation(e.to_string()))
    }

    /// Evaluate `data.authz.allow` as a boolean.
    pub fn eval_bool(&self, input: &Value) -> Result<bool, PolicyError> {
        match self.eval(POLICY_ENTRYPOINT, input)? {
            Value::Bool(b) => Ok(b),
            other => Err(PolicyError::Evaluation(format!(
                "{POLICY_ENTRYPOINT} returned {other} instead of a boolean"
            ))),
        }
    }

    /// Evaluate `data.authz.allow` as an integer (tri-state system
    /// policies).
    pub fn eval_int(&self, input: &Value) -> Result<i64, PolicyError> {
        let value = self.eval(POLICY_ENTRYPOINT, input)?;
        value.as_i64().ok_or_else(|| {
            PolicyError::Evaluation(format!(
                "{POLICY_ENTRYPOINT} returned {value} instead of an integer"
            ))
        })
    }

    /// Evaluate an arbitrary rule, returning its document.
    pub fn eval_output(&self, rule: &str, input: &Value) -> Result<Value, PolicyError> {
        self.eval(rule, input)
    }
}

/// SHA-256 over (MRN, entry source, dependency sources ordered by
/// dependency MRN). Identifies a compiled unit for audit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(mrn: &str, source: &str, dependencies: &[(String, String)]) -> Self {
        let mut ordered: Vec<&(String, String)> = dependencies.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        hasher.update(mrn.as_bytes());
        hasher.update(source.as_bytes());
        for (_, dep_source) in ordered {
            hasher.update(dep_source.as_bytes());
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("sha256:{}", hex::encode(self.0))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Wire form is base64, per the AccessRecord JSON contract.
impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("fingerprint must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}
