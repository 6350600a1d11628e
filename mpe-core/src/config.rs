//! Process-wide configuration.
//!
//! Loaded once from an optional YAML file and overridden by `MPE_*`
//! environment variables. The loaded value is immutable for the process
//! lifetime; [`reset`] exists for tests only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Directory holding the config file.
pub const ENV_CONFIG_PATH: &str = "MPE_CONFIG_PATH";
/// Config file name within `MPE_CONFIG_PATH` (default `config.yaml`).
pub const ENV_CONFIG_FILENAME: &str = "MPE_CONFIG_FILENAME";
pub const ENV_LOG_LEVEL: &str = "MPE_LOG_LEVEL";
pub const ENV_LOG_FORMATTER: &str = "MPE_LOG_FORMATTER";
/// Directory with Kubernetes downward-API `labels`/`annotations` files.
pub const ENV_AUXDATA_PATH: &str = "MPE_AUXDATA_PATH";
pub const ENV_MOCK_ENABLED: &str = "MPE_MOCK_ENABLED";
pub const ENV_OPA_UNSAFEBUILTINS: &str = "MPE_OPA_UNSAFEBUILTINS";
pub const ENV_BUNDLES_INCLUDEALL: &str = "MPE_BUNDLES_INCLUDEALL";
pub const ENV_AUDIT_K8S_PODINFO: &str = "MPE_AUDIT_K8S_PODINFO";

const DEFAULT_CONFIG_FILENAME: &str = "config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bundles: BundlesConfig,

    #[serde(default)]
    pub opa: OpaConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub mock: MockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlesConfig {
    /// When false, AccessRecord references are pruned to the decisive set.
    #[serde(default = "default_true")]
    pub includeall: bool,
}

impl Default for BundlesConfig {
    fn default() -> Self {
        Self { includeall: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaConfig {
    /// Builtins removed from the policy compiler capabilities.
    #[serde(default = "default_unsafe_builtins")]
    pub unsafebuiltins: Vec<String>,
}

impl Default for OpaConfig {
    fn default() -> Self {
        Self {
            unsafebuiltins: default_unsafe_builtins(),
        }
    }
}

fn default_unsafe_builtins() -> Vec<String> {
    vec!["http.send".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    /// Entries resolved into `metadata.env` of every AccessRecord.
    #[serde(default)]
    pub env: Vec<AuditEnvEntry>,

    #[serde(default)]
    pub k8s: K8sConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct K8sConfig {
    /// Enables reading downward-API podinfo files under `MPE_AUXDATA_PATH`.
    #[serde(default)]
    pub podinfo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEnvEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: AuditEnvKind,

    /// Environment variable name, literal string, or podinfo key,
    /// depending on `kind`.
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEnvKind {
    #[serde(rename = "env")]
    Env,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "k8s-label")]
    K8sLabel,
    #[serde(rename = "k8s-annot")]
    K8sAnnot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MockConfig {
    /// Answers requests from the in-memory mock backend.
    #[serde(default)]
    pub enabled: bool,
}

static CONFIG: Lazy<RwLock<Option<Arc<Config>>>> = Lazy::new(|| RwLock::new(None));

/// Load the process configuration. Idempotent: the first call resolves the
/// file and environment, later calls return the same value.
pub fn load() -> Arc<Config> {
    if let Some(cfg) = CONFIG.read().expect("config lock poisoned").as_ref() {
        return cfg.clone();
    }

    let mut guard = CONFIG.write().expect("config lock poisoned");
    if let Some(cfg) = guard.as_ref() {
        return cfg.clone();
    }

    let cfg = Arc::new(resolve());
    *guard = Some(cfg.clone());
    cfg
}

/// Discard the cached configuration. Tests only; the process configuration
/// is otherwise immutable.
pub fn reset() {
    *CONFIG.write().expect("config lock poisoned") = None;
}

fn resolve() -> Config {
    let mut cfg = match config_file_path() {
        Some(path) if path.exists() => match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml_ng::from_str::<Config>(&content) {
                Ok(cfg) => {
                    debug!("Loaded configuration from {:?}", path);
                    cfg
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}: {} - using defaults", path, e);
                    Config::default()
                }
            },
            Err(e) => {
                warn!("Failed to read config file {:?}: {} - using defaults", path, e);
                Config::default()
            }
        },
        _ => {
            debug!("No configuration file found - using defaults");
            Config::default()
        }
    };

    apply_env_overrides(&mut cfg);
    cfg
}

fn config_file_path() -> Option<PathBuf> {
    let dir = std::env::var(ENV_CONFIG_PATH).ok()?;
    let filename = std::env::var(ENV_CONFIG_FILENAME)
        .unwrap_or_else(|_| DEFAULT_CONFIG_FILENAME.to_string());
    Some(Path::new(&dir).join(filename))
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        cfg.log.level = level;
    }
    if let Some(v) = env_bool(ENV_BUNDLES_INCLUDEALL) {
        cfg.bundles.includeall = v;
    }
    if let Some(v) = env_bool(ENV_MOCK_ENABLED) {
        cfg.mock.enabled = v;
    }
    if let Some(v) = env_bool(ENV_AUDIT_K8S_PODINFO) {
        cfg.audit.k8s.podinfo = v;
    }
    if let Ok(list) = std::env::var(ENV_OPA_UNSAFEBUILTINS) {
        cfg.opa.unsafebuiltins = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!("Ignoring non-boolean value {:?} for {}", other, name);
            None
        }
    }
}

/// Resolve `audit.env` entries into the static environment map stamped onto
/// every AccessRecord. Resolution happens once at engine construction.
pub fn resolve_audit_env(cfg: &Config) -> BTreeMap<String, String> {
    let auxdata = std::env::var(ENV_AUXDATA_PATH).ok().map(PathBuf::from);
    let labels = podinfo_map(cfg, auxdata.as_deref(), "labels");
    let annotations = podinfo_map(cfg, auxdata.as_deref(), "annotations");

    let mut env = BTreeMap::new();
    for entry in &cfg.audit.env {
        let resolved = match entry.kind {
            AuditEnvKind::String => Some(entry.value.clone()),
            AuditEnvKind::Env => std::env::var(&entry.value).ok(),
            AuditEnvKind::K8sLabel => labels.get(&entry.value).cloned(),
            AuditEnvKind::K8sAnnot => annotations.get(&entry.value).cloned(),
        };
        match resolved {
            Some(value) => {
                env.insert(entry.name.clone(), value);
            }
            None => {
                warn!("Audit env entry {:?} did not resolve - omitted", entry.name);
            }
        }
    }
    env
}

fn podinfo_map(cfg: &Config, auxdata: Option<&Path>, file: &str) -> BTreeMap<String, String> {
    if !cfg.audit.k8s.podinfo {
        return BTreeMap::new();
    }
    let Some(dir) = auxdata else {
        return BTreeMap::new();
    };
    match std::fs::read_to_string(dir.join(file)) {
        Ok(content) => parse_podinfo(&content),
        Err(e) => {
            warn!("Failed to read podinfo {} file: {}", file, e);
            BTreeMap::new()
        }
    }
}

/// Parse Kubernetes downward-API files: one `key="value"` pair per line.
fn parse_podinfo(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    map
}

/// Initialize the global tracing subscriber from configuration.
///
/// `MPE_LOG_FORMATTER=json` selects JSON lines; anything else the compact
/// human formatter. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let cfg = load();
    let filter = EnvFilter::try_new(&cfg.log.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var(ENV_LOG_FORMATTER)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if result.is_err() {
        debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            ENV_CONFIG_PATH,
            ENV_CONFIG_FILENAME,
            ENV_LOG_LEVEL,
            ENV_BUNDLES_INCLUDEALL,
            ENV_MOCK_ENABLED,
            ENV_OPA_UNSAFEBUILTINS,
            ENV_AUDIT_K8S_PODINFO,
            ENV_AUXDATA_PATH,
        ] {
            std::env::remove_var(name);
        }
        reset();
    }

    #[test]
    #[serial]
    fn defaults_without_file_or_env() {
        clear_env();
        let cfg = load();
        assert!(cfg.bundles.includeall);
        assert_eq!(cfg.opa.unsafebuiltins, vec!["http.send".to_string()]);
        assert_eq!(cfg.log.level, "info");
        assert!(!cfg.mock.enabled);
        clear_env();
    }

    #[test]
    #[serial]
    fn env_overrides_win() {
        clear_env();
        std::env::set_var(ENV_BUNDLES_INCLUDEALL, "false");
        std::env::set_var(ENV_OPA_UNSAFEBUILTINS, "http.send, net.lookup_ip_addr");
        std::env::set_var(ENV_LOG_LEVEL, "debug");
        let cfg = load();
        assert!(!cfg.bundles.includeall);
        assert_eq!(
            cfg.opa.unsafebuiltins,
            vec!["http.send".to_string(), "net.lookup_ip_addr".to_string()]
        );
        assert_eq!(cfg.log.level, "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn config_file_is_read_and_load_is_idempotent() {
        clear_env();
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "bundles:\n  includeall: false\nlog:\n  level: warn\n",
        )
        .unwrap();
        std::env::set_var(ENV_CONFIG_PATH, dir.path());

        let first = load();
        assert!(!first.bundles.includeall);
        assert_eq!(first.log.level, "warn");

        // A later env change must not alter the already-loaded config.
        std::env::set_var(ENV_LOG_LEVEL, "trace");
        let second = load();
        assert_eq!(second.log.level, "warn");
        clear_env();
    }

    #[test]
    #[serial]
    fn audit_env_resolution() {
        clear_env();
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("labels"),
            "app=\"mpe\"\npod-template-hash=\"abc123\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("annotations"), "team=\"iam\"\n").unwrap();
        std::env::set_var(ENV_AUXDATA_PATH, dir.path());
        std::env::set_var("MPE_TEST_REALM", "production");

        let cfg = Config {
            audit: AuditConfig {
                env: vec![
                    AuditEnvEntry {
                        name: "realm".into(),
                        kind: AuditEnvKind::Env,
                        value: "MPE_TEST_REALM".into(),
                    },
                    AuditEnvEntry {
                        name: "version".into(),
                        kind: AuditEnvKind::String,
                        value: "1.2.3".into(),
                    },
                    AuditEnvEntry {
                        name: "app".into(),
                        kind: AuditEnvKind::K8sLabel,
                        value: "app".into(),
                    },
                    AuditEnvEntry {
                        name: "team".into(),
                        kind: AuditEnvKind::K8sAnnot,
                        value: "team".into(),
                    },
                    AuditEnvEntry {
                        name: "missing".into(),
                        kind: AuditEnvKind::Env,
                        value: "MPE_TEST_DOES_NOT_EXIST".into(),
                    },
                ],
                k8s: K8sConfig { podinfo: true },
            },
            ..Config::default()
        };

        let env = resolve_audit_env(&cfg);
        assert_eq!(env.get("realm").map(String::as_str), Some("production"));
        assert_eq!(env.get("version").map(String::as_str), Some("1.2.3"));
        assert_eq!(env.get("app").map(String::as_str), Some("mpe"));
        assert_eq!(env.get("team").map(String::as_str), Some("iam"));
        assert!(!env.contains_key("missing"));

        std::env::remove_var("MPE_TEST_REALM");
        clear_env();
    }

    #[test]
    fn podinfo_parsing_ignores_blank_lines() {
        let parsed = parse_podinfo("a=\"1\"\n\n  b = \"two words\" \nmalformed\n");
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("two words"));
        assert!(!parsed.contains_key("malformed"));
    }
}
