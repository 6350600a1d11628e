//! Validation error accumulation and cycle detection.
//!
//! Registry construction never fails fast: every reference, cycle, and
//! compile problem across all bundles is collected and reported as one
//! aggregate error with group-by-domain and group-by-kind views.

use std::collections::BTreeMap;

use serde::Serialize;

/// Validation error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationKind {
    /// Dangling or malformed reference, duplicate MRN, bad selector,
    /// default-resource-group violation.
    Reference,
    /// Policy-library dependency cycle.
    Cycle,
    /// Policy source failed to compile.
    Rego,
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationKind::Reference => f.write_str("reference"),
            ValidationKind::Cycle => f.write_str("cycle"),
            ValidationKind::Rego => f.write_str("rego"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub kind: ValidationKind,

    /// Bundle (policy domain) the error belongs to.
    pub domain: String,

    /// MRN or identifier of the offending entity.
    pub entity: String,

    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}/{}: {}",
            self.kind, self.domain, self.entity, self.message
        )
    }
}

/// Aggregate of every validation error found during registry construction.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub(crate) fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }

    pub fn all(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors belonging to one policy domain.
    pub fn for_domain(&self, domain: &str) -> Vec<&ValidationError> {
        self.errors.iter().filter(|e| e.domain == domain).collect()
    }

    pub fn by_domain(&self) -> BTreeMap<&str, Vec<&ValidationError>> {
        let mut map: BTreeMap<&str, Vec<&ValidationError>> = BTreeMap::new();
        for e in &self.errors {
            map.entry(e.domain.as_str()).or_default().push(e);
        }
        map
    }

    pub fn by_kind(&self) -> BTreeMap<ValidationKind, Vec<&ValidationError>> {
        let mut map: BTreeMap<ValidationKind, Vec<&ValidationError>> = BTreeMap::new();
        for e in &self.errors {
            map.entry(e.kind).or_default().push(e);
        }
        map
    }

    /// Grouped counts for reporting surfaces (lint, startup logs).
    pub fn summary(&self) -> ValidationSummary {
        let mut by_domain = BTreeMap::new();
        let mut by_kind = BTreeMap::new();
        for e in &self.errors {
            *by_domain.entry(e.domain.clone()).or_insert(0) += 1;
            *by_kind.entry(e.kind.to_string()).or_insert(0) += 1;
        }
        ValidationSummary {
            total: self.errors.len(),
            by_domain,
            by_kind,
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} validation errors:", self.errors.len())?;
        for (domain, errors) in self.by_domain() {
            writeln!(f, "  domain {domain}:")?;
            for e in errors {
                writeln!(f, "    [{}] {}: {}", e.kind, e.entity, e.message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub by_domain: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
}

/// Find cycles in a dependency graph with a colored DFS.
///
/// Nodes are qualified `bundle/mrn` strings; the returned paths are closed
/// (`a -> b -> a`), one per distinct cycle, in deterministic order.
pub(crate) fn detect_cycles(graph: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: &str,
        graph: &BTreeMap<String, Vec<String>>,
        colors: &mut BTreeMap<String, Color>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        colors.insert(node.to_string(), Color::Gray);
        stack.push(node.to_string());

        if let Some(neighbors) = graph.get(node) {
            for next in neighbors {
                match colors.get(next).copied().unwrap_or(Color::White) {
                    Color::White => visit(next, graph, colors, stack, cycles),
                    Color::Gray => {
                        // back edge: the cycle is the stack suffix from the
                        // gray node, closed with the node itself
                        if let Some(pos) = stack.iter().position(|n| n == next) {
                            let mut cycle: Vec<String> = stack[pos..].to_vec();
                            cycle.push(next.clone());
                            cycles.push(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        colors.insert(node.to_string(), Color::Black);
    }

    let mut colors = BTreeMap::new();
    let mut cycles = Vec::new();
    for node in graph.keys() {
        if colors.get(node).copied().unwrap_or(Color::White) == Color::White {
            let mut stack = Vec::new();
            visit(node, graph, &mut colors, &mut stack, &mut cycles);
        }
    }
    cycles
}
