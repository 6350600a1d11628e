//! MRN handling.
//!
//! MRNs are opaque identifiers, unique per entity class within a bundle.
//! Cross-bundle references are written `<bundle>/<local-id>` at the I/O
//! boundary; internally they are carried as an [`EntityKey`] pair.

use serde::{Deserialize, Serialize};

/// A fully resolved entity reference: owning bundle plus local MRN.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub bundle: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(bundle: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            id: id.into(),
        }
    }

    /// Parse a reference string relative to the bundle it appears in.
    ///
    /// A reference is local when it contains no `/`; otherwise the first
    /// `/`-delimited segment names the target bundle.
    pub fn parse(raw: &str, home_bundle: &str) -> Self {
        match raw.split_once('/') {
            Some((bundle, id)) => Self::new(bundle, id),
            None => Self::new(home_bundle, raw),
        }
    }

    /// Whether `raw` names an entity outside its home bundle.
    pub fn is_qualified(raw: &str) -> bool {
        raw.contains('/')
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bundle, self.id)
    }
}
