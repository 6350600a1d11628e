//! PORC request parsing and input enrichment.
//!
//! The wire shape is lenient where the phases have defined behavior for
//! absence (missing operation denies in phase 1, missing scopes grant
//! phase 4) and strict where the document is malformed (non-object
//! principal, non-string operation).

use serde_json::{json, Map, Value};

use crate::annotations;
use crate::backend::ResourceRef;
use crate::error::PolicyError;

/// A parsed PORC request: Principal, Operation, Resource, Context.
#[derive(Debug, Clone)]
pub struct Porc {
    pub principal: Map<String, Value>,
    pub operation: String,
    pub resource: Value,
    pub context: Map<String, Value>,
}

impl Porc {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let root: Value = serde_json::from_str(raw)
            .map_err(|e| PolicyError::InvalidRequest(format!("malformed JSON: {e}")))?;
        Self::from_value(root)
    }

    pub fn from_value(root: Value) -> Result<Self, PolicyError> {
        let Value::Object(root) = root else {
            return Err(PolicyError::InvalidRequest(
                "request must be a JSON object".into(),
            ));
        };

        let principal = match root.get("principal") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(obj)) => obj.clone(),
            Some(_) => {
                return Err(PolicyError::InvalidRequest(
                    "principal must be an object".into(),
                ))
            }
        };

        let operation = match root.get("operation") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(PolicyError::InvalidRequest(
                    "operation must be a string".into(),
                ))
            }
        };

        let resource = match root.get("resource") {
            None | Some(Value::Null) => Value::String(String::new()),
            Some(v @ Value::String(_)) | Some(v @ Value::Object(_)) => v.clone(),
            Some(_) => {
                return Err(PolicyError::InvalidRequest(
                    "resource must be a string or an object".into(),
                ))
            }
        };

        let context = match root.get("context") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(obj)) => obj.clone(),
            Some(_) => {
                return Err(PolicyError::InvalidRequest(
                    "context must be an object".into(),
                ))
            }
        };

        Ok(Self {
            principal,
            operation,
            resource,
            context,
        })
    }

    fn principal_str(&self, key: &str) -> &str {
        self.principal
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn subject(&self) -> &str {
        self.principal_str("sub")
    }

    pub fn realm(&self) -> &str {
        self.principal_str("realm")
    }

    fn principal_strings(&self, key: &str) -> Vec<String> {
        self.principal
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mroles(&self) -> Vec<String> {
        self.principal_strings("mroles")
    }

    pub fn mgroups(&self) -> Vec<String> {
        self.principal_strings("mgroups")
    }

    pub fn scopes(&self) -> Vec<String> {
        self.principal_strings("scopes")
    }

    pub fn annotations(&self) -> Map<String, Value> {
        self.principal
            .get("annotations")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// The raw request document, as handed to the system phase.
    pub fn to_value(&self) -> Value {
        json!({
            "principal": self.principal,
            "operation": self.operation,
            "resource": self.resource,
            "context": self.context,
        })
    }
}

/// Build the evaluation input for phases 2-4: a fresh document carrying the
/// merged annotations and the resolved resource. The request's own maps are
/// never mutated.
pub fn enriched_input(
    porc: &Porc,
    annotations: Map<String, Value>,
    resource: &ResourceRef,
) -> Value {
    let mut principal = porc.principal.clone();
    principal.insert("annotations".to_string(), Value::Object(annotations));

    json!({
        "principal": principal,
        "operation": porc.operation,
        "resource": {
            "id": resource.mrn,
            "group": resource.group,
            "annotations": annotations::to_plain(&resource.annotations),
        },
        "context": porc.context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_the_conventional_shape() {
        let porc = Porc::parse(
            r#"{
                "principal": {
                    "sub": "u1",
                    "realm": "prod",
                    "mroles": ["mrn:iam:role:admin"],
                    "mgroups": ["mrn:iam:group:ops"],
                    "scopes": ["mrn:iam:scope:read"],
                    "annotations": {"tier": "gold"}
                },
                "operation": "api:doc:read",
                "resource": "mrn:doc:1",
                "context": {"ip": "10.0.0.1"}
            }"#,
        )
        .unwrap();

        assert_eq!(porc.subject(), "u1");
        assert_eq!(porc.realm(), "prod");
        assert_eq!(porc.mroles(), vec!["mrn:iam:role:admin".to_string()]);
        assert_eq!(porc.mgroups(), vec!["mrn:iam:group:ops".to_string()]);
        assert_eq!(porc.scopes(), vec!["mrn:iam:scope:read".to_string()]);
        assert_eq!(porc.annotations()["tier"], json!("gold"));
        assert_eq!(porc.operation, "api:doc:read");
    }

    #[test]
    fn missing_sections_default() {
        let porc = Porc::parse("{}").unwrap();
        assert!(porc.principal.is_empty());
        assert_eq!(porc.operation, "");
        assert_eq!(porc.resource, json!(""));
        assert!(porc.scopes().is_empty());
    }

    #[test]
    fn malformed_shapes_are_invalid_requests() {
        for raw in [
            "[]",
            "not json",
            r#"{"principal": "u1"}"#,
            r#"{"operation": 7}"#,
            r#"{"resource": [1]}"#,
            r#"{"context": 3}"#,
        ] {
            let err = Porc::parse(raw).unwrap_err();
            assert!(
                matches!(err, PolicyError::InvalidRequest(_)),
                "expected invalid request for {raw}"
            );
        }
    }

    #[test]
    fn object_resource_is_accepted() {
        let porc = Porc::parse(r#"{"resource": {"id": "mrn:doc:1", "group": "mrn:rg:x"}}"#).unwrap();
        assert_eq!(porc.resource["group"], json!("mrn:rg:x"));
    }

    #[test]
    fn enrichment_does_not_mutate_the_request() {
        let porc = Porc::parse(r#"{"principal": {"sub": "u1"}, "operation": "op"}"#).unwrap();
        let resource = ResourceRef {
            mrn: "mrn:doc:1".to_string(),
            group: "mrn:rg:default".to_string(),
            annotations: Default::default(),
        };
        let mut merged = Map::new();
        merged.insert("tier".to_string(), json!("gold"));

        let input = enriched_input(&porc, merged, &resource);
        assert_eq!(input["principal"]["annotations"]["tier"], json!("gold"));
        assert_eq!(input["resource"]["group"], json!("mrn:rg:default"));
        // the parsed request still has no annotations
        assert!(porc.principal.get("annotations").is_none());
    }
}
