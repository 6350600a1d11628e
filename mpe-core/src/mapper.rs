//! Mapper evaluation.
//!
//! Mappers share the compiler substrate with policies but are compiled
//! with the full builtin set and read a different entrypoint: given an
//! arbitrary external input document, `data.mapper.porc` produces the PORC
//! document handed to `authorize`.

use serde_json::Value;

use crate::backend::MapperRef;
use crate::compiler::MAPPER_ENTRYPOINT;
use crate::error::PolicyError;

impl MapperRef {
    /// Transform an external input document into a PORC document.
    pub fn evaluate(&self, input: &Value) -> Result<Value, PolicyError> {
        let porc = self.ast.eval_output(MAPPER_ENTRYPOINT, input)?;
        if !porc.is_object() {
            return Err(PolicyError::Evaluation(format!(
                "{MAPPER_ENTRYPOINT} produced a non-object document"
            )));
        }
        Ok(porc)
    }
}
