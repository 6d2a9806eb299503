//! JSON Schema validation of handler arguments.

use jsonschema::Validator;
use serde_json::{Map, Value};

use super::errors::RegistrationError;
use crate::model::RoutingKey;

/// Compiled `args` schema for one handler.
pub struct ArgsValidator {
    validator: Validator,
}

impl std::fmt::Debug for ArgsValidator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ArgsValidator").finish_non_exhaustive()
    }
}

impl ArgsValidator {
    /// Compiles `schema` when it is a schema object, that is a JSON object
    /// with a `type` member. Anything else disables validation and yields
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::SchemaCompile`] when the schema is
    /// malformed.
    pub fn compile(key: &RoutingKey, schema: Option<&Value>) -> Result<Option<Self>, RegistrationError> {
        let Some(schema) = schema.filter(|value| is_schema_object(value)) else {
            return Ok(None);
        };
        let validator = jsonschema::validator_for(schema)
            .map_err(|error| RegistrationError::schema_compile(key.clone(), error.to_string()))?;
        Ok(Some(Self { validator }))
    }

    /// Validates `args`; absent arguments validate as an empty object.
    ///
    /// Returns one `<path> <message>` entry per failure, or an empty list
    /// when the arguments are valid.
    #[must_use]
    pub fn failures(&self, args: Option<&Value>) -> Vec<String> {
        let empty = Value::Object(Map::new());
        let instance = args.unwrap_or(&empty);
        self.validator
            .iter_errors(instance)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path} {error}")
                }
            })
            .collect()
    }
}

fn is_schema_object(value: &Value) -> bool {
    value.as_object().is_some_and(|object| object.contains_key("type"))
}
