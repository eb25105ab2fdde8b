//! Structured Output
//!
//! A response schema is a declared record type. The loop coerces the model's
//! final answer through [`ResponseSchema::coerce`], which deserializes into
//! the record, runs its `validate` hook and re-serializes the result.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::tool::{ParameterSchema, object_schema};

/// A record the final answer can be coerced into
pub trait StructuredResponse: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Schema name, also used as the structured-output tool name
    fn name() -> &'static str;

    /// What the record means, shown to the model
    fn description() -> &'static str;

    /// Declared fields
    fn fields() -> Vec<ParameterSchema>;

    /// Semantic checks beyond the field types
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

type CoerceFn = dyn Fn(&serde_json::Value) -> std::result::Result<serde_json::Value, String> + Send + Sync;

/// Runtime handle on a declared response record
#[derive(Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub description: String,
    pub fields: Vec<ParameterSchema>,
    coerce: Arc<CoerceFn>,
}

impl std::fmt::Debug for ResponseSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSchema")
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

impl ResponseSchema {
    /// Schema for a declared record type
    pub fn of<T: StructuredResponse>() -> Self {
        Self {
            name: T::name().to_string(),
            description: T::description().to_string(),
            fields: T::fields(),
            coerce: Arc::new(|value: &serde_json::Value| -> std::result::Result<serde_json::Value, String> {
                let typed: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                typed.validate()?;
                serde_json::to_value(&typed).map_err(|e| e.to_string())
            }),
        }
    }

    /// JSON Schema for the record
    pub fn json_schema(&self) -> serde_json::Value {
        object_schema(&self.fields)
    }

    /// Validate a structured payload
    pub fn coerce(&self, value: &serde_json::Value) -> std::result::Result<serde_json::Value, String> {
        (self.coerce)(value)
    }

    /// Validate a free-text answer, which must contain a JSON object
    pub fn coerce_text(&self, text: &str) -> std::result::Result<serde_json::Value, String> {
        let value = extract_json(text)
            .ok_or_else(|| "answer does not contain a JSON object".to_string())?;
        self.coerce(&value)
    }

    /// Instruction sent back to the model after a non-conforming answer
    pub fn reformat_instruction(&self, reason: &str) -> String {
        format!(
            "Your previous answer did not match the required '{}' format ({}). \
             Reply again with only a JSON object matching this schema:\n{}",
            self.name,
            reason,
            self.json_schema()
        )
    }
}

/// Pull a JSON object out of model text, tolerating markdown fences and
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}
