//! Request Context
//!
//! Caller-supplied, read-only data handed to tool bodies for the duration of
//! one invocation. Never persisted with the thread.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

/// Key/value context visible to tools during a single `invoke`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestContext {
    values: Map<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a typed record such as `struct Ctx { user_id: String }`.
    ///
    /// The record must serialize to a JSON object.
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(values) => Ok(Self { values }),
            other => Err(AgentError::Config(format!(
                "request context must be an object, got {}",
                other
            ))),
        }
    }

    /// Add a value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Typed read of a single key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| AgentError::Config(format!("missing context key: {}", key)))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            AgentError::Config(format!("context key '{}' has the wrong type: {}", key, e))
        })
    }

    /// Read a string value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Keys from `required` that this context does not provide
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        required
            .into_iter()
            .filter(|k| !self.contains(k))
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
