//! Weather Domain Types

use agent_core::{RequestContext, StructuredResponse, tool::ParameterSchema};
use serde::{Deserialize, Serialize};

/// Per-request caller context read by the location tool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherContext {
    pub user_id: String,
}

impl Default for WeatherContext {
    fn default() -> Self {
        Self::new("2")
    }
}

impl WeatherContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }

    pub fn to_context(&self) -> RequestContext {
        RequestContext::new().with("user_id", self.user_id.clone())
    }
}

impl From<WeatherContext> for RequestContext {
    fn from(ctx: WeatherContext) -> Self {
        ctx.to_context()
    }
}

/// Final answer of the weather agent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherResponse {
    /// A punny response (always required)
    pub punny_response: String,

    /// Any interesting information about the weather, if available
    #[serde(default)]
    pub weather_conditions: Option<String>,
}

impl StructuredResponse for WeatherResponse {
    fn name() -> &'static str {
        "WeatherResponse"
    }

    fn description() -> &'static str {
        "Response schema for the weather agent."
    }

    fn fields() -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("punny_response", "string", "A punny response to the user"),
            ParameterSchema::optional(
                "weather_conditions",
                "string",
                "Any interesting information about the weather if available",
            ),
        ]
    }

    fn validate(&self) -> Result<(), String> {
        if self.punny_response.trim().is_empty() {
            return Err("punny_response must not be empty".into());
        }
        Ok(())
    }
}
