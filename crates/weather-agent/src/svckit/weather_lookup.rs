//! Weather Lookup Tool

use async_trait::async_trait;

use agent_core::{
    AgentError, RequestContext, Result as CoreResult, Tool, ToolCall, ToolResult, ToolSchema,
    tool::ParameterSchema,
};

/// Tool for looking up the weather in a city
pub struct GetWeatherForLocationTool;

#[async_trait]
impl Tool for GetWeatherForLocationTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_weather_for_location".into(),
            description: "Get weather for a given city.".into(),
            parameters: vec![ParameterSchema::required("city", "string", "City to get the weather for")],
            category: Some("weather".into()),
            has_side_effects: false,
            context_keys: Vec::new(),
        }
    }

    async fn execute(&self, call: &ToolCall, _ctx: &RequestContext) -> CoreResult<ToolResult> {
        let city = call
            .str_arg("city")
            .ok_or_else(|| AgentError::ToolValidation("city must be a string".into()))?;

        Ok(ToolResult::success(
            "get_weather_for_location",
            format!("It's always sunny in {}!", city),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_sunny() {
        let call = ToolCall::new("get_weather_for_location").with_arg("city", "Florida");
        let result = GetWeatherForLocationTool
            .execute(&call, &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(result.output, "It's always sunny in Florida!");
    }

    #[tokio::test]
    async fn test_city_must_be_text() {
        let call = ToolCall::new("get_weather_for_location").with_arg("city", 42);
        let err = GetWeatherForLocationTool
            .execute(&call, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolValidation(_)));
    }
}
