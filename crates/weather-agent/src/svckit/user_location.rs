//! User Location Tool
//!
//! Resolves the caller's location from the `user_id` in the request context.

use async_trait::async_trait;

use agent_core::{AgentError, RequestContext, Result as CoreResult, Tool, ToolCall, ToolResult, ToolSchema};

/// Tool for finding where the current user is
pub struct GetUserLocationTool;

#[async_trait]
impl Tool for GetUserLocationTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_user_location".into(),
            description: "Retrieve user information based on user ID.".into(),
            parameters: Vec::new(),
            category: Some("user".into()),
            has_side_effects: false,
            context_keys: vec!["user_id".into()],
        }
    }

    async fn execute(&self, _call: &ToolCall, ctx: &RequestContext) -> CoreResult<ToolResult> {
        let user_id = ctx
            .get_str("user_id")
            .ok_or_else(|| AgentError::ToolExecution("user_id missing from request context".into()))?;

        let location = if user_id == "1" { "Florida" } else { "SF" };
        tracing::debug!(user_id, location, "Resolved user location");

        Ok(ToolResult::success("get_user_location", location))
    }
}
