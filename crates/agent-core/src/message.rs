//! Conversation Messages
//!
//! Standard message format used across the agent system. A transcript is an
//! ordered, append-only `Vec<Message>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

/// Role of a message sender
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content
    #[serde(default)]
    pub content: String,

    /// Optional name (tool name for tool results)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls requested by the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Additional message metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Tool call ID this message answers (tool messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Model that generated this (assistant messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Custom key-value pairs
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message requesting tool calls
    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = Some(calls);
        msg
    }

    /// Create a tool result message
    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        if tool_call_id.is_some() {
            msg.metadata = Some(MessageMetadata {
                tool_call_id,
                ..Default::default()
            });
        }
        msg
    }

    /// Create a tool message from an execution result
    pub fn tool_result(result: &ToolResult) -> Self {
        let content = if result.success {
            result.output.clone()
        } else {
            format!("[Tool '{}' failed]\n{}", result.name, result.output)
        };
        Self::tool(content, result.id.clone()).with_name(result.name.clone())
    }

    /// Add a name to the message
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Record which model produced this message
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.get_or_insert_with(MessageMetadata::default).model = Some(model.into());
        self
    }

    /// Attach a custom metadata entry
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(MessageMetadata::default)
            .extra
            .insert(key.into(), value);
        self
    }

    /// The call this tool message answers, if any
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_call_id.as_deref()
    }

    /// Tool calls carried by this message (empty for most messages)
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        // ~4 characters per token is a rough estimate
        let calls: usize = self
            .calls()
            .iter()
            .map(|c| c.name.len() + serde_json::to_string(&c.arguments).map_or(0, |s| s.len()))
            .sum();
        ((self.content.len() + calls) / 4) as u32 + 4 // +4 for role overhead
    }
}

/// Estimate total tokens of a transcript
pub fn estimate_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(Message::estimate_tokens).sum()
}

/// IDs of tool calls that are not answered by the message directly after
/// their assistant message.
///
/// An assistant message with N calls must be followed by N tool messages
/// answering exactly those calls.
pub fn unanswered_tool_calls(messages: &[Message]) -> Vec<String> {
    let mut missing = Vec::new();

    for (idx, msg) in messages.iter().enumerate() {
        let calls = msg.calls();
        if calls.is_empty() {
            continue;
        }

        let answered: Vec<&str> = messages[idx + 1..]
            .iter()
            .take(calls.len())
            .take_while(|m| m.role == Role::Tool)
            .filter_map(Message::tool_call_id)
            .collect();

        for call in calls {
            let id = call.id.as_deref().unwrap_or_default();
            if !answered.contains(&id) {
                missing.push(id.to_string());
            }
        }
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            name: "get_user_location".into(),
            arguments: HashMap::new(),
            id: Some(id.into()),
        }
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.calls().is_empty());
    }

    #[test]
    fn test_tool_message_links_call() {
        let msg = Message::tool("Florida", Some("call-1".into()));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id(), Some("call-1"));
    }

    #[test]
    fn test_failed_tool_result_is_marked() {
        let result = ToolResult::failure("lookup", "boom").with_id("call-9");
        let msg = Message::tool_result(&result);
        assert!(msg.content.starts_with("[Tool 'lookup' failed]"));
        assert_eq!(msg.name.as_deref(), Some("lookup"));
        assert_eq!(msg.tool_call_id(), Some("call-9"));
    }

    #[test]
    fn test_unanswered_tool_calls() {
        let linked = vec![
            Message::user("what is the weather outside?"),
            Message::assistant_with_tool_calls("", vec![call("a")]),
            Message::tool("Florida", Some("a".into())),
            Message::assistant("Sunny!"),
        ];
        assert!(unanswered_tool_calls(&linked).is_empty());

        let dangling = vec![
            Message::user("hi"),
            Message::assistant_with_tool_calls("", vec![call("a"), call("b")]),
            Message::tool("Florida", Some("a".into())),
            Message::assistant("done"),
        ];
        assert_eq!(unanswered_tool_calls(&dangling), vec!["b".to_string()]);
    }

    #[test]
    fn test_role_wire_format() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert!(json.contains(r#""role":"assistant""#));
        assert!(!json.contains("tool_calls"));

        let parsed: Message = serde_json::from_str(r#"{"role":"user","content":"hey"}"#).unwrap();
        assert_eq!(parsed.role, Role::User);
    }
}
