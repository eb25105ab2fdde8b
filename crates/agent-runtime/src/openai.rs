//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any endpoint speaking the Chat
//! Completions protocol. Structured output uses the tool strategy: the
//! response schema is offered as one more function, and a call to it is the
//! final answer.

use std::collections::HashMap;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, CompletionRequest, FinishReason, GenerationOptions, LlmProvider, ModelOutput,
        ProviderInfo, TokenUsage,
    },
    tool::{ToolCall, ToolSchema},
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL: &str = "gpt-4o";

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Sent verbatim as the `Authorization` header
    pub api_token: String,

    /// Model used when generation options don't name one
    pub default_model: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// Retries for transient failures
    pub max_retries: u32,

    /// First backoff delay, doubled on each retry
    pub retry_delay: Duration,
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            default_model: DEFAULT_MODEL.into(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Read `LLM_API_URL`, `LLM_API_TOKEN` and optional tuning variables
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("LLM_API_URL")
            .map_err(|_| AgentError::Config("LLM_API_URL is not set".into()))?;
        let api_token = std::env::var("LLM_API_TOKEN")
            .map_err(|_| AgentError::Config("LLM_API_TOKEN is not set".into()))?;

        let mut config = Self::new(base_url, api_token);
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.default_model = model;
        }
        if let Some(secs) = std::env::var("LLM_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()) {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = std::env::var("LLM_MAX_RETRIES").ok().and_then(|s| s.parse().ok()) {
            config.max_retries = retries;
        }
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

// ============================================================================
// Conversion
// ============================================================================

fn convert_messages(system_prompt: &str, messages: &[Message]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        wire.push(WireMessage {
            role: "system".into(),
            content: Some(system_prompt.into()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in messages {
        let tool_calls = (!msg.calls().is_empty()).then(|| {
            msg.calls()
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone().unwrap_or_else(|| call.name.clone()),
                    kind: function_type(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".into()),
                    },
                })
                .collect::<Vec<_>>()
        });

        wire.push(WireMessage {
            role: msg.role.to_string(),
            content: if msg.content.is_empty() && tool_calls.is_some() {
                None
            } else {
                Some(msg.content.clone())
            },
            tool_calls,
            tool_call_id: match msg.role {
                Role::Tool => msg.tool_call_id().map(String::from),
                _ => None,
            },
        });
    }
    wire
}

fn convert_tools(request: &CompletionRequest) -> Vec<WireTool> {
    let mut tools: Vec<WireTool> = request
        .tools
        .iter()
        .map(|schema: &ToolSchema| WireTool {
            kind: "function",
            function: WireFunctionDef {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters_json(),
            },
        })
        .collect();

    if let Some(schema) = &request.response_schema {
        tools.push(WireTool {
            kind: "function",
            function: WireFunctionDef {
                name: schema.name.clone(),
                description: format!(
                    "{} Call this to give your final answer.",
                    schema.description
                ),
                parameters: schema.json_schema(),
            },
        });
    }
    tools
}

fn parse_arguments(raw: &str) -> Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| AgentError::Parse(format!("invalid tool arguments: {}", e)))
}

fn convert_response(
    response: ChatResponse,
    request: &CompletionRequest,
    model: &str,
) -> Result<Completion> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Parse("response contained no choices".into()))?;

    let content = choice.message.content.unwrap_or_default();
    let wire_calls = choice.message.tool_calls.unwrap_or_default();
    let schema_name = request.response_schema.as_ref().map(|s| s.name.as_str());

    let (answers, tool_calls): (Vec<WireToolCall>, Vec<WireToolCall>) = wire_calls
        .into_iter()
        .partition(|c| Some(c.function.name.as_str()) == schema_name);

    // real tools run first; the model answers again once it has their results
    let output = if !tool_calls.is_empty() {
        if !answers.is_empty() {
            tracing::warn!(
                tools = tool_calls.len(),
                "Final answer arrived alongside tool calls, running the tools first"
            );
        }
        let mut calls = Vec::with_capacity(tool_calls.len());
        for wire in tool_calls {
            let arguments: HashMap<String, serde_json::Value> =
                match parse_arguments(&wire.function.arguments)? {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    other => {
                        return Err(AgentError::Parse(format!(
                            "tool arguments for '{}' are not an object: {}",
                            wire.function.name, other
                        )));
                    }
                };
            calls.push(ToolCall {
                name: wire.function.name,
                arguments,
                id: Some(wire.id),
            });
        }
        ModelOutput::ToolCalls { content, calls }
    } else if let Some(answer) = answers.first() {
        ModelOutput::Structured(parse_arguments(&answer.function.arguments)?)
    } else {
        ModelOutput::Text(content)
    };

    let mut completion = Completion::new(output, response.model.unwrap_or_else(|| model.to_string()));
    if choice.finish_reason.as_deref() == Some("length") {
        completion.finish_reason = Some(FinishReason::Length);
    }
    if let Some(usage) = response.usage {
        completion = completion.with_usage(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
    }
    Ok(completion)
}

/// Map a non-success status and body to the error taxonomy
fn status_error(status: StatusCode, body: &str) -> AgentError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    let message = format!("{} - {}", status, detail);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(message),
        s if s.is_server_error() => AgentError::ProviderUnavailable(message),
        _ => AgentError::Provider(message),
    }
}

/// Backoff before retry `attempt` (1-based)
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(Duration::from_secs(30))
}

// ============================================================================
// Provider
// ============================================================================

/// LLM provider for OpenAI-compatible endpoints
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    /// Create from configuration
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiConfig::from_env()?)
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn transport_error(&self, err: &reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout(self.config.timeout)
        } else if err.is_connect() {
            AgentError::ProviderUnavailable(err.to_string())
        } else {
            AgentError::Provider(err.to_string())
        }
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", &self.config.api_token)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("failed to parse completion: {}", e)))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "OpenAI".into(),
            endpoint: Some(self.config.base_url.clone()),
            default_model: self.config.default_model.clone(),
            supports_tools: true,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .header("Authorization", &self.config.api_token)
            .send()
            .await;

        match result {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("OpenAI health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let model = if options.model.is_empty() {
            self.config.default_model.clone()
        } else {
            options.model.clone()
        };

        let body = ChatRequest {
            model: model.clone(),
            messages: convert_messages(&request.system_prompt, &request.messages),
            tools: convert_tools(request),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: options.stop_sequences.clone(),
        };

        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(response) => {
                    tracing::debug!(model = %model, attempt, "Completion received");
                    return convert_response(response, request, &model);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = backoff(self.config.retry_delay, attempt);
                    tracing::warn!(error = %e, attempt, ?delay, "Retrying completion");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::schema::{ResponseSchema, StructuredResponse};
    use agent_core::tool::ParameterSchema;

    #[derive(Serialize, Deserialize)]
    struct Forecast {
        summary: String,
    }

    impl StructuredResponse for Forecast {
        fn name() -> &'static str {
            "Forecast"
        }

        fn description() -> &'static str {
            "A short forecast."
        }

        fn fields() -> Vec<ParameterSchema> {
            vec![ParameterSchema::required("summary", "string", "One sentence")]
        }
    }

    fn provider(url: &str) -> OpenAiProvider {
        let config = OpenAiConfig::new(url, "Bearer test-token").with_retries(2, Duration::from_millis(1));
        OpenAiProvider::from_config(config).unwrap()
    }

    fn weather_request() -> CompletionRequest {
        let mut request = CompletionRequest::new("You forecast weather.", vec![Message::user("weather in SF?")]);
        request.tools = vec![ToolSchema {
            name: "get_weather_for_location".into(),
            description: "Get weather for a given city.".into(),
            parameters: vec![ParameterSchema::required("city", "string", "City name")],
            category: None,
            has_side_effects: false,
            context_keys: Vec::new(),
        }];
        request
    }

    #[test]
    fn test_convert_messages() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("get_user_location").with_id("call_1")],
            ),
            Message::tool("Florida", Some("call_1".into())),
        ];
        let wire = convert_messages("be brief", &messages);

        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0].role, "system");
        assert!(wire[2].content.is_none());
        assert_eq!(wire[2].tool_calls.as_ref().unwrap()[0].function.arguments, "{}");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_schema_offered_as_tool() {
        let mut request = weather_request();
        request.response_schema = Some(ResponseSchema::of::<Forecast>());
        let tools = convert_tools(&request);

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].function.name, "Forecast");
        assert_eq!(tools[1].function.parameters["required"][0], "summary");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error(StatusCode::UNAUTHORIZED, ""), AgentError::Auth(_)));
        assert!(matches!(status_error(StatusCode::TOO_MANY_REQUESTS, ""), AgentError::RateLimited(_)));
        assert!(matches!(status_error(StatusCode::BAD_GATEWAY, ""), AgentError::ProviderUnavailable(_)));

        let err = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"error": {"message": "unknown model", "type": "invalid_request_error"}}"#,
        );
        assert!(matches!(&err, AgentError::Provider(msg) if msg.contains("unknown model")));
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
        assert_eq!(backoff(base, 20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_complete_tool_calls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "model": "gpt-4o-2024-08-06",
                    "choices": [{
                        "message": {
                            "content": null,
                            "tool_calls": [{
                                "id": "call_abc",
                                "type": "function",
                                "function": {"name": "get_weather_for_location", "arguments": "{\"city\": \"SF\"}"}
                            }]
                        },
                        "finish_reason": "tool_calls"
                    }],
                    "usage": {"prompt_tokens": 40, "completion_tokens": 12}
                }"#,
            )
            .create_async()
            .await;

        let completion = provider(&server.url())
            .complete(&weather_request(), &GenerationOptions::default())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(completion.model, "gpt-4o-2024-08-06");
        assert_eq!(completion.usage.unwrap().total_tokens, 52);
        match completion.output {
            ModelOutput::ToolCalls { calls, .. } => {
                assert_eq!(calls[0].id.as_deref(), Some("call_abc"));
                assert_eq!(calls[0].str_arg("city"), Some("SF"));
            }
            other => panic!("expected tool calls, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_structured_answer() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices": [{"message": {"tool_calls": [{
                    "id": "call_final",
                    "function": {"name": "Forecast", "arguments": "{\"summary\": \"Sunny.\"}"}
                }]}, "finish_reason": "tool_calls"}]}"#,
            )
            .create_async()
            .await;

        let mut request = weather_request();
        request.response_schema = Some(ResponseSchema::of::<Forecast>());
        let completion = provider(&server.url())
            .complete(&request, &GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(
            completion.output,
            ModelOutput::Structured(serde_json::json!({"summary": "Sunny."}))
        );
        assert_eq!(completion.model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_tool_calls_win_over_early_answer() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices": [{"message": {"tool_calls": [
                    {"id": "call_final", "function": {"name": "Forecast", "arguments": "{\"summary\": \"Sunny.\"}"}},
                    {"id": "call_loc", "function": {"name": "get_weather_for_location", "arguments": "{\"city\": \"SF\"}"}}
                ]}, "finish_reason": "tool_calls"}]}"#,
            )
            .create_async()
            .await;

        let mut request = weather_request();
        request.response_schema = Some(ResponseSchema::of::<Forecast>());
        let completion = provider(&server.url())
            .complete(&request, &GenerationOptions::default())
            .await
            .unwrap();

        match completion.output {
            ModelOutput::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "get_weather_for_location");
            }
            other => panic!("expected tool calls, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("upstream overloaded")
            .expect(3)
            .create_async()
            .await;

        let err = provider(&server.url())
            .complete(&weather_request(), &GenerationOptions::default())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, AgentError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_auth_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error": {"message": "bad token"}}"#)
            .expect(1)
            .create_async()
            .await;

        let err = provider(&server.url())
            .complete(&weather_request(), &GenerationOptions::default())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, AgentError::Auth(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;

        assert!(provider(&server.url()).health_check().await.unwrap());
        assert!(!provider("http://127.0.0.1:1").health_check().await.unwrap());
    }
}
