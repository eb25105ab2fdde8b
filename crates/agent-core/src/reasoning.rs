//! Reasoning Loop
//!
//! Implements the tool-calling agent loop: load the thread, ask the model for
//! its next step, run any tools it requests, feed the results back and stop
//! at a final answer (coerced into the response schema when one is set).
//! The updated transcript is saved once, at the very end, so a failed or
//! cancelled invocation leaves the thread untouched.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;

use crate::compaction::{self, SummarizationConfig};
use crate::context::RequestContext;
use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{Completion, CompletionRequest, GenerationOptions, LlmProvider, ModelOutput};
use crate::schema::{ResponseSchema, StructuredResponse};
use crate::thread::{MemoryThreadStore, ThreadId, ThreadStore};
use crate::tool::{Tool, ToolCall, ToolRegistry, ToolResult};
use crate::trace::{LogSink, ModelCallOutcome, TraceEvent, TraceSink};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// System prompt sent ahead of every transcript
    pub system_prompt: String,

    /// Maximum model calls per invocation before giving up
    pub max_iterations: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Deadline for a single provider call
    pub provider_timeout: Duration,

    /// Consecutive failures of one tool fed back to the model before the
    /// invocation is aborted
    pub tool_error_budget: usize,

    /// Reformat requests after a non-conforming structured answer
    pub max_reformat_retries: usize,

    /// Shape the final answer must take
    pub response_schema: Option<ResponseSchema>,

    /// History summarization, off by default
    pub summarization: Option<SummarizationConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            generation: GenerationOptions::default(),
            provider_timeout: Duration::from_secs(60),
            tool_error_budget: 1,
            max_reformat_retries: 1,
            response_schema: None,
            summarization: None,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Result of one invocation
#[derive(Clone, Debug)]
pub struct AgentOutput {
    /// Final answer text (JSON text for structured answers)
    pub text: String,

    /// Coerced structured answer, when a response schema is configured
    pub structured: Option<serde_json::Value>,

    /// Full transcript as persisted
    pub messages: Vec<Message>,
}

impl AgentOutput {
    /// Deserialize the structured answer into its record type
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .structured
            .clone()
            .ok_or_else(|| AgentError::Parse("no structured response".into()))?;
        Ok(serde_json::from_value(value)?)
    }
}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ThreadStore>,
    sink: Arc<dyn TraceSink>,
    config: AgentConfig,
    thread_locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ThreadStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            sink: Arc::new(LogSink),
            config,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the trace sink
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run one turn of the conversation on `thread_id`.
    ///
    /// `context` is required when any registered tool declares context keys.
    /// Invocations on the same thread id are serialized; different threads
    /// run independently.
    pub async fn invoke(
        &self,
        thread_id: &ThreadId,
        new_messages: Vec<Message>,
        context: Option<RequestContext>,
    ) -> Result<AgentOutput> {
        if new_messages.is_empty() {
            return Err(AgentError::InvalidInput("at least one message is required".into()));
        }
        let ctx = context.unwrap_or_default();
        self.check_context(&ctx)?;

        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let mut transcript = self.store.load(thread_id).await?;
        tracing::debug!(thread = %thread_id, prior = transcript.len(), "Loaded thread");
        transcript.extend(new_messages);

        if let Some(summarization) = &self.config.summarization {
            transcript = self.compact(thread_id, transcript, summarization).await?;
        }

        let output = self.run(thread_id, transcript, &ctx).await?;
        self.store.save(thread_id, output.messages.clone()).await?;

        Ok(output)
    }

    /// One-off question on a throwaway transcript (nothing persisted)
    pub async fn ask(&self, question: &str) -> Result<AgentOutput> {
        let ctx = RequestContext::new();
        self.check_context(&ctx)?;
        self.run(&ThreadId::new("ask"), vec![Message::user(question)], &ctx)
            .await
    }

    fn check_context(&self, ctx: &RequestContext) -> Result<()> {
        let required = self.tools.context_keys();
        let missing = ctx.missing(required.iter().map(String::as_str));
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(format!(
                "missing request context: {}",
                missing.join(", ")
            )))
        }
    }

    fn thread_lock(&self, thread_id: &ThreadId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.thread_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // drop locks nobody holds
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(thread_id.clone()).or_default().clone()
    }

    /// The reasoning loop proper
    async fn run(
        &self,
        thread_id: &ThreadId,
        mut transcript: Vec<Message>,
        ctx: &RequestContext,
    ) -> Result<AgentOutput> {
        let tools = self.tools.schemas();
        let mut reformat_attempts = 0;
        let mut tool_failures: HashMap<String, usize> = HashMap::new();

        // reformat requests don't consume the iteration budget
        let mut iteration = 0;
        while iteration < self.config.max_iterations + reformat_attempts {
            iteration += 1;
            let request = CompletionRequest {
                system_prompt: self.config.system_prompt.clone(),
                messages: transcript.clone(),
                tools: tools.clone(),
                response_schema: self.config.response_schema.clone(),
            };

            let started = Instant::now();
            let completion = match self.call_provider(&request).await {
                Ok(completion) => completion,
                Err(e) => {
                    self.trace_model_call(thread_id, iteration, None, started, ModelCallOutcome::Failed(e.to_string()));
                    return Err(e);
                }
            };
            let model = completion.model.clone();

            let answer = match completion.output.clone() {
                ModelOutput::ToolCalls { content, calls } if !calls.is_empty() => {
                    self.trace_model_call(thread_id, iteration, Some(&completion), started, ModelCallOutcome::ToolCalls(calls.len()));

                    let calls: Vec<ToolCall> = calls
                        .into_iter()
                        .map(|mut call| {
                            if call.id.is_none() {
                                call.id = Some(uuid::Uuid::new_v4().to_string());
                            }
                            call
                        })
                        .collect();

                    transcript.push(Message::assistant_with_tool_calls(content, calls.clone()).with_model(&model));

                    // every call in the batch runs and is answered before the
                    // budget is checked; a tool counts as failed once per batch
                    let mut succeeded: HashSet<String> = HashSet::new();
                    let mut failed: Vec<(String, AgentError)> = Vec::new();
                    for call in &calls {
                        tracing::debug!(thread = %thread_id, tool = %call.name, "Executing tool");
                        let (result, error) = self.execute_tool(thread_id, call, ctx).await;
                        transcript.push(Message::tool_result(&result));

                        if result.success {
                            succeeded.insert(call.name.clone());
                        } else if !failed.iter().any(|(name, _)| name == &call.name) {
                            let error = error.unwrap_or_else(|| AgentError::ToolExecution(result.output.clone()));
                            failed.push((call.name.clone(), error));
                        }
                    }

                    for name in succeeded {
                        if !failed.iter().any(|(failed_name, _)| failed_name == &name) {
                            tool_failures.remove(&name);
                        }
                    }

                    for (name, error) in failed {
                        let failures = tool_failures.entry(name.clone()).or_insert(0);
                        *failures += 1;
                        if *failures > self.config.tool_error_budget {
                            tracing::warn!(thread = %thread_id, tool = %name, failures = *failures, "Tool error budget exhausted");
                            return Err(error);
                        }
                    }

                    continue;
                }
                ModelOutput::ToolCalls { content, .. } => ModelOutput::Text(content),
                other => other,
            };

            self.trace_model_call(thread_id, iteration, Some(&completion), started, ModelCallOutcome::FinalAnswer);

            let Some(schema) = &self.config.response_schema else {
                let (text, structured) = match answer {
                    ModelOutput::Structured(value) => (value.to_string(), Some(value)),
                    ModelOutput::Text(text) | ModelOutput::ToolCalls { content: text, .. } => (text, None),
                };
                transcript.push(Message::assistant(text.clone()).with_model(&model));
                return Ok(AgentOutput { text, structured, messages: transcript });
            };

            let (raw, coerced) = match &answer {
                ModelOutput::Structured(value) => (value.to_string(), schema.coerce(value)),
                ModelOutput::Text(text) | ModelOutput::ToolCalls { content: text, .. } => {
                    (text.clone(), schema.coerce_text(text))
                }
            };

            match coerced {
                Ok(value) => {
                    let text = serde_json::to_string(&value)?;
                    transcript.push(
                        Message::assistant(text.clone())
                            .with_model(&model)
                            .with_extra("structured_response", value.clone()),
                    );
                    return Ok(AgentOutput { text, structured: Some(value), messages: transcript });
                }
                Err(reason) if reformat_attempts < self.config.max_reformat_retries => {
                    reformat_attempts += 1;
                    tracing::warn!(thread = %thread_id, schema = %schema.name, "Answer did not match schema, asking to reformat: {}", reason);
                    transcript.push(Message::assistant(raw).with_model(&model));
                    transcript.push(Message::user(schema.reformat_instruction(&reason)));
                }
                Err(reason) => {
                    return Err(AgentError::SchemaValidation {
                        schema: schema.name.clone(),
                        reason,
                    });
                }
            }
        }

        tracing::warn!(thread = %thread_id, max = self.config.max_iterations, "Iteration cap reached");
        Err(AgentError::MaxIterations(self.config.max_iterations))
    }

    /// Provider call bounded by the configured timeout
    async fn call_provider(&self, request: &CompletionRequest) -> Result<Completion> {
        let timeout = self.config.provider_timeout;
        match tokio::time::timeout(timeout, self.provider.complete(request, &self.config.generation)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(timeout)),
        }
    }

    /// Execute a tool call, turning every failure into a result the model
    /// can read. The error is returned alongside for budget accounting.
    async fn execute_tool(
        &self,
        thread_id: &ThreadId,
        call: &ToolCall,
        ctx: &RequestContext,
    ) -> (ToolResult, Option<AgentError>) {
        let started = Instant::now();
        let (result, error) = match self.tools.execute(call, ctx).await {
            Ok(result) => (result, None),
            Err(e) => {
                let mut result = ToolResult::failure(call.name.clone(), format!("Error: {}", e));
                result.id = call.id.clone();
                (result, Some(e))
            }
        };

        self.emit(TraceEvent::ToolCall {
            thread_id: thread_id.to_string(),
            tool: call.name.clone(),
            call_id: call.id.clone(),
            duration: started.elapsed(),
            success: result.success,
            output: result.output.clone(),
        });

        (result, error)
    }

    async fn compact(
        &self,
        thread_id: &ThreadId,
        mut transcript: Vec<Message>,
        config: &SummarizationConfig,
    ) -> Result<Vec<Message>> {
        let Some(split) = compaction::plan(&transcript, config) else {
            return Ok(transcript);
        };

        let request = compaction::summary_request(config, &transcript[..split]);
        let completion = self.call_provider(&request).await?;
        let summary = compaction::summary_text(&completion.output);

        let tail = transcript.split_off(split);
        tracing::info!(thread = %thread_id, summarized = split, kept = tail.len(), "Summarized thread history");
        Ok(compaction::apply(&summary, tail))
    }

    /// Hand an event to the sink; a panicking sink is logged and ignored
    fn emit(&self, event: TraceEvent) {
        let sink = &self.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.record(event))).is_err() {
            tracing::warn!("Trace sink panicked, event dropped");
        }
    }

    fn trace_model_call(
        &self,
        thread_id: &ThreadId,
        iteration: usize,
        completion: Option<&Completion>,
        started: Instant,
        outcome: ModelCallOutcome,
    ) {
        self.emit(TraceEvent::ModelCall {
            thread_id: thread_id.to_string(),
            iteration,
            model: completion.map_or_else(|| self.config.generation.model.clone(), |c| c.model.clone()),
            duration: started.elapsed(),
            usage: completion.and_then(|c| c.usage),
            outcome,
        });
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the thread store
    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    /// Get the provider
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    store: Option<Arc<dyn ThreadStore>>,
    sink: Option<Arc<dyn TraceSink>>,
    tools: ToolRegistry,
    config: AgentConfig,
    registration_error: Option<AgentError>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            store: None,
            sink: None,
            tools: ToolRegistry::new(),
            config: AgentConfig::default(),
            registration_error: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Thread store (defaults to an in-memory store)
    pub fn store(mut self, store: Arc<dyn ThreadStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Trace sink (defaults to logging through `tracing`)
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Register a tool; a duplicate name fails `build`
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        if let Err(e) = self.tools.register(tool) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn generation(mut self, generation: GenerationOptions) -> Self {
        self.config.generation = generation;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout = timeout;
        self
    }

    pub fn tool_error_budget(mut self, budget: usize) -> Self {
        self.config.tool_error_budget = budget;
        self
    }

    pub fn max_reformat_retries(mut self, retries: usize) -> Self {
        self.config.max_reformat_retries = retries;
        self
    }

    /// Coerce final answers into `T`
    pub fn response_format<T: StructuredResponse>(mut self) -> Self {
        self.config.response_schema = Some(ResponseSchema::of::<T>());
        self
    }

    pub fn summarization(mut self, config: SummarizationConfig) -> Self {
        self.config.summarization = Some(config);
        self
    }

    pub fn build(self) -> Result<Agent> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryThreadStore::new()));
        let agent = Agent::new(provider, Arc::new(self.tools), store, self.config);

        Ok(match self.sink {
            Some(sink) => agent.with_trace_sink(sink),
            None => agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Role, unanswered_tool_calls};
    use crate::mock::ScriptedProvider;
    use crate::tool::{FnTool, ParameterSchema, ToolSchema};
    use crate::trace::NoopSink;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Forecast {
        punny_response: String,
        #[serde(default)]
        weather_conditions: Option<String>,
    }

    impl StructuredResponse for Forecast {
        fn name() -> &'static str {
            "Forecast"
        }

        fn description() -> &'static str {
            "A punny forecast"
        }

        fn fields() -> Vec<ParameterSchema> {
            vec![
                ParameterSchema::required("punny_response", "string", "A pun"),
                ParameterSchema::optional("weather_conditions", "string", "Conditions"),
            ]
        }

        fn validate(&self) -> std::result::Result<(), String> {
            if self.punny_response.trim().is_empty() {
                return Err("punny_response must not be empty".into());
            }
            Ok(())
        }
    }

    fn location_tool() -> FnTool {
        FnTool::new(
            ToolSchema {
                name: "get_user_location".into(),
                description: "Retrieve the user's location".into(),
                parameters: vec![],
                category: None,
                has_side_effects: false,
                context_keys: vec!["user_id".into()],
            },
            |_call, ctx| {
                let user_id: String = ctx.get("user_id")?;
                Ok(if user_id == "1" { "Florida" } else { "SF" }.to_string())
            },
        )
    }

    fn weather_tool() -> FnTool {
        FnTool::new(
            ToolSchema {
                name: "get_weather_for_location".into(),
                description: "Get weather for a given city".into(),
                parameters: vec![ParameterSchema::required("city", "string", "City name")],
                category: None,
                has_side_effects: false,
                context_keys: vec![],
            },
            |call, _ctx| Ok(format!("It's always sunny in {}!", call.str_arg("city").unwrap_or_default())),
        )
    }

    fn failing_tool() -> FnTool {
        FnTool::new(
            ToolSchema {
                name: "flaky".into(),
                description: "Always fails".into(),
                parameters: vec![],
                category: None,
                has_side_effects: true,
                context_keys: vec![],
            },
            |_call, _ctx| Err(AgentError::ToolExecution("upstream down".into())),
        )
    }

    fn user_ctx(id: &str) -> Option<RequestContext> {
        Some(RequestContext::new().with("user_id", id))
    }

    fn agent_with(provider: Arc<ScriptedProvider>) -> AgentBuilder {
        AgentBuilder::new()
            .provider(provider)
            .trace_sink(Arc::new(NoopSink))
            .tool(location_tool())
            .tool(weather_tool())
    }

    #[tokio::test]
    async fn test_unseen_thread_starts_empty() {
        let provider = Arc::new(ScriptedProvider::new().then_text("Hello!"));
        let agent = agent_with(provider.clone()).build().unwrap();

        let out = agent
            .invoke(&"fresh".into(), vec![Message::user("hi")], user_ctx("1"))
            .await
            .unwrap();

        let requests = provider.requests();
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].content, "hi");
        assert_eq!(out.text, "Hello!");
        assert_eq!(out.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_second_turn_loads_first_transcript() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call(ToolCall::new("get_user_location"))
                .then_text("Sunny where you are")
                .then_text("You're welcome"),
        );
        let agent = agent_with(provider.clone()).build().unwrap();
        let thread = ThreadId::new("1");

        let first = agent
            .invoke(&thread, vec![Message::user("what is the weather outside?")], user_ctx("1"))
            .await
            .unwrap();
        let persisted = agent.store().load(&thread).await.unwrap();
        assert_eq!(persisted.len(), first.messages.len());

        agent
            .invoke(&thread, vec![Message::user("thank you!")], user_ctx("1"))
            .await
            .unwrap();

        let last_request = provider.requests().pop().unwrap();
        assert_eq!(last_request.messages.len(), persisted.len() + 1);
        for (sent, saved) in last_request.messages.iter().zip(&persisted) {
            assert_eq!(sent.role, saved.role);
            assert_eq!(sent.content, saved.content);
        }
        assert_eq!(last_request.messages.last().unwrap().content, "thank you!");
    }

    #[tokio::test]
    async fn test_tool_results_follow_calls() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then(ModelOutput::ToolCalls {
                    content: String::new(),
                    calls: vec![
                        ToolCall::new("get_user_location"),
                        ToolCall::new("get_weather_for_location").with_arg("city", "Florida"),
                    ],
                })
                .then_text("Sunny!"),
        );
        let agent = agent_with(provider.clone()).build().unwrap();

        let out = agent
            .invoke(&"t".into(), vec![Message::user("weather?")], user_ctx("1"))
            .await
            .unwrap();

        let roles: Vec<Role> = out.messages.iter().map(|m| m.role.clone()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]);
        assert!(unanswered_tool_calls(&out.messages).is_empty());
        assert_eq!(out.messages[2].content, "Florida");
        assert_eq!(out.messages[3].content, "It's always sunny in Florida!");

        // the model never saw a dangling call
        for request in provider.requests() {
            assert!(unanswered_tool_calls(&request.messages).is_empty());
        }
    }

    #[tokio::test]
    async fn test_structured_answer_is_coerced() {
        let provider = Arc::new(ScriptedProvider::new().then_structured(serde_json::json!({
            "punny_response": "Sun-believable!",
        })));
        let agent = agent_with(provider.clone())
            .response_format::<Forecast>()
            .build()
            .unwrap();

        let out = agent
            .invoke(&"s".into(), vec![Message::user("weather?")], user_ctx("2"))
            .await
            .unwrap();

        let forecast: Forecast = out.parse().unwrap();
        assert_eq!(forecast.punny_response, "Sun-believable!");
        assert_eq!(forecast.weather_conditions, None);
        assert_eq!(provider.requests()[0].response_schema.as_ref().unwrap().name, "Forecast");
    }

    #[tokio::test]
    async fn test_exactly_one_reformat_retry() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("It is sunny, no JSON for you")
                .then_structured(serde_json::json!({"punny_response": ""}))
                .then_text("never reached"),
        );
        let agent = agent_with(provider.clone())
            .response_format::<Forecast>()
            .build()
            .unwrap();
        let thread = ThreadId::new("schema");

        let err = agent
            .invoke(&thread, vec![Message::user("weather?")], user_ctx("1"))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::SchemaValidation { .. }));
        assert_eq!(provider.call_count(), 2);
        assert!(agent.store().load(&thread).await.unwrap().is_empty());

        // the retry carried the reformat request
        let retry = &provider.requests()[1];
        assert!(retry.messages.last().unwrap().content.contains("'Forecast'"));
    }

    #[tokio::test]
    async fn test_reformat_retry_survives_iteration_cap() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call(ToolCall::new("get_weather_for_location").with_arg("city", "SF"))
                .then_text("not json")
                .then_text("still not json"),
        );
        let agent = agent_with(provider.clone())
            .response_format::<Forecast>()
            .max_iterations(2)
            .build()
            .unwrap();

        let err = agent
            .invoke(&"cap".into(), vec![Message::user("weather?")], user_ctx("1"))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::SchemaValidation { .. }));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_reformat_retry_recovers() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("sunny")
                .then_text(r#"{"punny_response": "Shore is sunny", "weather_conditions": "sunny"}"#),
        );
        let agent = agent_with(provider.clone())
            .response_format::<Forecast>()
            .build()
            .unwrap();

        let out = agent
            .invoke(&"r".into(), vec![Message::user("weather?")], user_ctx("1"))
            .await
            .unwrap();
        assert_eq!(out.structured.unwrap()["weather_conditions"], "sunny");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let provider = Arc::new(ScriptedProvider::new().repeating(ModelOutput::ToolCalls {
            content: String::new(),
            calls: vec![ToolCall::new("get_weather_for_location").with_arg("city", "SF")],
        }));
        let agent = agent_with(provider.clone()).max_iterations(3).build().unwrap();
        let thread = ThreadId::new("loop");

        let err = agent
            .invoke(&thread, vec![Message::user("again and again")], user_ctx("1"))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::MaxIterations(3)));
        assert_eq!(provider.call_count(), 3);
        assert!(agent.store().load(&thread).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call(ToolCall::new("get_horoscope"))
                .then_text("Sorry, I can't do that"),
        );
        let agent = agent_with(provider.clone()).build().unwrap();

        let out = agent
            .invoke(&"u".into(), vec![Message::user("horoscope?")], user_ctx("1"))
            .await
            .unwrap();

        let tool_msg = &out.messages[2];
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.content.contains("Tool not found: get_horoscope"));
        assert_eq!(out.text, "Sorry, I can't do that");
    }

    #[tokio::test]
    async fn test_tool_error_budget() {
        let provider = Arc::new(ScriptedProvider::new().repeating(ModelOutput::ToolCalls {
            content: String::new(),
            calls: vec![ToolCall::new("flaky")],
        }));
        let agent = agent_with(provider.clone()).tool(failing_tool()).build().unwrap();

        let err = agent
            .invoke(&"f".into(), vec![Message::user("go")], user_ctx("1"))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ToolExecution(_)));
        // first failure fed back, the retry failed too
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_parallel_failures_are_fed_back_together() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then(ModelOutput::ToolCalls {
                    content: String::new(),
                    calls: vec![
                        ToolCall::new("flaky").with_id("a"),
                        ToolCall::new("flaky").with_id("b"),
                    ],
                })
                .then_text("I could not do it"),
        );
        let agent = agent_with(provider.clone()).tool(failing_tool()).build().unwrap();

        let out = agent
            .invoke(&"batch".into(), vec![Message::user("go")], user_ctx("1"))
            .await
            .unwrap();

        assert_eq!(out.text, "I could not do it");
        assert_eq!(provider.call_count(), 2);
        let answered: Vec<Option<&str>> = out
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(Message::tool_call_id)
            .collect();
        assert_eq!(answered, vec![Some("a"), Some("b")]);
        assert!(provider.requests()[1].messages[3].content.contains("upstream down"));
    }

    #[tokio::test]
    async fn test_provider_error_persists_nothing() {
        let provider = Arc::new(ScriptedProvider::new().then_text("first").then_fail("503"));
        let agent = agent_with(provider.clone()).build().unwrap();
        let thread = ThreadId::new("p");

        agent.invoke(&thread, vec![Message::user("one")], user_ctx("1")).await.unwrap();
        let err = agent
            .invoke(&thread, vec![Message::user("two")], user_ctx("1"))
            .await
            .unwrap_err();

        assert!(err.is_provider_error());
        let persisted = agent.store().load(&thread).await.unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].content, "one");
    }

    #[tokio::test]
    async fn test_provider_timeout() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("too late")
                .with_delay(Duration::from_millis(500)),
        );
        let agent = agent_with(provider)
            .provider_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let thread = ThreadId::new("slow");

        let err = agent
            .invoke(&thread, vec![Message::user("hello")], user_ctx("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(agent.store().load(&thread).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_invocation_persists_nothing() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("never delivered")
                .with_delay(Duration::from_millis(500)),
        );
        let agent = agent_with(provider).build().unwrap();
        let thread = ThreadId::new("cancel");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            agent.invoke(&thread, vec![Message::user("hello")], user_ctx("1")),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(agent.store().load(&thread).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_context_is_config_error() {
        let provider = Arc::new(ScriptedProvider::new().then_text("unused"));
        let agent = agent_with(provider.clone()).build().unwrap();

        let err = agent
            .invoke(&"c".into(), vec![Message::user("where am I?")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("user_id")));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let provider = Arc::new(ScriptedProvider::new());
        let agent = agent_with(provider).build().unwrap();
        let err = agent.invoke(&"e".into(), vec![], user_ctx("1")).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let provider = Arc::new(ScriptedProvider::new());
        let result = agent_with(provider).tool(weather_tool()).build();
        assert!(matches!(result, Err(AgentError::Config(_))));

        assert!(matches!(AgentBuilder::new().build(), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_same_thread_invocations_serialize() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .repeating(ModelOutput::Text("ok".into()))
                .with_delay(Duration::from_millis(30)),
        );
        let agent = agent_with(provider).build().unwrap();
        let thread = ThreadId::new("shared");

        let (a, b) = tokio::join!(
            agent.invoke(&thread, vec![Message::user("a")], user_ctx("1")),
            agent.invoke(&thread, vec![Message::user("b")], user_ctx("1")),
        );
        a.unwrap();
        b.unwrap();

        // neither turn was lost to a concurrent overwrite
        assert_eq!(agent.store().load(&thread).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_distinct_threads_run_concurrently() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .repeating(ModelOutput::Text("ok".into()))
                .with_delay(Duration::from_millis(200)),
        );
        let agent = agent_with(provider).build().unwrap();
        let (left, right) = (ThreadId::new("left"), ThreadId::new("right"));

        let started = Instant::now();
        let (a, b) = tokio::join!(
            agent.invoke(&left, vec![Message::user("a")], user_ctx("1")),
            agent.invoke(&right, vec![Message::user("b")], user_ctx("2")),
        );
        a.unwrap();
        b.unwrap();

        // one provider delay, not two back to back
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(agent.store().load(&left).await.unwrap().len(), 2);
        assert_eq!(agent.store().load(&right).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_summarization_replaces_old_history() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("Florida weather chat. ".repeat(10))
                .then_text("The user lives in Florida.")
                .then_text("You asked about the weather"),
        );
        let agent = agent_with(provider.clone())
            .summarization(SummarizationConfig::new(40, 1))
            .build()
            .unwrap();
        let thread = ThreadId::new("long");

        // first turn is small enough to skip summarization
        let first = agent
            .invoke(&thread, vec![Message::user("hi")], user_ctx("1"))
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 2);

        let second = agent
            .invoke(&thread, vec![Message::user("Do you remember my first question?")], user_ctx("1"))
            .await
            .unwrap();

        // summary request, then the model call on the compacted transcript
        let requests = provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].tools.is_empty());
        assert!(requests[1].messages[0].content.contains("Florida weather chat."));
        assert!(second.messages[0].content.starts_with(compaction::SUMMARY_PREFIX));
        assert_eq!(second.messages[1].content, "Do you remember my first question?");
        assert_eq!(agent.store().load(&thread).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_ask_is_stateless() {
        let provider = Arc::new(ScriptedProvider::new().then_text("42"));
        let agent = AgentBuilder::new().provider(provider).build().unwrap();

        let out = agent.ask("meaning of life?").await.unwrap();
        assert_eq!(out.text, "42");
        assert!(agent.store().list(10).await.unwrap().is_empty());
    }
}
