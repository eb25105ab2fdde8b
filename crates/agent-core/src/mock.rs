//! Scripted Provider
//!
//! Replays a fixed sequence of model outputs and records every request it
//! receives. Used to drive the agent loop deterministically in tests and
//! offline demos.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::provider::{
    Completion, CompletionRequest, GenerationOptions, LlmProvider, ModelOutput, ProviderInfo,
    TokenUsage,
};
use crate::tool::ToolCall;

enum Step {
    Reply(ModelOutput),
    Fail(String),
}

/// Provider that answers from a script
#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<ModelOutput>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn then(self, output: ModelOutput) -> Self {
        self.push(Step::Reply(output))
    }

    /// Queue a plain-text final answer
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(ModelOutput::Text(text.into()))
    }

    /// Queue a structured final answer
    pub fn then_structured(self, value: serde_json::Value) -> Self {
        self.then(ModelOutput::Structured(value))
    }

    /// Queue a single tool call
    pub fn then_tool_call(self, call: ToolCall) -> Self {
        self.then(ModelOutput::ToolCalls {
            content: String::new(),
            calls: vec![call],
        })
    }

    /// Queue a provider failure
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.push(Step::Fail(message.into()))
    }

    /// Answer with `output` forever once the queue is drained
    pub fn repeating(mut self, output: ModelOutput) -> Self {
        self.repeat = Some(output);
        self
    }

    /// Sleep before every answer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push(self, step: Step) -> Self {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).push_back(step);
        self
    }

    fn next_step(&self) -> Option<Step> {
        let next = self.steps.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        next.or_else(|| self.repeat.clone().map(Step::Reply))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "Scripted".into(),
            endpoint: None,
            default_model: "scripted".into(),
            supports_tools: true,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        options: &GenerationOptions,
    ) -> Result<Completion> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_step() {
            Some(Step::Reply(output)) => {
                let prompt = crate::message::estimate_tokens(&request.messages);
                Ok(Completion::new(output, options.model.clone()).with_usage(TokenUsage::new(prompt, 16)))
            }
            Some(Step::Fail(message)) => Err(AgentError::Provider(message)),
            None => Err(AgentError::Provider("script exhausted".into())),
        }
    }
}
