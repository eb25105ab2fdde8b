//! Trace Events
//!
//! The loop reports every model call and tool call to a [`TraceSink`].
//! Recording is fire-and-forget: sinks return nothing and the loop never
//! waits on them.

use serde::Serialize;
use std::time::Duration;

use crate::provider::TokenUsage;

/// How a model call ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallOutcome {
    ToolCalls(usize),
    FinalAnswer,
    Failed(String),
}

/// One observable step of an invocation
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    ModelCall {
        thread_id: String,
        iteration: usize,
        model: String,
        duration: Duration,
        usage: Option<TokenUsage>,
        outcome: ModelCallOutcome,
    },
    ToolCall {
        thread_id: String,
        tool: String,
        call_id: Option<String>,
        duration: Duration,
        success: bool,
        output: String,
    },
}

/// Receiver for trace events
///
/// `record` is called inline on the invocation's task and must return
/// quickly. It must not panic; the agent catches a panic, logs it and drops
/// the event, so a broken sink never fails an invocation.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Forwards events to `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&self, event: TraceEvent) {
        match event {
            TraceEvent::ModelCall { thread_id, iteration, model, duration, usage, outcome } => {
                tracing::info!(
                    thread = %thread_id,
                    iteration,
                    model = %model,
                    elapsed_ms = duration.as_millis() as u64,
                    total_tokens = usage.map(|u| u.total_tokens),
                    outcome = ?outcome,
                    "model call"
                );
            }
            TraceEvent::ToolCall { thread_id, tool, call_id, duration, success, .. } => {
                tracing::info!(
                    thread = %thread_id,
                    tool = %tool,
                    call_id = call_id.as_deref().unwrap_or("-"),
                    elapsed_ms = duration.as_millis() as u64,
                    success,
                    "tool call"
                );
            }
        }
    }
}

/// Discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn record(&self, _event: TraceEvent) {}
}
