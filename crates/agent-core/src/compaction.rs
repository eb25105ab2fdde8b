//! History Summarization
//!
//! When a thread's transcript grows past a token threshold, everything but
//! the most recent messages is replaced by one model-written summary. The
//! functions here are pure; the agent performs the provider call.

use crate::message::{Message, Role, estimate_tokens};
use crate::provider::{CompletionRequest, ModelOutput};

/// Prefix of the system message that replaces summarized history
pub const SUMMARY_PREFIX: &str = "Summary of earlier conversation:";

const DEFAULT_SUMMARY_PROMPT: &str = "You compress chat transcripts. Summarize the conversation \
below in a few sentences, keeping names, places, facts returned by tools and any open questions. \
Reply with the summary only.";

/// When and how to summarize
#[derive(Clone, Debug)]
pub struct SummarizationConfig {
    /// Estimated transcript size that triggers a summary
    pub trigger_tokens: u32,

    /// Recent messages kept verbatim
    pub keep_messages: usize,

    /// System prompt for the summarizing call
    pub prompt: String,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: 4000,
            keep_messages: 6,
            prompt: DEFAULT_SUMMARY_PROMPT.into(),
        }
    }
}

impl SummarizationConfig {
    pub fn new(trigger_tokens: u32, keep_messages: usize) -> Self {
        Self {
            trigger_tokens,
            keep_messages,
            ..Default::default()
        }
    }
}

/// Index where the verbatim tail starts, or `None` if nothing to summarize.
///
/// The split never lands on a tool result, so a result always stays with
/// the assistant message that requested it.
pub fn plan(messages: &[Message], config: &SummarizationConfig) -> Option<usize> {
    if estimate_tokens(messages) <= config.trigger_tokens {
        return None;
    }

    // the newest message is always kept
    let mut split = messages.len().saturating_sub(config.keep_messages.max(1));
    while split > 0 && messages[split].role == Role::Tool {
        split -= 1;
    }

    (split > 0).then_some(split)
}

/// Render messages as plain text for the summarizer
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!("{}: {}\n", msg.role, msg.content));
        for call in msg.calls() {
            let args = serde_json::to_string(&call.arguments).unwrap_or_default();
            out.push_str(&format!("  (called {} with {})\n", call.name, args));
        }
    }
    out
}

/// Provider request that summarizes `head`
pub fn summary_request(config: &SummarizationConfig, head: &[Message]) -> CompletionRequest {
    CompletionRequest::new(config.prompt.clone(), vec![Message::user(render_transcript(head))])
}

/// Text of a summarizer reply
pub fn summary_text(output: &ModelOutput) -> String {
    match output {
        ModelOutput::Text(text) => text.trim().to_string(),
        ModelOutput::Structured(value) => value.to_string(),
        ModelOutput::ToolCalls { content, .. } => content.trim().to_string(),
    }
}

/// Replace the head of the transcript with a summary message
pub fn apply(summary: &str, tail: Vec<Message>) -> Vec<Message> {
    let mut result = Vec::with_capacity(tail.len() + 1);
    result.push(Message::system(format!("{}\n{}", SUMMARY_PREFIX, summary)));
    result.extend(tail);
    result
}
