//! Trajectory Evaluation
//!
//! LLM-as-judge over a recorded transcript: the judge model reads the
//! trajectory (messages and tool calls) and returns a pass/fail verdict with
//! its reasoning.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;
use crate::provider::LlmProvider;
use crate::reasoning::{Agent, AgentBuilder};
use crate::schema::StructuredResponse;
use crate::tool::ParameterSchema;
use crate::trace::NoopSink;

const TRAJECTORY_ACCURACY_PROMPT: &str = "You are an expert grader of AI agent trajectories.

A trajectory is the ordered list of messages exchanged while an agent worked on a user's request, \
including every tool the agent called and what the tool returned.

Judge whether the trajectory is accurate and sensible:
- the tool calls make logical progress toward the user's goal,
- arguments passed to tools are justified by the conversation,
- the final answer is supported by the tool results,
- there are no unnecessary or repeated steps.

When a reference trajectory is given, the evaluated one need not match it exactly, \
but it must reach the same outcome by comparably reasonable steps.

Explain your reasoning, then give score true if the trajectory passes and false otherwise.";

/// The judge's answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryVerdict {
    /// Step-by-step justification
    pub reasoning: String,

    /// Whether the trajectory passes
    pub score: bool,
}

impl StructuredResponse for TrajectoryVerdict {
    fn name() -> &'static str {
        "TrajectoryVerdict"
    }

    fn description() -> &'static str {
        "Verdict on whether an agent trajectory is accurate"
    }

    fn fields() -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required("reasoning", "string", "Why the trajectory passes or fails"),
            ParameterSchema::required("score", "boolean", "true if the trajectory passes"),
        ]
    }
}

/// Render a transcript in the chat-completions shape graders expect
pub fn render_trajectory(messages: &[Message]) -> serde_json::Value {
    let rendered: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            let mut entry = serde_json::json!({
                "role": m.role.to_string(),
                "content": m.content,
            });
            if !m.calls().is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .calls()
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "function": {
                                "name": c.name,
                                "arguments": serde_json::to_string(&c.arguments).unwrap_or_default(),
                            }
                        })
                    })
                    .collect();
                entry["tool_calls"] = calls.into();
            }
            entry
        })
        .collect();
    rendered.into()
}

/// Grades trajectories with a judge model
pub struct TrajectoryEvaluator {
    judge: Agent,
}

impl TrajectoryEvaluator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Result<Self> {
        Self::with_prompt(provider, TRAJECTORY_ACCURACY_PROMPT)
    }

    /// Use a custom grading prompt
    pub fn with_prompt(provider: Arc<dyn LlmProvider>, prompt: impl Into<String>) -> Result<Self> {
        let judge = AgentBuilder::new()
            .provider(provider)
            .system_prompt(prompt)
            .temperature(0.0)
            .max_iterations(3)
            .response_format::<TrajectoryVerdict>()
            .trace_sink(Arc::new(NoopSink))
            .build()?;
        Ok(Self { judge })
    }

    /// Grade `outputs`, optionally against a reference trajectory
    pub async fn evaluate(
        &self,
        outputs: &[Message],
        reference: Option<&[Message]>,
    ) -> Result<TrajectoryVerdict> {
        let mut question = format!(
            "<trajectory>\n{}\n</trajectory>",
            serde_json::to_string_pretty(&render_trajectory(outputs))?
        );
        if let Some(reference) = reference {
            question.push_str(&format!(
                "\n<reference_trajectory>\n{}\n</reference_trajectory>",
                serde_json::to_string_pretty(&render_trajectory(reference))?
            ));
        }

        let verdict: TrajectoryVerdict = self.judge.ask(&question).await?.parse()?;
        tracing::info!(score = verdict.score, "Trajectory evaluated");
        Ok(verdict)
    }
}
