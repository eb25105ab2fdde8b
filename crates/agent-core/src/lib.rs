//! # agent-core
//!
//! Tool-calling agent loop with provider-agnostic LLM abstraction, a static
//! tool registry, thread-keyed conversation state and structured output.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Agent                               │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │  Reasoning  │  │    Tools    │  │   LlmProvider        │  │
//! │  │    Loop     │──│   Registry  │──│   (Strategy)         │  │
//! │  └──────┬──────┘  └─────────────┘  └──────────────────────┘  │
//! │         │                                                    │
//! │  ┌──────┴──────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │ ThreadStore │  │  Response   │  │   TraceSink          │  │
//! │  │ (per id)    │  │  Schema     │  │   (fire-and-forget)  │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Provider, tools and store are built once at startup and injected into the
//! [`Agent`]; nothing is global.

pub mod compaction;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod message;
pub mod mock;
pub mod provider;
pub mod reasoning;
pub mod schema;
pub mod thread;
pub mod tool;
pub mod trace;

pub use context::RequestContext;
pub use error::{AgentError, Result};
pub use message::{Message, Role};
pub use provider::{Completion, CompletionRequest, GenerationOptions, LlmProvider, ModelOutput};
pub use reasoning::{Agent, AgentBuilder, AgentConfig, AgentOutput};
pub use schema::{ResponseSchema, StructuredResponse};
pub use thread::{FileThreadStore, MemoryThreadStore, ThreadId, ThreadStore};
pub use tool::{FnTool, ParameterSchema, Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};
pub use trace::{LogSink, NoopSink, TraceEvent, TraceSink};
