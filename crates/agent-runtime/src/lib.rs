//! # agent-runtime
//!
//! Runtime providers for the agent loop.
//!
//! ## Providers
//!
//! - **OpenAI** (default): any Chat Completions compatible endpoint
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::OpenAiProvider;
//!
//! let provider = OpenAiProvider::from_env()?;
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(provider))
//!     .build()?;
//! ```

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "openai")]
pub use openai::{OpenAiConfig, OpenAiProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, LlmProvider, Message, Result, Role, ThreadId, ThreadStore, Tool,
    ToolRegistry,
};
