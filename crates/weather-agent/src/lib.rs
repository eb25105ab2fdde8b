//! # weather-agent
//!
//! Weather forecaster built on `agent-core`: two tools, a caller context
//! carrying the user id, and a structured [`WeatherResponse`] answer.
//!
//! ```text
//! user: "what is the weather outside?"      (thread "1", user_id "1")
//!   └─ get_user_location()              -> "Florida"
//!   └─ get_weather_for_location(Florida) -> "It's always sunny in Florida!"
//!   └─ WeatherResponse { punny_response, weather_conditions }
//! ```

pub mod model;
pub mod svckit;

use std::sync::Arc;

use agent_core::{
    Agent, AgentBuilder, LlmProvider, Result, ThreadStore, ToolRegistry,
    compaction::SummarizationConfig,
};

pub use model::{WeatherContext, WeatherResponse};

/// Re-export tools for easy registration
pub mod tools {
    pub use crate::svckit::{GetUserLocationTool, GetWeatherForLocationTool};
}

/// System prompt for the plain forecaster served over HTTP
pub const WEATHER_FORECASTER_PROMPT: &str = r#"You are an expert weather forecaster.

You have access to two tools:

- get_weather_for_location: use this to get the weather for a specific location
- get_user_location: use this to get the user's location

If a user asks you for the weather, make sure you know the location. If you can tell from the question that they mean wherever they are, use the get_user_location tool to find their location.

After you retrieve the weather information, provide a friendly response to the user."#;

/// System prompt for the punny forecaster
pub const PUNNY_FORECASTER_PROMPT: &str = r#"You are an expert weather forecaster, who speaks in puns.

You have access to two tools:

- get_weather_for_location: use this to get the weather for a specific location
- get_user_location: use this to get the user's location

If a user asks you for the weather, make sure you know the location. If you can tell from the question that they mean wherever they are, use the get_user_location tool to find their location."#;

/// Registry holding both weather tools
pub fn weather_tools() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(tools::GetUserLocationTool)?;
    registry.register(tools::GetWeatherForLocationTool)?;
    Ok(registry)
}

fn builder(provider: Arc<dyn LlmProvider>, store: Arc<dyn ThreadStore>) -> Result<AgentBuilder> {
    let model = provider.info().default_model;
    Ok(AgentBuilder::new()
        .provider(provider)
        .model(model)
        .store(store)
        .tools(weather_tools()?)
        .temperature(0.0)
        .response_format::<WeatherResponse>())
}

/// Forecaster agent answering with [`WeatherResponse`]
pub fn weather_agent(provider: Arc<dyn LlmProvider>, store: Arc<dyn ThreadStore>) -> Result<Agent> {
    builder(provider, store)?
        .system_prompt(WEATHER_FORECASTER_PROMPT)
        .build()
}

/// Punny forecaster that summarizes its history once it grows past
/// `summarize_after` estimated tokens, keeping only the newest message
pub fn punny_weather_agent(
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn ThreadStore>,
    summarize_after: u32,
) -> Result<Agent> {
    builder(provider, store)?
        .system_prompt(PUNNY_FORECASTER_PROMPT)
        .summarization(SummarizationConfig::new(summarize_after, 1))
        .build()
}
