//! Service Kit - Agent Tools
//!
//! Domain tools that implement `agent_core::Tool` for the weather agent.

mod user_location;
mod weather_lookup;

pub use user_location::GetUserLocationTool;
pub use weather_lookup::GetWeatherForLocationTool;
