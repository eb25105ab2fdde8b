//! Weather agent demo
//!
//! Replays a three-turn conversation on one thread against the configured
//! OpenAI-compatible endpoint and prints each structured answer.

use std::sync::Arc;

use agent_core::{FileThreadStore, MemoryThreadStore, Message, ThreadId, ThreadStore};
use agent_runtime::OpenAiProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weather_agent::{WeatherContext, WeatherResponse, punny_weather_agent};

const QUESTIONS: [&str; 3] = [
    "what is the weather outside?",
    "thank you!",
    "Do you remember my first question?",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let provider = Arc::new(OpenAiProvider::from_env()?);

    let store: Arc<dyn ThreadStore> = match std::env::var("THREAD_STORE_DIR") {
        Ok(dir) => {
            tracing::info!("Persisting threads under {}", dir);
            Arc::new(FileThreadStore::new(dir)?)
        }
        Err(_) => Arc::new(MemoryThreadStore::new()),
    };

    let agent = punny_weather_agent(provider, store, 200)?;
    let thread = ThreadId::new("1");
    let ctx = WeatherContext::new("1");

    for question in QUESTIONS {
        println!("> {}", question);
        let output = agent
            .invoke(&thread, vec![Message::user(question)], Some(ctx.to_context()))
            .await?;
        let answer: WeatherResponse = output.parse()?;
        println!("{:#?}", answer);
    }

    Ok(())
}
