use std::io::Write;

use futures_util::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_model_backends::ChatMessage;

/// Reports backend health and the active model. Any command-line arguments
/// are joined into a prompt that is streamed through the active model.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_model_backends=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = agent_model_backends::build_state();

    let listing = state.registry.list_backends().await;
    println!("{}", serde_json::to_string_pretty(&listing)?);
    if listing.values().all(|status| !status.available) {
        warn!("no backend is reachable");
    }

    let model_id = state.loader.active_model_id()?;
    info!(
        model = %model_id,
        backend = %state.registry.active_backend_name().unwrap_or_default(),
        "active selection"
    );

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if !prompt.trim().is_empty() {
        let llm = state.loader.load_llm(Some(&model_id)).await?;
        let mut stream = llm.stream(&[ChatMessage::user(prompt)]).await?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = stream.next().await {
            write!(stdout, "{}", chunk?.content)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
    }

    match state.metrics.render() {
        Ok(body) => info!(metrics = %body, "session metrics"),
        Err(error) => warn!(error = %error, "metrics render failed"),
    }
    Ok(())
}
