use finnie_orchestrator::{
    agent::Orchestrator,
    api::{start_server, ApiState},
    config::Settings,
    state::TaskContext,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    info!("Finnie API server");
    info!("Port: {}", settings.api_port);

    let orchestrator = Arc::new(Orchestrator::from_settings(&settings)?);
    let context = settings
        .input_folder
        .clone()
        .map(TaskContext::with_input_folder)
        .unwrap_or_default();

    let state = ApiState::new(orchestrator, settings.history_window, context);
    start_server(state, settings.api_port).await?;

    Ok(())
}
