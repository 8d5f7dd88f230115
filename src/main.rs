use aeromx::config::Config;
use aeromx::gateway::OpenAiCompatibleProvider;
use aeromx::orchestrator::Runtime;
use aeromx::store::Database;
use aeromx::{logging, server};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_from_env()?;
    let _log_guard = logging::init(&config.logging)?;
    tracing::info!(version = aeromx::VERSION, "aeromx orchestrator starting");

    let database = Database::connect(&config.database.path).await?;
    database.run_migrations().await?;

    let provider = Arc::new(
        OpenAiCompatibleProvider::new(
            config.gateway.base_url.clone(),
            config.gateway.api_key.clone(),
        )
        .map_err(|e| anyhow::anyhow!("provider setup failed: {e}"))?,
    );

    let runtime = Runtime::new(config, &database, provider);
    server::start_server(runtime).await
}
