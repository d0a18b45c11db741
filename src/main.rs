use std::sync::Arc;
use std::time::Duration;

use dripline::config::Config;
use dripline::engine::Orchestrator;
use dripline::gateway::HttpGatewayFactory;
use dripline::llm::OpenAiGenerator;
use dripline::secrets::SealedVault;
use dripline::store::Database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📨 Dripline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Bridges: {}", config.bridge_urls.join(", "));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Cycle interval: {}s\n", config.loop_seconds);

    let db = Arc::new(Database::open(&config.db_path).unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
        std::process::exit(1);
    }));

    let vault = Arc::new(SealedVault::from_env(Arc::clone(&db)).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let factory = Arc::new(HttpGatewayFactory::new(
        client.clone(),
        config.bridge_urls.clone(),
    ));
    let generator = Arc::new(OpenAiGenerator::new(
        client,
        config.openai_api_key,
        config.model,
    ));

    let orchestrator = Orchestrator::new(
        db,
        vault,
        factory,
        generator,
        config.auto_approve_pending,
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.loop_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = orchestrator.run_once().await {
            tracing::error!(error = %e, "Cycle failed");
        }
    }
}
