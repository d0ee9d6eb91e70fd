use manga_taskd::config::EngineConfig;
use manga_taskd::engine::Engine;
use manga_taskd::engine::engine::{command_environment, open_store};
use manga_taskd::engine::handlers::router;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::from_env();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" if i + 1 < args.len() => {
                config.bind_addr = args[i + 1].parse::<SocketAddr>()?;
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--bind <addr:port>]", args[0]);
                eprintln!("Configuration is read from TASKD_* environment variables (or .env).");
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    tracing::info!("Starting manga-taskd on {}", config.bind_addr);
    tracing::info!("Compute lane mode: {:?}", config.compute_mode);

    // 1. Storage and environment:
    if let Some(parent) = config.database_path.as_ref().and_then(|p| p.parent()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.staging_dir)?;
    let store = open_store(&config)?;
    let environment = command_environment(&config);

    // 2. Engine (recovery, lanes, executors/broker, registry):
    let engine = Engine::start(&config, store, environment).await?;

    // 3. HTTP Router:
    let app = router(&engine);

    // 4. Start HTTP server:
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let shutdown = engine.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
