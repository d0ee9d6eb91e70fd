use manga_taskd::config::WorkerConfig;
use manga_taskd::transfer::WorkerClient;
use manga_taskd::transfer::worker::RemoteWorker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = WorkerConfig::from_env();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" if i + 1 < args.len() => {
                config.server_url = args[i + 1].clone();
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--server <url>]", args[0]);
                eprintln!("Configuration is read from WORKER_* environment variables (or .env).");
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    if config.upscaler_command.is_none() {
        tracing::warn!("TASKD_UPSCALER_COMMAND is not set, every leased task will fail");
    }
    tokio::fs::create_dir_all(&config.work_dir).await?;

    let client = WorkerClient::new(config.server_url.clone());
    match client.check_connection().await {
        Ok(pong) => tracing::info!("Connected to {} (server time {})", config.server_url, pong.server_time),
        Err(e) => tracing::warn!("Server {} not reachable yet: {:#}", config.server_url, e),
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, stopping worker");
            signal.cancel();
        }
    });

    RemoteWorker::new(client, config).run(shutdown).await;
    Ok(())
}
