use maskrelay::{config::Config, init_tracing, run, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.production);

    let shutdown = CancellationToken::new();
    let server = run(config, shutdown.clone()).await;

    shutdown_signal(shutdown.clone()).await;
    info!("stopping services");
    shutdown.cancel();

    // `server` itself enforces the grace window and forced abort (§4.E).
    let _ = server.await;

    Ok(())
}
