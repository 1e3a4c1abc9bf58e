use std::time::Duration;

use tokio_util::sync::CancellationToken;

use warden_backend::config::Config;
use warden_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(true)
            .init();
    }

    dotenvy::dotenv().ok();

    let config = Config::from_env();
    let state = AppState::new(config)?;

    // ── Startup gate: KV and vector store must answer before we serve ──
    if !state.kv.wait_until_ready(10, Duration::from_secs(1)).await {
        anyhow::bail!("KV store unavailable at startup");
    }
    if !state.vector.wait_until_ready(15, Duration::from_secs(1)).await {
        anyhow::bail!("vector store unavailable at startup");
    }
    state.vector.ensure_collections().await?;

    // ── Watchdog: heartbeat task + OS-thread sentinel ──
    state.watchdog.start();
    let _heartbeat = state.watchdog.spawn_heartbeat();

    // ── Daily maintenance scheduler ──
    let shutdown = CancellationToken::new();
    let _dream = state.dream.spawn(shutdown.clone());

    // ── Pull local models in the background when the server is up ──
    if state.local.is_available().await {
        let local = state.local.clone();
        tokio::spawn(async move { local.ensure_models_pulled().await });
    } else {
        tracing::warn!("startup: local inference server not reachable — cloud-only until it is");
    }

    print_banner();
    tracing::info!("Warden backend ready");

    shutdown_signal().await;

    shutdown.cancel();
    state.watchdog.stop();
    tracing::info!("Warden backend stopped");
    Ok(())
}

fn print_banner() {
    // Warden: bold cyan (36)
    println!();
    println!("  \x1b[1;36m>>>  WARDEN  <<<\x1b[0m");
    println!("  \x1b[36mSingle-node assistant runtime\x1b[0m");
    println!();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
