use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sab_agent::AgentClient;
use sab_core::{bridge::Bridge, config::Config};
use sab_signal_cli::SignalCliTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sab_core::logging::init("sab").context("logging setup failed")?;

    let cfg = Arc::new(Config::load().context("configuration")?);
    info!(
        "using signal-cli at {}, agent at {}",
        cfg.signal_cli_path.display(),
        cfg.agent_url
    );

    let transport = Arc::new(SignalCliTransport::from_config(&cfg));
    let completion = Arc::new(AgentClient::from_config(&cfg).context("agent client")?);
    let bridge = Bridge::new(cfg, transport, completion);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    bridge.run(shutdown).await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
