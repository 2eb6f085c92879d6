//! Relay binary: follows a NEO node and pushes decoded notifications of the
//! configured program to WebSocket subscribers.

use std::{io, sync::Arc};

use notify_relay::{run_relay, HttpNodeClient, RelayError, RpcLedger};
use notify_relay_domain::{
    config::{LedgerConfig, RelayConfig},
    services::telemetry::{init_telemetry, TelemetryConfig},
};
use notify_relay_storage::SeaOrmStorage;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[relay] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), RelayError> {
    let ledger_config = LedgerConfig::load_from_env()?;
    let relay_config = RelayConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("RELAY");
    init_telemetry(&telemetry_config)?;

    info!(
        network = %ledger_config.network(),
        rpc = ledger_config.rpc_url(),
        "opening ledger"
    );
    let storage = SeaOrmStorage::connect(ledger_config.database_url()).await?;
    let node = HttpNodeClient::new(ledger_config.rpc_url())?;
    let ledger = RpcLedger::open(
        node,
        storage,
        [*relay_config.program_id()],
        ledger_config.start_height(),
        ledger_config.max_blocks_per_tick(),
    )
    .await?;

    run_relay(
        relay_config,
        ledger_config.persist_interval(),
        Arc::new(ledger),
        shutdown_signal(),
    )
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
