//! Transaction submitter service
//!
//! Wires the ledger adapter, signer, submission log and pipeline together,
//! then keeps the reservation sweeper and reconciliation loop running until
//! shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tx_submitter::chain::{EthersNode, LedgerNode};
use tx_submitter::config::Settings;
use tx_submitter::metrics::MetricsServer;
use tx_submitter::signer::{TransactionSigner, WalletSigner};
use tx_submitter::state::{MemoryLog, StateManager, SubmissionLog};
use tx_submitter::tx::{FeeEstimator, SequenceManager, SubmissionPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting transaction submitter v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        instance = %settings.submitter.instance_id,
        chain = %settings.chain.name,
        chain_id = settings.chain.chain_id,
        "Loaded configuration"
    );

    let node: Arc<dyn LedgerNode> = Arc::new(
        EthersNode::new(settings.chain.clone()).context("Failed to connect ledger providers")?,
    );

    let signer = Arc::new(
        WalletSigner::from_env(&settings.wallet.private_key_envs, settings.chain.chain_id)
            .context("Failed to load signing keys")?,
    );
    info!("Managing {} account(s)", signer.accounts().len());

    // Submission log: Postgres when configured, in-memory otherwise
    let (log, state_manager): (Arc<dyn SubmissionLog>, Option<Arc<StateManager>>) =
        match &settings.database {
            Some(database) => {
                let manager = Arc::new(StateManager::new(database).await?);
                info!("Database connection established");
                manager.run_migrations().await?;
                let log: Arc<dyn SubmissionLog> = manager.clone();
                (log, Some(manager))
            }
            None => {
                let log: Arc<dyn SubmissionLog> = Arc::new(MemoryLog::new());
                (log, None)
            }
        };

    let transaction_policy = settings.retry.transaction_policy();
    let rpc_policy = settings.retry.rpc_policy();

    let sequences = Arc::new(SequenceManager::new(
        node.clone(),
        settings.sequence.clone(),
        rpc_policy.clone(),
    ));
    let fees = Arc::new(FeeEstimator::new(
        node.clone(),
        settings.fees.clone(),
        rpc_policy.clone(),
    ));
    let pipeline = Arc::new(
        SubmissionPipeline::new(
            node.clone(),
            signer.clone(),
            log,
            sequences.clone(),
            fees,
            settings.pipeline.clone(),
        )
        .with_retry(transaction_policy, rpc_policy),
    );

    // Warm account state so the first submissions skip the resync
    for account in signer.accounts() {
        match sequences.repair(account).await {
            Ok(report) => info!(?account, next = report.current, "Account sequence loaded"),
            Err(e) => warn!(?account, error = %e, "Failed to load account sequence"),
        }
    }

    // Resolve broadcasts left over from a previous run
    match pipeline.reconcile().await {
        Ok(report) => info!(checked = report.checked, "Startup reconciliation complete"),
        Err(e) => warn!("Startup reconciliation failed: {}", e),
    }

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Reservation expiry sweep and idle account GC
    let sweeper_handle = sequences.spawn_sweeper(std::time::Duration::from_secs(
        settings.sequence.sweep_interval_secs,
    ));

    // Reconciliation loop
    let reconcile_handle = tokio::spawn({
        let pipeline = pipeline.clone();
        let state_manager = state_manager.clone();
        let interval = settings.submitter.reconcile_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                if let Err(e) = pipeline.reconcile().await {
                    warn!("Reconciliation failed: {}", e);
                }

                if let Some(manager) = &state_manager {
                    if let Err(e) = manager.health_check().await {
                        warn!("Database health check failed: {}", e);
                    }
                }
            }
        }
    });

    info!("Transaction submitter is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    sweeper_handle.abort();
    reconcile_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Transaction submitter stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_submitter=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
