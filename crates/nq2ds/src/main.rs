use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;

/// NQ2DS service: consumes typed notification messages and applies them to
/// the store as ordered, idempotent mutations.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Port serving healthz and metrics.
    #[arg(long, env = "NQ2DS_PORT", default_value = "8002")]
    port: u16,
    /// Envelope encryption master key, hex-encoded.
    #[arg(long = "master-key", env = "MASTER_KEY", hide_env_values = true)]
    master_key: String,
    /// Queue (and routing key) this consumer is bound to.
    #[arg(long = "nq-qkey", env = "NQ_QKEY", default_value = "nq2ds")]
    nq_qkey: String,
    /// Concurrent consumer workers.
    #[arg(long = "workers", env = "NQ2DS_WORKERS", default_value = "4")]
    workers: usize,
    /// Skip local persistence of ServiceNow data.
    #[arg(
        long = "bypass-local-storage",
        env = "BYPASS_LOCAL_STORAGE",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    bypass_local_storage: bool,
    /// Days tombstoned rows are retained before the sweep removes them.
    #[arg(long = "retention-days", env = "RETENTION_DAYS", default_value = "90")]
    retention_days: u32,

    #[command(flatten)]
    bus: bus::BusArgs,
    #[command(flatten)]
    pg: pnp_sql::PgArgs,
    #[command(flatten)]
    liveness: monitoring::LivenessArgs,
    #[command(flatten)]
    telemetry: monitoring::TelemetryArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    monitoring::init_tracing(&cli.telemetry);
    tracing::info!(port = cli.port, workers = cli.workers, "starting nq2ds");

    let master_key =
        envelope::MasterKey::from_hex(&cli.master_key).context("MASTER_KEY must be valid hex")?;
    let pool = cli.pg.connect("nq2ds").await?;
    let publisher = Arc::new(bus::Publisher::new(cli.bus.clone(), master_key.clone()));

    let worker = Arc::new(nq2ds::Worker {
        pool: pool.clone(),
        publisher,
        bypass_snow_storage: cli.bypass_local_storage,
    });

    // Share-able future which completes when the service should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    // Independent workers; each owns its channel to the bus.
    let mut consumers = Vec::new();
    for _ in 0..cli.workers.max(1) {
        let consumer = bus::Consumer::new(
            cli.bus.clone(),
            master_key.clone(),
            cli.nq_qkey.clone(),
            [cli.nq_qkey.clone()],
        );
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        consumers.push(tokio::spawn(async move {
            consumer
                .serve(move |plaintext| {
                    let worker = worker.clone();
                    async move { worker.handle(plaintext).await }
                }, shutdown)
                .await
        }));
    }

    let sweeper = tokio::spawn(nq2ds::retention::sweep_loop(
        pool,
        cli.retention_days,
        shutdown.clone(),
    ));

    let gates = Arc::new(monitoring::Gates::new(
        cli.pg.host.clone(),
        cli.pg.port,
        cli.liveness,
        [cli.nq_qkey.clone()],
    ));
    let router = monitoring::healthz_router(gates).merge(monitoring::metrics_router(&cli.telemetry));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .context("failed to bind server port")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone())
        .await?;

    for consumer in consumers {
        consumer.await.context("joining consumer worker")??;
    }
    sweeper.await.context("joining retention sweep")?;
    Ok(())
}
