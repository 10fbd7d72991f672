use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;

/// Subscription fan-out service: matches committed notifications against
/// watches and delivers webhooks to subscribers.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Port serving healthz and metrics.
    #[arg(long, env = "FANOUT_PORT", default_value = "8003")]
    port: u16,
    /// Envelope encryption master key, hex-encoded.
    #[arg(long = "master-key", env = "MASTER_KEY", hide_env_values = true)]
    master_key: String,
    /// Concurrent fan-out workers.
    #[arg(long = "workers", env = "FANOUT_WORKERS", default_value = "2")]
    workers: usize,
    /// Delivery attempts per subscriber before giving up.
    #[arg(long = "delivery-attempts", env = "DELIVERY_ATTEMPTS", default_value = "5")]
    delivery_attempts: u32,
    /// Permanent failures tolerated before a subscription is disabled.
    #[arg(long = "failure-threshold", env = "SUBSCRIPTION_FAILURE_THRESHOLD", default_value = "10")]
    failure_threshold: i32,
    /// Minutes between janitor sweeps of expired subscriptions.
    #[arg(long = "janitor-period-minutes", env = "JANITOR_PERIOD_MINUTES", default_value = "10")]
    janitor_period_minutes: u64,

    #[command(flatten)]
    bus: bus::BusArgs,
    #[command(flatten)]
    pg: pnp_sql::PgArgs,
    #[command(flatten)]
    liveness: monitoring::LivenessArgs,
    #[command(flatten)]
    telemetry: monitoring::TelemetryArgs,
}

const QUEUE: &str = "pnp.fanout";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    monitoring::init_tracing(&cli.telemetry);
    tracing::info!(port = cli.port, workers = cli.workers, "starting fan-out");

    let master_key =
        envelope::MasterKey::from_hex(&cli.master_key).context("MASTER_KEY must be valid hex")?;
    let pool = cli.pg.connect("fanout").await?;

    let deliverer = fanout::deliver::Deliverer::new(
        reqwest::Client::new(),
        pool.clone(),
        cli.delivery_attempts.max(1),
        cli.failure_threshold.max(1),
    );
    let fanout = Arc::new(fanout::Fanout::new(pool.clone(), deliverer));

    // Share-able future which completes when the service should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let mut consumers = Vec::new();
    for _ in 0..cli.workers.max(1) {
        let consumer = bus::Consumer::new(
            cli.bus.clone(),
            master_key.clone(),
            QUEUE,
            [bus::topic::NOTIFICATION],
        );
        let fanout = fanout.clone();
        let shutdown = shutdown.clone();
        consumers.push(tokio::spawn(async move {
            consumer
                .serve(move |plaintext| {
                    let fanout = fanout.clone();
                    async move { fanout.handle(plaintext).await }
                }, shutdown)
                .await
        }));
    }

    let janitor = tokio::spawn(fanout::janitor::sweep_loop(
        pool,
        Duration::from_secs(cli.janitor_period_minutes.max(1) * 60),
        shutdown.clone(),
    ));

    let gates = Arc::new(monitoring::Gates::new(
        cli.pg.host.clone(),
        cli.pg.port,
        cli.liveness,
        [QUEUE],
    ));
    let router = monitoring::healthz_router(gates).merge(monitoring::metrics_router(&cli.telemetry));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .context("failed to bind server port")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone())
        .await?;

    for consumer in consumers {
        consumer.await.context("joining fan-out worker")??;
    }
    janitor.await.context("joining janitor")?;
    Ok(())
}
