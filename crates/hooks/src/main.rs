use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use std::sync::Arc;

/// Hook ingestion service: webhook ingress for the notification pipeline.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Port serving the hook routes, healthz, and metrics.
    #[arg(long, env = "HOOKS_PORT", default_value = "8000")]
    port: u16,
    /// Expected bearer token on the ServiceNow paths.
    #[arg(long = "snow-token", env = "SNOW_TOKEN", hide_env_values = true)]
    snow_token: String,
    /// Envelope encryption master key, hex-encoded.
    #[arg(long = "master-key", env = "MASTER_KEY", hide_env_values = true)]
    master_key: String,

    #[command(flatten)]
    bus: bus::BusArgs,
    #[command(flatten)]
    pg: pnp_sql::PgArgs,
    #[command(flatten)]
    liveness: monitoring::LivenessArgs,
    #[command(flatten)]
    telemetry: monitoring::TelemetryArgs,
    #[command(flatten)]
    health: hooks::health::HealthArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    monitoring::init_tracing(&cli.telemetry);
    tracing::info!(port = cli.port, "starting hook ingestion");

    let master_key =
        envelope::MasterKey::from_hex(&cli.master_key).context("MASTER_KEY must be valid hex")?;

    let app = Arc::new(hooks::App {
        publisher: bus::Publisher::new(cli.bus, master_key),
        snow_token: cli.snow_token,
        bad_auth: auth::BadAuthCache::new(),
        decisions: auth::DecisionCache::new(),
        health: hooks::health::HookHealth::new(cli.health),
    });
    let gates = Arc::new(monitoring::Gates::new(
        cli.pg.host.clone(),
        cli.pg.port,
        cli.liveness,
        Vec::<String>::new(),
    ));

    // Share-able future which completes when the service should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let probes = tokio::spawn(hooks::health::probe_loop(app.clone(), shutdown.clone()));

    let router = hooks::build_router(app)
        .merge(monitoring::healthz_router(gates))
        .merge(monitoring::metrics_router(&cli.telemetry));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .context("failed to bind server port")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    probes.await.context("joining probe loop")?;
    Ok(())
}
