use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;

/// Adapter / reconciler service: polls authoritative sources and normalizes
/// raw hook payloads into typed messages for the consumer.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Port serving healthz and metrics.
    #[arg(long, env = "ADAPTERS_PORT", default_value = "8001")]
    port: u16,
    /// Envelope encryption master key, hex-encoded.
    #[arg(long = "master-key", env = "MASTER_KEY", hide_env_values = true)]
    master_key: String,
    /// Routing key the NQ2DS consumer is bound to.
    #[arg(long = "nq-qkey", env = "NQ_QKEY", default_value = "nq2ds")]
    nq_qkey: String,
    /// Minutes between reconcile ticks.
    #[arg(long = "reconcile-period-minutes", env = "RECONCILE_PERIOD_MINUTES", default_value = "60")]
    reconcile_period_minutes: u64,
    /// Base URL of the Doctor maintenance source.
    #[arg(long = "doctor-url", env = "DOCTOR_URL", default_value = "http://127.0.0.1:8080")]
    doctor_url: String,
    /// Base URL of the OSS catalog.
    #[arg(long = "catalog-url", env = "OSSCATALOG_URL", default_value = "http://127.0.0.1:8082")]
    catalog_url: String,
    /// URL of the manual service-name map, if any.
    #[arg(long = "name-map-url", env = "NAME_MAP_URL")]
    name_map_url: Option<String>,
    /// Languages requested from the catalog for display names.
    #[arg(long = "display-languages", env = "DISPLAY_LANGUAGES", value_delimiter = ',', default_value = "en")]
    languages: Vec<String>,

    #[command(flatten)]
    bus: bus::BusArgs,
    #[command(flatten)]
    pg: pnp_sql::PgArgs,
    #[command(flatten)]
    liveness: monitoring::LivenessArgs,
    #[command(flatten)]
    telemetry: monitoring::TelemetryArgs,
}

/// Raw hook topics this service normalizes, with their queue names.
const RAW_TOPICS: &[&str] = &[
    bus::topic::INCIDENT,
    bus::topic::MAINTENANCE,
    bus::topic::CASE,
    bus::topic::CHANGE,
    bus::topic::ANNOUNCEMENT,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    monitoring::init_tracing(&cli.telemetry);
    tracing::info!(port = cli.port, "starting adapters");

    let master_key =
        envelope::MasterKey::from_hex(&cli.master_key).context("MASTER_KEY must be valid hex")?;
    let pool = cli.pg.connect("adapters").await?;
    let publisher = Arc::new(bus::Publisher::new(cli.bus.clone(), master_key.clone()));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .context("building http client")?;

    let manual_map = adapters::names::load_manual_map(&client, cli.name_map_url.as_deref())
        .await
        .unwrap_or_else(|error| {
            tracing::warn!(%error, "manual name map unavailable; continuing without it");
            Default::default()
        });
    let resolver = adapters::names::NameResolver::new(
        adapters::names::HttpCatalog::new(client.clone(), cli.catalog_url.clone()),
        manual_map,
        cli.languages.clone(),
    );
    let doctor: Arc<dyn adapters::Adapter> = Arc::new(adapters::doctor::DoctorAdapter::new(
        client.clone(),
        cli.doctor_url.clone(),
        resolver,
    ));

    // Share-able future which completes when the service should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    // One normalizing consumer per raw topic.
    let mut tasks = Vec::new();
    for &topic in RAW_TOPICS {
        let consumer = bus::Consumer::new(
            cli.bus.clone(),
            master_key.clone(),
            format!("pnp.adapter.{topic}"),
            [topic],
        );
        tasks.push(tokio::spawn(adapters::scheduler::serve_raw_topic(
            consumer,
            publisher.clone(),
            topic,
            cli.nq_qkey.clone(),
            shutdown.clone(),
        )));
    }

    let scheduler = adapters::scheduler::Scheduler::new(
        pool,
        publisher,
        cli.nq_qkey.clone(),
        Duration::from_secs(cli.reconcile_period_minutes.max(1) * 60),
    );
    let reconcilers = tokio::spawn(scheduler.run(vec![doctor], shutdown.clone()));

    let gates = Arc::new(monitoring::Gates::new(
        cli.pg.host.clone(),
        cli.pg.port,
        cli.liveness,
        RAW_TOPICS.iter().map(|topic| format!("pnp.adapter.{topic}")),
    ));
    let router = monitoring::healthz_router(gates).merge(monitoring::metrics_router(&cli.telemetry));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .context("failed to bind server port")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone())
        .await?;

    reconcilers.await.context("joining reconcilers")?;
    for task in tasks {
        task.await.context("joining raw topic consumer")??;
    }
    Ok(())
}
