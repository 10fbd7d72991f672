use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Deployment labels attached to metrics and logged at startup.
#[derive(Debug, Clone, clap::Args)]
pub struct TelemetryArgs {
    #[arg(long = "monitoring-app-name", env = "MONITORING_APP_NAME", default_value = "pnp")]
    pub app_name: String,
    #[arg(long = "deployed-env", env = "KUBE_APP_DEPLOYED_ENV", default_value = "dev")]
    pub deployed_env: String,
    #[arg(long = "cluster-region", env = "KUBE_CLUSTER_REGION", default_value = "local")]
    pub cluster_region: String,
    /// Verbose trace logging.
    #[arg(long, env = "DEBUG", default_value_t = false, action = clap::ArgAction::Set)]
    pub debug: bool,
}

/// Structured logs to stderr; `RUST_LOG` overrides, `DEBUG=true` lowers the
/// default directive.
pub fn init_tracing(telemetry: &TelemetryArgs) {
    let default = if telemetry.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        app = %telemetry.app_name,
        deployed_env = %telemetry.deployed_env,
        cluster_region = %telemetry.cluster_region,
        "telemetry configured"
    );
}
