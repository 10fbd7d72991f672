use lazy_static::lazy_static;
use prometheus::IntGaugeVec;

lazy_static! {
    static ref PROCESS_INFO: IntGaugeVec = prometheus::register_int_gauge_vec!(
        "pnp_process_info",
        "Constant 1, labelled with the deployment telemetry of this process.",
        &["app", "deployed_env", "cluster_region"]
    )
    .unwrap();
}

/// `GET /metrics` router rendering the default registry, plus the process
/// info gauge for the given telemetry labels.
pub fn metrics_router(telemetry: &super::TelemetryArgs) -> axum::Router<()> {
    use axum::routing::get;

    PROCESS_INFO
        .with_label_values(&[
            &telemetry.app_name,
            &telemetry.deployed_env,
            &telemetry.cluster_region,
        ])
        .set(1);

    axum::Router::new().route("/metrics", get(prometheus_metrics))
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics() -> (axum::http::StatusCode, String) {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::default_registry().gather())
    {
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Ok(result) => (axum::http::StatusCode::OK, result),
    }
}
