//! Hook ingestion: authenticated per-source webhook endpoints that seal the
//! raw body and put it on the bus. No local persistence; a request is
//! acknowledged only once its message is safely published.

pub mod health;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::Utc;
use lazy_static::lazy_static;
use models::RawEnvelope;
use prometheus::{IntCounter, IntCounterVec};

lazy_static! {
    static ref ACCEPTED: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_hooks_accepted_total",
        "Hook payloads accepted and published, by topic.",
        &["topic"]
    )
    .unwrap();
    static ref AUTH_REJECTED: IntCounter = prometheus::register_int_counter!(
        "pnp_hooks_auth_rejected_total",
        "Hook requests rejected for a missing or invalid bearer token."
    )
    .unwrap();
}

pub struct App {
    pub publisher: bus::Publisher,
    pub snow_token: String,
    pub bad_auth: auth::BadAuthCache,
    pub decisions: auth::DecisionCache,
    pub health: health::HookHealth,
}

/// Decision-cache reason codes for the hook bearer check.
const REASON_VALIDATED: u8 = 0;
const REASON_TOKEN_MISMATCH: u8 = 1;
const DECISION_TTL: std::time::Duration = std::time::Duration::from_secs(300);

pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    use axum::routing::{get, post};

    let snow = axum::Router::new()
        .route("/cases", post(snow_cases))
        .route("/incidents", post(snow_incidents))
        .route("/bspn", post(snow_bspn))
        .route("/changes", post(snow_changes))
        .route_layer(axum::middleware::from_fn_with_state(
            app.clone(),
            authorize_snow,
        ));

    axum::Router::new()
        .route("/api/v1/doctor/maintenances", post(doctor_maintenances))
        .nest("/api/v1/snow", snow)
        .route("/api/v1/ghe/announcements", post(ghe_announcements))
        .route("/api/v1/pnp/hooks/healthz", get(health::healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

async fn doctor_maintenances(State(app): State<Arc<App>>, body: RawBody) -> axum::response::Response {
    accept(&app, "doctor", bus::topic::MAINTENANCE, body).await
}

async fn snow_cases(State(app): State<Arc<App>>, body: RawBody) -> axum::response::Response {
    accept(&app, "servicenow", bus::topic::CASE, body).await
}

async fn snow_incidents(State(app): State<Arc<App>>, body: RawBody) -> axum::response::Response {
    accept(&app, "servicenow", bus::topic::INCIDENT, body).await
}

// BSPNs ride the incident topic: they are incident notifications whose
// recency collation happens at fan-out.
async fn snow_bspn(State(app): State<Arc<App>>, body: RawBody) -> axum::response::Response {
    accept(&app, "servicenow", bus::topic::INCIDENT, body).await
}

async fn snow_changes(State(app): State<Arc<App>>, body: RawBody) -> axum::response::Response {
    accept(&app, "servicenow", bus::topic::CHANGE, body).await
}

async fn ghe_announcements(State(app): State<Arc<App>>, body: RawBody) -> axum::response::Response {
    accept(&app, "ghe", bus::topic::ANNOUNCEMENT, body).await
}

/// The raw request body, or the 400 its unreadability earns.
type RawBody = Result<Bytes, axum::extract::rejection::BytesRejection>;

/// Wrap the raw body with its source and arrival time, then publish. The
/// body stays opaque here; adapters normalize it downstream.
async fn accept(app: &App, source: &str, topic: &str, body: RawBody) -> axum::response::Response {
    let body = match body {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(%source, %error, "failed to read hook request body");
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };
    let envelope = RawEnvelope {
        source: source.to_string(),
        received_at: Utc::now(),
        body: body.to_vec(),
    };
    let plaintext = match serde_json::to_vec(&envelope) {
        Ok(plaintext) => plaintext,
        Err(error) => {
            tracing::error!(%source, %error, "failed to encode raw envelope");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match app.publisher.publish(topic, &plaintext).await {
        Ok(()) => {
            ACCEPTED.with_label_values(&[topic]).inc();
            StatusCode::OK.into_response()
        }
        Err(error) => {
            tracing::error!(%source, %topic, %error, "failed to publish hook payload");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// Bearer gate for the ServiceNow paths. Failed tokens land in the negative
// cache so repeat offenders are turned away without comparison.
async fn authorize_snow(
    State(app): State<Arc<App>>,
    bearer: Option<
        axum_extra::TypedHeader<
            axum_extra::headers::Authorization<axum_extra::headers::authorization::Bearer>,
        >,
    >,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let token = bearer.as_ref().map(|b| b.token()).unwrap_or("");

    if let Some(decision) = app.decisions.get(token) {
        if decision.permitted {
            return next.run(req).await;
        }
        AUTH_REJECTED.inc();
        return (StatusCode::UNAUTHORIZED, "recently rejected token").into_response();
    }
    if app.bad_auth.contains(token) {
        AUTH_REJECTED.inc();
        return (StatusCode::UNAUTHORIZED, "recently rejected token").into_response();
    }
    if !auth::token_matches(token, &app.snow_token) {
        app.bad_auth.add(token);
        app.decisions
            .set(token, false, DECISION_TTL, REASON_TOKEN_MISMATCH);
        AUTH_REJECTED.inc();
        return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
    }
    app.decisions
        .set(token, true, DECISION_TTL, REASON_VALIDATED);
    next.run(req).await
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> Arc<App> {
        let bus_config = bus::BusArgs {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
            fallback_url: None,
            amqps_endpoint: None,
            tls_cert: None,
            exchange: "pnp.direct".to_string(),
            exchange_type: "direct".to_string(),
            // Publishes become no-ops, so router tests need no broker.
            enabled: false,
        };
        let master_key = envelope::MasterKey::from_hex(&hex_key()).unwrap();
        Arc::new(App {
            publisher: bus::Publisher::new(bus_config, master_key),
            snow_token: "snow-secret".to_string(),
            bad_auth: auth::BadAuthCache::new(),
            decisions: auth::DecisionCache::new(),
            health: health::HookHealth::new(health::HealthArgs {
                upstream_url: "http://127.0.0.1:1".to_string(),
                ciebot_url: "http://127.0.0.1:1".to_string(),
                probe_period_secs: 20,
            }),
        })
    }

    fn hex_key() -> String {
        "00".repeat(32)
    }

    #[tokio::test]
    async fn test_doctor_hook_accepts_without_token() {
        let response = build_router(test_app())
            .oneshot(
                Request::post("/api/v1/doctor/maintenances")
                    .body(Body::from("{\"id\": \"M42\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_snow_hook_requires_bearer() {
        let app = test_app();

        let response = build_router(app.clone())
            .oneshot(
                Request::post("/api/v1/snow/incidents")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = build_router(app.clone())
            .oneshot(
                Request::post("/api/v1/snow/incidents")
                    .header("authorization", "Bearer wrong")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(app.bad_auth.contains("wrong"));

        let response = build_router(app)
            .oneshot(
                Request::post("/api/v1/snow/incidents")
                    .header("authorization", "Bearer snow-secret")
                    .body(Body::from("{\"number\": \"INC001\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_healthz_reports_unhealthy_before_first_probe() {
        let response = build_router(test_app())
            .oneshot(
                Request::get("/api/v1/pnp/hooks/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
