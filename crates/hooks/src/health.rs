//! Background health for the hook ingress. A loop probes the upstream hook
//! source, the bus, and the downstream CIEBot on a cadence; the healthz
//! handler only reads the recorded observations, so requests never block on
//! external probing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use monitoring::HealthBody;

/// A gate observation older than this is stale.
const FRESHNESS: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, clap::Args)]
pub struct HealthArgs {
    /// Upstream hook source probed for reachability.
    #[arg(
        long = "hooks-upstream-url",
        env = "HOOKS_UPSTREAM_URL",
        default_value = "http://127.0.0.1:8080/health"
    )]
    pub upstream_url: String,
    /// Downstream CIEBot endpoint probed for reachability.
    #[arg(
        long = "ciebot-url",
        env = "CIEBOT_URL",
        default_value = "http://127.0.0.1:8081/health"
    )]
    pub ciebot_url: String,
    #[arg(long = "hooks-probe-period-secs", env = "HOOKS_PROBE_PERIOD_SECS", default_value = "20")]
    pub probe_period_secs: u64,
}

#[derive(Debug, Default)]
struct LastOk {
    upstream: Option<Instant>,
    bus: Option<Instant>,
    ciebot: Option<Instant>,
}

pub struct HookHealth {
    config: HealthArgs,
    client: reqwest::Client,
    last_ok: Mutex<LastOk>,
}

impl HookHealth {
    pub fn new(config: HealthArgs) -> HookHealth {
        HookHealth {
            config,
            client: reqwest::Client::new(),
            last_ok: Mutex::new(LastOk::default()),
        }
    }

    /// Names of the gates without a fresh healthy observation.
    pub fn stale_gates(&self) -> Vec<&'static str> {
        let last_ok = self.last_ok.lock().unwrap();
        let now = Instant::now();
        let fresh = |at: &Option<Instant>| {
            at.is_some_and(|at| now.saturating_duration_since(at) < FRESHNESS)
        };

        let mut stale = Vec::new();
        if !fresh(&last_ok.upstream) {
            stale.push("upstream");
        }
        if !fresh(&last_ok.bus) {
            stale.push("bus");
        }
        if !fresh(&last_ok.ciebot) {
            stale.push("ciebot");
        }
        stale
    }

    async fn probe_once(&self, publisher: &bus::Publisher) {
        if self.probe_url(&self.config.upstream_url).await {
            self.last_ok.lock().unwrap().upstream = Some(Instant::now());
        }
        // A sealed probe message exercises the bus end to end, not merely
        // the connection.
        match publisher.publish(bus::topic::PROBE, b"probe").await {
            Ok(()) => self.last_ok.lock().unwrap().bus = Some(Instant::now()),
            Err(error) => tracing::warn!(%error, "bus probe failed"),
        }
        if self.probe_url(&self.config.ciebot_url).await {
            self.last_ok.lock().unwrap().ciebot = Some(Instant::now());
        }
    }

    async fn probe_url(&self, url: &str) -> bool {
        let result = self
            .client
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(%url, %error, "health probe failed");
                false
            }
        }
    }
}

/// Probe loop; runs until `shutdown` resolves.
pub async fn probe_loop(app: Arc<crate::App>, shutdown: impl std::future::Future<Output = ()>) {
    let period = Duration::from_secs(app.health.config.probe_period_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => return,
            _ = ticker.tick() => app.health.probe_once(&app.publisher).await,
        }
    }
}

pub async fn healthz(
    State(app): State<Arc<crate::App>>,
) -> (StatusCode, axum::Json<HealthBody>) {
    let stale = app.health.stale_gates();
    if stale.is_empty() {
        (
            StatusCode::OK,
            axum::Json(HealthBody {
                code: 200,
                description: "upstream, bus, and ciebot healthy".to_string(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(HealthBody {
                code: 503,
                description: format!("no recent healthy probe for: {}", stale.join(", ")),
            }),
        )
    }
}
