//! Process liveness gates: the store must accept a TCP connection, the bus
//! management API must answer 200, and every monitored queue must be under
//! its depth threshold. Served on each service's main HTTP port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const STORE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Bus monitoring settings, taken from the environment. Flattened into each
/// service's CLI.
#[derive(Debug, Clone, clap::Args)]
pub struct LivenessArgs {
    /// Base URL of the bus management API.
    #[arg(
        long = "rabbitmq-host",
        env = "RABBITMQ_HOST",
        default_value = "http://127.0.0.1:15672"
    )]
    pub management_url: String,
    /// Maximum tolerated ready-message depth per monitored queue.
    #[arg(long = "rabbitmq-threshold", env = "RABBITMQ_THRESHOLD", default_value = "500")]
    pub depth_threshold: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum GateFailure {
    #[error("store is unreachable at {addr}: {detail}")]
    Store { addr: String, detail: String },
    #[error("bus management API is unhealthy: {0}")]
    BusApi(String),
    #[error("queue '{queue}' depth {depth} exceeds threshold {threshold}")]
    QueueDepth {
        queue: String,
        depth: u64,
        threshold: u64,
    },
}

/// Wire body of the health endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub code: u16,
    pub description: String,
}

pub struct Gates {
    store_host: String,
    store_port: u16,
    config: LivenessArgs,
    queues: Vec<String>,
    client: reqwest::Client,
    /// Set once the one-per-process warm-up grace for the depth check has
    /// been spent.
    warmed_up: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    messages: u64,
}

impl Gates {
    pub fn new(
        store_host: impl Into<String>,
        store_port: u16,
        config: LivenessArgs,
        queues: impl IntoIterator<Item = impl Into<String>>,
    ) -> Gates {
        Gates {
            store_host: store_host.into(),
            store_port,
            config,
            queues: queues.into_iter().map(Into::into).collect(),
            client: reqwest::Client::new(),
            warmed_up: AtomicBool::new(false),
        }
    }

    pub async fn check(&self) -> Result<(), GateFailure> {
        self.check_store().await?;
        self.check_bus_api().await?;

        // The very first check per process skips queue depth, so a backlog
        // accumulated while the process was down can drain.
        if !self.warmed_up.swap(true, Ordering::SeqCst) {
            tracing::info!("first liveness check; skipping queue depth gates");
            return Ok(());
        }
        for queue in &self.queues {
            self.check_queue_depth(queue).await?;
        }
        Ok(())
    }

    async fn check_store(&self) -> Result<(), GateFailure> {
        let addr = format!("{}:{}", self.store_host, self.store_port);
        let connect = tokio::net::TcpStream::connect(&addr);
        match tokio::time::timeout(STORE_TIMEOUT, connect).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(error)) => Err(GateFailure::Store {
                addr,
                detail: error.to_string(),
            }),
            Err(_elapsed) => Err(GateFailure::Store {
                addr,
                detail: format!("no connection within {STORE_TIMEOUT:?}"),
            }),
        }
    }

    async fn check_bus_api(&self) -> Result<(), GateFailure> {
        let response = self
            .client
            .get(&self.config.management_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|error| GateFailure::BusApi(error.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GateFailure::BusApi(format!("status {}", response.status())))
        }
    }

    async fn check_queue_depth(&self, queue: &str) -> Result<(), GateFailure> {
        let url = format!(
            "{}/api/queues/%2F/{queue}",
            self.config.management_url.trim_end_matches('/')
        );
        let info: QueueInfo = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| GateFailure::BusApi(error.to_string()))?
            .json()
            .await
            .map_err(|error| GateFailure::BusApi(error.to_string()))?;

        if info.messages <= self.config.depth_threshold {
            Ok(())
        } else {
            Err(GateFailure::QueueDepth {
                queue: queue.to_string(),
                depth: info.messages,
                threshold: self.config.depth_threshold,
            })
        }
    }
}

/// `GET /healthz` router serving the gate verdict.
pub fn healthz_router(gates: Arc<Gates>) -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/healthz", get(healthz))
        .with_state(gates)
}

#[tracing::instrument(skip_all)]
async fn healthz(
    axum::extract::State(gates): axum::extract::State<Arc<Gates>>,
) -> (axum::http::StatusCode, axum::Json<HealthBody>) {
    match gates.check().await {
        Ok(()) => (
            axum::http::StatusCode::OK,
            axum::Json(HealthBody {
                code: 200,
                description: "all gates passing".to_string(),
            }),
        ),
        Err(failure) => {
            tracing::warn!(%failure, "liveness gate failed");
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(HealthBody {
                    code: 503,
                    description: failure.to_string(),
                }),
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn gates() -> Gates {
        Gates::new(
            "127.0.0.1",
            1, // reserved port; nothing listens here
            LivenessArgs {
                management_url: "http://127.0.0.1:1".to_string(),
                depth_threshold: 500,
            },
            ["nq2ds"],
        )
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_the_gate() {
        let result = gates().check().await;
        assert!(matches!(result, Err(GateFailure::Store { .. })), "{result:?}");
    }

    #[test]
    fn test_warmup_flag_is_spent_once() {
        let gates = gates();
        assert!(!gates.warmed_up.swap(true, Ordering::SeqCst));
        assert!(gates.warmed_up.swap(true, Ordering::SeqCst));
    }
}
