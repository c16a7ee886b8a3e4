use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bijux_drift_core::MachineError;
use bijux_drift_model::{ApprovalDecision, FixId, RunId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{now_ms, OrchestratorError, PortError};

/// Inbound accept/reject decision for a run's pending fix set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalSignal {
    pub decision: ApprovalDecision,
    pub source: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRun {
    pub run_id: RunId,
    pub fix_ids: Vec<FixId>,
    pub since_ms: u64,
}

struct Waiter {
    pending: PendingRun,
    tx: oneshot::Sender<ApprovalSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    UnknownRun(RunId),
}

impl std::fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRun(id) => write!(f, "no approval pending for run {id}"),
        }
    }
}

impl std::error::Error for ApprovalError {}

/// Pending approvals keyed by run id. Each run consumes at most one signal.
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    waiters: Arc<Mutex<BTreeMap<RunId, Waiter>>>,
}

impl ApprovalBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RunId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces any earlier registration for the same run.
    pub fn register(&self, run_id: &RunId, fix_ids: Vec<FixId>) -> oneshot::Receiver<ApprovalSignal> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingRun {
            run_id: run_id.clone(),
            fix_ids,
            since_ms: now_ms(),
        };
        self.lock().insert(run_id.clone(), Waiter { pending, tx });
        rx
    }

    pub fn submit(
        &self,
        run_id: &RunId,
        decision: ApprovalDecision,
        source: &str,
    ) -> Result<PendingRun, ApprovalError> {
        let waiter = self
            .lock()
            .remove(run_id)
            .ok_or_else(|| ApprovalError::UnknownRun(run_id.clone()))?;
        let signal = ApprovalSignal {
            decision,
            source: source.to_string(),
            at_ms: now_ms(),
        };
        if waiter.tx.send(signal).is_err() {
            // the run stopped waiting between lookup and send
            return Err(ApprovalError::UnknownRun(run_id.clone()));
        }
        info!(run_id = %run_id, decision = decision.as_str(), source, "approval received");
        Ok(waiter.pending)
    }

    pub fn withdraw(&self, run_id: &RunId) {
        self.lock().remove(run_id);
    }

    #[must_use]
    pub fn pending(&self) -> Vec<PendingRun> {
        self.lock().values().map(|w| w.pending.clone()).collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct ApprovalBody {
    pub decision: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalAck {
    pub run_id: RunId,
    pub decision: ApprovalDecision,
    pub fix_ids: Vec<FixId>,
}

fn machine_error(status: StatusCode, err: MachineError) -> Response {
    (status, Json(err)).into_response()
}

pub async fn approval_handler(
    State(broker): State<ApprovalBroker>,
    Path(run_id): Path<String>,
    Json(body): Json<ApprovalBody>,
) -> Response {
    let run_id = match RunId::parse(&run_id) {
        Ok(id) => id,
        Err(err) => {
            return machine_error(
                StatusCode::BAD_REQUEST,
                MachineError::new("invalid_run_id", &err.to_string()),
            )
        }
    };
    let decision = match ApprovalDecision::parse(&body.decision) {
        Ok(d) => d,
        Err(err) => {
            return machine_error(
                StatusCode::BAD_REQUEST,
                MachineError::new("invalid_decision", &err.to_string()),
            )
        }
    };
    let source = body.source.as_deref().unwrap_or("http");
    match broker.submit(&run_id, decision, source) {
        Ok(pending) => (
            StatusCode::ACCEPTED,
            Json(ApprovalAck {
                run_id,
                decision,
                fix_ids: pending.fix_ids,
            }),
        )
            .into_response(),
        Err(err) => machine_error(
            StatusCode::NOT_FOUND,
            MachineError::new("approval_not_pending", &err.to_string())
                .with_detail("run_id", run_id.as_str()),
        ),
    }
}

pub async fn pending_handler(State(broker): State<ApprovalBroker>) -> Json<Vec<PendingRun>> {
    Json(broker.pending())
}

pub fn approval_router(broker: ApprovalBroker) -> Router {
    Router::new()
        .route("/v1/runs/pending", get(pending_handler))
        .route("/v1/runs/:run_id/approval", post(approval_handler))
        .with_state(broker)
}

/// Serves the approval routes until `shutdown` flips to true. Returns the
/// bound address, which differs from `addr` when port 0 was requested.
pub async fn serve_approvals(
    addr: SocketAddr,
    broker: ApprovalBroker,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>), OrchestratorError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| OrchestratorError::Io(format!("bind {addr} failed: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| OrchestratorError::Io(format!("local addr unavailable: {e}")))?;
    info!(addr = %local, "approval endpoint listening");
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, approval_router(broker)).with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Err(err) = serve.await {
            warn!(error = %err, "approval endpoint stopped");
        }
    });
    Ok((local, handle))
}

/// Client side of the approval endpoint, used by `bijux-drift approve`.
pub async fn send_approval(
    base_url: &str,
    run_id: &RunId,
    decision: ApprovalDecision,
) -> Result<ApprovalAck, PortError> {
    let url = format!("{}/v1/runs/{run_id}/approval", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "decision": decision.as_str(), "source": "cli" }))
        .send()
        .await
        .map_err(|e| PortError(format!("approval request failed: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PortError(format!("approval rejected with {status}: {body}")));
    }
    resp.json()
        .await
        .map_err(|e| PortError(format!("approval response unreadable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunId {
        RunId::parse("nightly_1").expect("run id")
    }

    fn fix_id() -> FixId {
        FixId::parse("fix_0123456789abcdef").expect("fix id")
    }

    #[tokio::test]
    async fn submit_reaches_the_registered_waiter_once() {
        let broker = ApprovalBroker::new();
        let rx = broker.register(&run(), vec![fix_id()]);
        assert_eq!(broker.pending().len(), 1);

        let pending = broker
            .submit(&run(), ApprovalDecision::Accept, "test")
            .expect("submit");
        assert_eq!(pending.fix_ids, vec![fix_id()]);
        let signal = rx.await.expect("signal");
        assert_eq!(signal.decision, ApprovalDecision::Accept);
        assert!(broker.pending().is_empty());
        assert_eq!(
            broker.submit(&run(), ApprovalDecision::Reject, "test"),
            Err(ApprovalError::UnknownRun(run()))
        );
    }

    #[tokio::test]
    async fn withdrawn_runs_no_longer_accept_signals() {
        let broker = ApprovalBroker::new();
        let _rx = broker.register(&run(), Vec::new());
        broker.withdraw(&run());
        assert!(broker.submit(&run(), ApprovalDecision::Accept, "test").is_err());
    }

    #[tokio::test]
    async fn handler_maps_bad_input_and_unknown_runs() {
        let broker = ApprovalBroker::new();
        let bad_decision = approval_handler(
            State(broker.clone()),
            Path("nightly_1".to_string()),
            Json(ApprovalBody {
                decision: "maybe".to_string(),
                source: None,
            }),
        )
        .await;
        assert_eq!(bad_decision.status(), StatusCode::BAD_REQUEST);

        let unknown = approval_handler(
            State(broker.clone()),
            Path("nightly_1".to_string()),
            Json(ApprovalBody {
                decision: "accept".to_string(),
                source: None,
            }),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let rx = broker.register(&run(), vec![fix_id()]);
        let ok = approval_handler(
            State(broker.clone()),
            Path("nightly_1".to_string()),
            Json(ApprovalBody {
                decision: "reject".to_string(),
                source: Some("ops".to_string()),
            }),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::ACCEPTED);
        let signal = rx.await.expect("signal");
        assert_eq!(signal.decision, ApprovalDecision::Reject);
        assert_eq!(signal.source, "ops");
    }
}
