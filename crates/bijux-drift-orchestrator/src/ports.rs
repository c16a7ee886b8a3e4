use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bijux_drift_analysis::{LinkOutcome, ProcessRunner};
use bijux_drift_model::{Fix, IssueId, IssueRecord, Severity, TicketId};
use bijux_drift_store::{Finding, IssueStore, StoreError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::VerifyCommand;
use crate::reporter::HumanSummary;
use crate::PortError;

/// Outbound issue tracker.
#[async_trait]
pub trait Ticketing: Send + Sync {
    async fn create_ticket(
        &self,
        summary: &str,
        description: &str,
        severity: Severity,
    ) -> Result<TicketId, PortError>;
}

/// Fire-and-forget notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &HumanSummary) -> Result<(), PortError>;
}

/// Project-level check run after a fix is applied. `Ok(false)` is a failed check.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    async fn verify(&self, fix: &Fix, root: &Path) -> Result<bool, PortError>;
}

/// Issue-record persistence used while a run syncs its findings. Calls are
/// blocking and run on the blocking pool.
pub trait IssueLedger: Send + Sync {
    fn record_finding(&self, finding: &Finding, now_ms: u64) -> Result<(IssueRecord, bool), StoreError>;
    fn link_duplicates(&self, id: &IssueId) -> Result<Option<LinkOutcome>, StoreError>;
    fn get(&self, id: &IssueId) -> Result<Option<IssueRecord>, StoreError>;
    fn attach_ticket(&self, id: &IssueId, ticket: &TicketId) -> Result<IssueRecord, StoreError>;
}

impl IssueLedger for IssueStore {
    fn record_finding(&self, finding: &Finding, now_ms: u64) -> Result<(IssueRecord, bool), StoreError> {
        IssueStore::record_finding(self, finding, now_ms)
    }

    fn link_duplicates(&self, id: &IssueId) -> Result<Option<LinkOutcome>, StoreError> {
        IssueStore::link_duplicates(self, id)
    }

    fn get(&self, id: &IssueId) -> Result<Option<IssueRecord>, StoreError> {
        IssueStore::get(self, id)
    }

    fn attach_ticket(&self, id: &IssueId, ticket: &TicketId) -> Result<IssueRecord, StoreError> {
        IssueStore::attach_ticket(self, id, ticket)
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[derive(Debug, Serialize)]
struct TicketRequest<'a> {
    summary: &'a str,
    description: &'a str,
    severity: &'a str,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    id: String,
}

/// Posts `{summary, description, severity}` and expects `{"id": ...}` back.
pub struct HttpTicketing {
    url: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpTicketing {
    #[must_use]
    pub fn new(url: &str, bearer: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            bearer,
            client: http_client(),
        }
    }

    fn auth_headers(&self) -> Result<HeaderMap, PortError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| PortError(format!("invalid auth header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Ticketing for HttpTicketing {
    #[instrument(name = "ticket_create", skip(self, description))]
    async fn create_ticket(
        &self,
        summary: &str,
        description: &str,
        severity: Severity,
    ) -> Result<TicketId, PortError> {
        let resp = self
            .client
            .post(&self.url)
            .headers(self.auth_headers()?)
            .json(&TicketRequest {
                summary,
                description,
                severity: severity.as_str(),
            })
            .send()
            .await
            .map_err(|e| PortError(format!("ticketing request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(PortError(format!("ticketing returned {}", resp.status())));
        }
        let body: TicketResponse = resp
            .json()
            .await
            .map_err(|e| PortError(format!("ticketing response unreadable: {e}")))?;
        TicketId::parse(&body.id).map_err(|e| PortError(e.to_string()))
    }
}

/// Tracker stand-in used when no ticketing url is configured. Ids are
/// derived from the summary so repeated runs agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunTicketing;

#[async_trait]
impl Ticketing for DryRunTicketing {
    async fn create_ticket(
        &self,
        summary: &str,
        _description: &str,
        severity: Severity,
    ) -> Result<TicketId, PortError> {
        let digest = bijux_drift_core::sha256_hex(summary.as_bytes());
        let id = format!("DRY-{}", &digest[..10]);
        info!(ticket = %id, severity = severity.as_str(), "dry-run ticket");
        TicketId::parse(&id).map_err(|e| PortError(e.to_string()))
    }
}

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &HumanSummary) -> Result<(), PortError> {
        let resp = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .map_err(|e| PortError(format!("webhook request failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(PortError(format!("webhook returned {}", resp.status())))
        }
    }
}

/// Writes the summary to the log instead of a chat channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &HumanSummary) -> Result<(), PortError> {
        info!(title = %summary.title, facts = summary.facts.len(), "run summary");
        Ok(())
    }
}

/// Runs the configured command in the server root; exit status 0 passes.
pub struct CommandVerifier {
    command: VerifyCommand,
    runner: Arc<dyn ProcessRunner>,
}

impl CommandVerifier {
    #[must_use]
    pub fn new(command: VerifyCommand, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { command, runner }
    }
}

#[async_trait]
impl VerificationRunner for CommandVerifier {
    async fn verify(&self, fix: &Fix, root: &Path) -> Result<bool, PortError> {
        let runner = Arc::clone(&self.runner);
        let program = self.command.program.clone();
        let args = self.command.args.clone();
        let root = root.to_path_buf();
        let code = tokio::task::spawn_blocking(move || runner.run(&program, &args, &root))
            .await
            .map_err(|e| PortError(format!("verify task failed: {e}")))?
            .map_err(|e| PortError(e.to_string()))?;
        info!(fix = %fix.id, code, "verify command finished");
        Ok(code == 0)
    }
}

/// No project-level check; the per-fix file checks decide alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

#[async_trait]
impl VerificationRunner for NoopVerifier {
    async fn verify(&self, _fix: &Fix, _root: &Path) -> Result<bool, PortError> {
        Ok(true)
    }
}
