//! Run state machine.
//!
//! A run moves Collecting → Analyzing → Planning → (AwaitingApproval) →
//! Applying ⇄ Verifying → Committed | RolledBack → Reporting → Done. Every
//! stage has its own deadline; a missed deadline, a cancellation or an
//! unrecoverable extractor failure sends the run straight to Reporting with
//! whatever it has so far. Item failures become notes in the report; only
//! control failures are recorded as `fatal`, and even those still report.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bijux_drift_analysis::{
    classify, compare, CodeInspector, EvidenceCollector, Fs, FsWrite, RealFs, RealProcessRunner,
    RemediationPlanner, SourceTreeInspector,
};
use bijux_drift_core::ExitCode;
use bijux_drift_extract::{
    ArtifactExtractor, ClientExtractor, ServerExtraction, ServerExtractor, ServerIndex,
    SpecExtractor,
};
use bijux_drift_model::{
    ApprovalDecision, ApprovalEvent, ArtifactKind, Classification, ClassificationKind,
    ContractModel, Evidence, Fix, FixStatus, IssueRecord, Mismatch, NoteKind, RunId, RunReport,
    RunReportDraft, RunState, Severity, Stage,
};
use bijux_drift_store::{Finding, IssueStore, RunLog};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{error, info, warn};

use crate::approval::{ApprovalBroker, ApprovalSignal};
use crate::config::OrchestratorConfig;
use crate::ports::{
    CommandVerifier, DryRunTicketing, HttpTicketing, IssueLedger, LogNotifier, NoopVerifier,
    Notifier, Ticketing, VerificationRunner, WebhookNotifier,
};
use crate::reporter::{render, summarize, write_artifacts, ArtifactPaths, HumanSummary};
use crate::{now_ms, OrchestratorError};

#[derive(Debug, Clone)]
pub struct RunInputs {
    pub spec: PathBuf,
    pub client: PathBuf,
    pub server: PathBuf,
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub summary: HumanSummary,
    pub artifacts: Option<ArtifactPaths>,
}

impl RunOutcome {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        if self.report.fatal.is_some() {
            ExitCode::Internal
        } else if self.report.counts.regressions_open > 0 {
            ExitCode::RegressionsOpen
        } else {
            ExitCode::Success
        }
    }
}

/// Sender half flips to `true` to cancel a run.
#[must_use]
pub fn cancellation() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // sender gone without cancelling: never fires
            std::future::pending::<()>().await;
        }
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn record_duration(draft: &mut RunReportDraft, stage: Stage, started: Instant) {
    *draft.stage_durations_ms.entry(stage).or_insert(0) += elapsed_ms(started);
}

fn advance(draft: &mut RunReportDraft, to: RunState, reason: &str) -> Result<(), OrchestratorError> {
    let from = draft.state;
    draft.transition(to, reason, now_ms())?;
    info!(run_id = %draft.run_id, from = from.as_str(), to = to.as_str(), reason, "run transition");
    Ok(())
}

fn mark_cancelled(draft: &mut RunReportDraft, stage: Stage) {
    if !draft.cancelled {
        draft.cancelled = true;
        draft.note(NoteKind::Cancelled, stage, "run", "cancellation requested");
        warn!(run_id = %draft.run_id, stage = stage.as_str(), "run cancelled");
    }
}

fn skip_from(draft: &mut RunReportDraft, from: usize, reason: &str) -> Result<(), OrchestratorError> {
    for fix in draft.fixes.iter_mut().skip(from) {
        if fix.status == FixStatus::Proposed {
            fix.skip(reason)?;
        }
    }
    Ok(())
}

/// Where a stage sends the run next.
enum Step<T> {
    Continue(T),
    Report(String),
}

enum Fragment {
    Spec(ContractModel),
    Client(ContractModel),
    Server(ServerExtraction),
}

struct Collected {
    spec: Arc<ContractModel>,
    index: Arc<ServerIndex>,
}

enum ApprovalWait {
    Signal(ApprovalSignal),
    TimedOut,
    Cancelled,
}

enum FixOutcome {
    Committed,
    RolledBack,
    Stop(String),
}

enum VerifyOutcome {
    Passed,
    Failed(String),
    TimedOut,
    Cancelled,
}

fn finding(mismatch: &Mismatch, class: &Classification, evidence: Option<&Evidence>) -> Finding {
    let severity = if class.is_low_confidence() {
        Severity::Medium
    } else if evidence.is_some_and(|e| e.handler_exists == Some(false)) {
        Severity::Critical
    } else {
        Severity::High
    };
    let side = if mismatch.pair.is_server() { "server" } else { "client" };
    let files = evidence
        .map(|e| {
            let s = &e.sites;
            [&s.router, &s.handler, &s.request_struct, &s.response_struct]
                .into_iter()
                .flatten()
                .map(|site| site.file.clone())
                .collect::<BTreeSet<_>>()
        })
        .unwrap_or_default();
    Finding {
        mismatch_id: mismatch.id.clone(),
        severity,
        component: format!("{side} {}", mismatch.endpoint),
        symptom: mismatch.describe(),
        reproduction_steps: vec![
            format!("compare {} for {}", mismatch.pair.as_str(), mismatch.endpoint),
            class.rationale.clone(),
        ],
        files,
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn IssueLedger>,
    ticketing: Arc<dyn Ticketing>,
    notifier: Arc<dyn Notifier>,
    verifier: Arc<dyn VerificationRunner>,
    broker: ApprovalBroker,
    fs: Arc<dyn Fs>,
    writer: Arc<dyn FsWrite>,
    extractors: Vec<Arc<dyn ArtifactExtractor>>,
    artifacts_dir: PathBuf,
    auto_approve: bool,
}

impl Orchestrator {
    /// Collaborators follow the configuration: http adapters when urls are
    /// set, dry-run and log doubles otherwise.
    #[must_use]
    pub fn new(config: OrchestratorConfig, store: IssueStore) -> Self {
        let ticketing: Arc<dyn Ticketing> = match &config.ticketing.url {
            Some(url) => Arc::new(HttpTicketing::new(url, config.ticketing.bearer.clone())),
            None => Arc::new(DryRunTicketing),
        };
        let notifier: Arc<dyn Notifier> = match &config.notification.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)),
            None => Arc::new(LogNotifier),
        };
        let verifier: Arc<dyn VerificationRunner> = match &config.verify_command {
            Some(cmd) => Arc::new(CommandVerifier::new(cmd.clone(), Arc::new(RealProcessRunner))),
            None => Arc::new(NoopVerifier),
        };
        let artifacts_dir = bijux_drift_core::resolve_artifacts_dir(config.artifacts_dir.clone());
        Self {
            config,
            store: Arc::new(store),
            ticketing,
            notifier,
            verifier,
            broker: ApprovalBroker::new(),
            fs: Arc::new(RealFs),
            writer: Arc::new(RealFs),
            extractors: Vec::new(),
            artifacts_dir,
            auto_approve: false,
        }
    }

    #[must_use]
    pub fn with_issue_ledger(mut self, ledger: Arc<dyn IssueLedger>) -> Self {
        self.store = ledger;
        self
    }

    #[must_use]
    pub fn with_ticketing(mut self, ticketing: Arc<dyn Ticketing>) -> Self {
        self.ticketing = ticketing;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn VerificationRunner>) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn with_broker(mut self, broker: ApprovalBroker) -> Self {
        self.broker = broker;
        self
    }

    /// Source reads made while collecting evidence.
    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn Fs>) -> Self {
        self.fs = reader;
        self
    }

    /// Replaces the spec or client extractor. The server tree is always
    /// walked in place because planning needs its index.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn ArtifactExtractor>) -> Self {
        if extractor.artifact() == ArtifactKind::Server {
            warn!("server extractor override ignored");
            return self;
        }
        self.extractors.retain(|known| known.artifact() != extractor.artifact());
        self.extractors.push(extractor);
        self
    }

    fn extractor_for(&self, kind: ArtifactKind, inputs: &RunInputs) -> Arc<dyn ArtifactExtractor> {
        if let Some(found) = self.extractors.iter().find(|e| e.artifact() == kind) {
            return Arc::clone(found);
        }
        match kind {
            ArtifactKind::Client => Arc::new(ClientExtractor {
                root: inputs.client.clone(),
            }),
            _ => Arc::new(SpecExtractor {
                path: inputs.spec.clone(),
            }),
        }
    }

    #[must_use]
    pub fn with_writer(mut self, writer: Arc<dyn FsWrite>) -> Self {
        self.writer = writer;
        self
    }

    #[must_use]
    pub fn with_artifacts_dir(mut self, dir: &Path) -> Self {
        self.artifacts_dir = dir.to_path_buf();
        self
    }

    /// Records an accepted approval as soon as one is needed.
    #[must_use]
    pub fn with_auto_approve(mut self, auto: bool) -> Self {
        self.auto_approve = auto;
        self
    }

    #[must_use]
    pub fn broker(&self) -> ApprovalBroker {
        self.broker.clone()
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Always returns a finalized report, whatever happened on the way.
    pub async fn run(&self, inputs: RunInputs, mut cancel: watch::Receiver<bool>) -> RunOutcome {
        let started_at = now_ms();
        let run_id = inputs
            .run_id
            .clone()
            .unwrap_or_else(|| RunId::from_seed(&format!("run_{started_at}")));
        info!(run_id = %run_id, spec = %inputs.spec.display(), server = %inputs.server.display(), "run started");
        let mut draft = RunReportDraft::new(run_id, started_at);
        let reason = match self.drive(&inputs, &mut draft, &mut cancel).await {
            Ok(reason) => reason,
            Err(err) => {
                error!(run_id = %draft.run_id, error = %err, "run failed");
                draft.fatal = Some(err.to_string());
                if let Err(skip) = skip_from(&mut draft, 0, "run failed") {
                    warn!(error = %skip, "pending fixes not skipped");
                }
                format!("control failure: {err}")
            }
        };
        self.finish(draft, &reason).await
    }

    async fn drive(
        &self,
        inputs: &RunInputs,
        draft: &mut RunReportDraft,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, OrchestratorError> {
        let collected = match self.collect(inputs, draft, cancel).await? {
            Step::Continue(c) => c,
            Step::Report(reason) => return Ok(reason),
        };
        advance(draft, RunState::Analyzing, "extraction and comparison complete")?;
        if let Step::Report(reason) = self.analyze(inputs, &collected, draft, cancel).await? {
            return Ok(reason);
        }
        advance(draft, RunState::Planning, "every mismatch classified")?;
        if let Step::Report(reason) = self.plan(&collected, draft).await? {
            return Ok(reason);
        }
        if let Step::Report(reason) = self.gate(draft, cancel).await? {
            return Ok(reason);
        }
        self.apply_all(inputs, draft, cancel).await
    }

    async fn collect(
        &self,
        inputs: &RunInputs,
        draft: &mut RunReportDraft,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Step<Collected>, OrchestratorError> {
        let stage = Stage::Collecting;
        let started = Instant::now();
        let deadline = started + self.config.stage_timeout(stage);
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks: JoinSet<(ArtifactKind, Result<Fragment, String>)> = JoinSet::new();

        let spec = self.extractor_for(ArtifactKind::Spec, inputs);
        let client = self.extractor_for(ArtifactKind::Client, inputs);
        let server = ServerExtractor {
            root: inputs.server.clone(),
        };
        let jobs: Vec<(ArtifactKind, Box<dyn FnOnce() -> Result<Fragment, String> + Send>)> = vec![
            (
                ArtifactKind::Spec,
                Box::new(move || spec.extract().map(Fragment::Spec).map_err(|e| e.to_string())),
            ),
            (
                ArtifactKind::Client,
                Box::new(move || client.extract().map(Fragment::Client).map_err(|e| e.to_string())),
            ),
            (
                ArtifactKind::Server,
                Box::new(move || {
                    server
                        .extract_with_index()
                        .map(Fragment::Server)
                        .map_err(|e| e.to_string())
                }),
            ),
        ];
        for (kind, job) in jobs {
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let out = match tokio::task::spawn_blocking(job).await {
                    Ok(out) => out,
                    Err(err) => Err(format!("extractor task failed: {err}")),
                };
                (kind, out)
            });
        }

        let mut pending = BTreeSet::from([ArtifactKind::Spec, ArtifactKind::Client, ArtifactKind::Server]);
        let (mut spec_model, mut client_model, mut server_out) = (None, None, None);
        let mut failed = false;
        let mut interrupted = None;
        while !pending.is_empty() {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let (kind, out) = joined?;
                    pending.remove(&kind);
                    match out {
                        Ok(Fragment::Spec(m)) => spec_model = Some(m),
                        Ok(Fragment::Client(m)) => client_model = Some(m),
                        Ok(Fragment::Server(s)) => server_out = Some(s),
                        Err(reason) => {
                            warn!(artifact = kind.as_str(), reason = %reason, "extraction failed");
                            draft.note(NoteKind::ExtractionFailure, stage, kind.as_str(), &reason);
                            failed = true;
                        }
                    }
                }
                () = sleep_until(deadline) => {
                    for kind in &pending {
                        draft.note(NoteKind::StageTimeout, stage, kind.as_str(), "extractor did not finish before the collecting deadline");
                    }
                    interrupted = Some("collecting stage timed out".to_string());
                    break;
                }
                () = cancelled(cancel) => {
                    mark_cancelled(draft, stage);
                    interrupted = Some("cancelled".to_string());
                    break;
                }
            }
        }
        tasks.abort_all();
        if let Some(reason) = interrupted {
            record_duration(draft, stage, started);
            return Ok(Step::Report(reason));
        }
        let (Some(spec_model), Some(client_model), Some(server_out), false) =
            (spec_model, client_model, server_out, failed)
        else {
            record_duration(draft, stage, started);
            return Ok(Step::Report("unrecoverable extractor failure".to_string()));
        };

        let comparison = compare(&spec_model, &client_model, &server_out.model)?;
        for failure in &comparison.skipped {
            draft.note(
                NoteKind::ExtractionFailure,
                stage,
                &failure.endpoint.to_string(),
                &failure.reason,
            );
        }
        draft.extraction_failures = comparison.skipped;
        draft.mismatches = comparison.mismatches;
        info!(
            mismatches = draft.mismatches.len(),
            skipped = draft.extraction_failures.len(),
            "comparison complete"
        );
        record_duration(draft, stage, started);
        Ok(Step::Continue(Collected {
            spec: Arc::new(spec_model),
            index: Arc::new(server_out.index),
        }))
    }

    async fn analyze(
        &self,
        inputs: &RunInputs,
        collected: &Collected,
        draft: &mut RunReportDraft,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Step<()>, OrchestratorError> {
        let stage = Stage::Analyzing;
        let started = Instant::now();
        let deadline = started + self.config.stage_timeout(stage);
        let inspector: Arc<dyn CodeInspector> = Arc::new(SourceTreeInspector::new(
            Arc::clone(&collected.index),
            Arc::clone(&self.fs),
            &inputs.server,
        ));
        let collector = Arc::new(EvidenceCollector::new(inspector));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mismatches = draft.mismatches.clone();

        let mut tasks = JoinSet::new();
        for (i, mismatch) in mismatches.iter().enumerate() {
            let endpoint = collected.spec.get(&mismatch.endpoint).map(|e| e.endpoint.clone());
            let mismatch = mismatch.clone();
            let collector = Arc::clone(&collector);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let out = tokio::task::spawn_blocking(move || {
                    let evidence = collector.collect(&mismatch, endpoint.as_ref());
                    let class = classify(&mismatch, &evidence);
                    (evidence, class)
                })
                .await;
                (i, out)
            });
        }

        let mut slots: Vec<Option<(Evidence, Classification)>> = vec![None; mismatches.len()];
        let mut remaining = mismatches.len();
        let mut interrupted = None;
        while remaining > 0 {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let (i, out) = joined?;
                    remaining -= 1;
                    match out {
                        Ok(pair) => slots[i] = Some(pair),
                        Err(err) => warn!(mismatch = %mismatches[i].id, error = %err, "evidence task failed"),
                    }
                }
                () = sleep_until(deadline) => {
                    interrupted = Some((NoteKind::StageTimeout, "analyzing stage timed out"));
                    break;
                }
                () = cancelled(cancel) => {
                    mark_cancelled(draft, stage);
                    interrupted = Some((NoteKind::Cancelled, "cancelled"));
                    break;
                }
            }
        }
        tasks.abort_all();

        for (mismatch, slot) in mismatches.iter().zip(slots) {
            let (evidence, class) = match slot {
                Some(pair) => pair,
                None => {
                    // unanswered questions stay unknown and classify conservatively
                    let mut evidence = Evidence::new(mismatch.id.clone());
                    evidence.note("evidence collection did not finish");
                    if let Some((NoteKind::StageTimeout, _)) = interrupted {
                        draft.note(
                            NoteKind::StageTimeout,
                            stage,
                            mismatch.id.as_str(),
                            "evidence collection did not finish before the analyzing deadline",
                        );
                    }
                    let class = classify(mismatch, &evidence);
                    (evidence, class)
                }
            };
            if evidence.has_unknown() {
                draft.note(
                    NoteKind::EvidenceIncomplete,
                    stage,
                    mismatch.id.as_str(),
                    &format!("unknown: {}", evidence.unknown_fields().join(", ")),
                );
            }
            if class.is_low_confidence() {
                draft.note(
                    NoteKind::ClassificationLowConfidence,
                    stage,
                    mismatch.id.as_str(),
                    &class.rationale,
                );
            }
            draft.evidence.push(evidence);
            draft.classifications.push(class);
        }
        info!(
            classified = draft.classifications.len(),
            regressions = draft
                .classifications
                .iter()
                .filter(|c| c.kind == ClassificationKind::TrueRegression)
                .count(),
            "classification complete"
        );

        if let Some((_, reason)) = interrupted {
            record_duration(draft, stage, started);
            return Ok(Step::Report(reason.to_string()));
        }
        self.sync_issues(draft).await?;
        record_duration(draft, stage, started);
        Ok(Step::Continue(()))
    }

    /// Records true regressions, links duplicates and files tickets for
    /// records that are neither tracked nor duplicates. A store failure on
    /// one finding is noted and the others carry on.
    async fn sync_issues(&self, draft: &mut RunReportDraft) -> Result<(), OrchestratorError> {
        let findings = draft
            .mismatches
            .iter()
            .zip(&draft.classifications)
            .filter(|(_, c)| c.kind == ClassificationKind::TrueRegression)
            .map(|(m, c)| {
                let evidence = draft.evidence.iter().find(|e| e.mismatch_id == m.id);
                finding(m, c, evidence)
            })
            .collect::<Vec<_>>();
        if findings.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let now = now_ms();
        let (mut records, failures) = tokio::task::spawn_blocking(move || {
            let mut failures: Vec<(String, String)> = Vec::new();
            let mut ids = Vec::with_capacity(findings.len());
            for f in &findings {
                match store.record_finding(f, now) {
                    Ok((record, created)) => {
                        if created {
                            info!(issue = %record.id, mismatch = %f.mismatch_id, "issue recorded");
                        }
                        ids.push(record.id);
                    }
                    Err(err) => failures.push((f.mismatch_id.as_str().to_string(), format!("finding not recorded: {err}"))),
                }
            }
            for id in &ids {
                match store.link_duplicates(id) {
                    Ok(Some(outcome)) if !outcome.changed.is_empty() => {
                        info!(issue = %id, canonical = %outcome.canonical, "duplicates linked");
                    }
                    Ok(_) => {}
                    Err(err) => failures.push((id.as_str().to_string(), format!("duplicates not linked: {err}"))),
                }
            }
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                match store.get(id) {
                    Ok(Some(record)) => out.push(record),
                    Ok(None) => failures.push((id.as_str().to_string(), "record missing after insert".to_string())),
                    Err(err) => failures.push((id.as_str().to_string(), format!("record not reloaded: {err}"))),
                }
            }
            (out, failures)
        })
        .await?;
        for (subject, detail) in &failures {
            warn!(subject = %subject, detail = %detail, "issue store failure");
            draft.note(NoteKind::IssueStoreFailure, Stage::Analyzing, subject, detail);
        }

        for record in &mut records {
            if !record.wants_ticket() {
                continue;
            }
            let description = format!(
                "{}\n\nissue: {}\n{}",
                record.symptom,
                record.id,
                record.reproduction_steps.join("\n")
            );
            match self
                .ticketing
                .create_ticket(&record.symptom, &description, record.severity)
                .await
            {
                Ok(ticket) => {
                    let store = Arc::clone(&self.store);
                    let (id, t) = (record.id.clone(), ticket.clone());
                    match tokio::task::spawn_blocking(move || store.attach_ticket(&id, &t)).await? {
                        Ok(updated) => {
                            info!(issue = %updated.id, ticket = %ticket, "ticket filed");
                            draft.tickets.insert(updated.id.clone(), ticket);
                            *record = updated;
                        }
                        Err(err) => {
                            warn!(issue = %record.id, error = %err, "ticket not attached");
                            draft.note(NoteKind::TicketingFailure, Stage::Analyzing, record.id.as_str(), &err.to_string());
                        }
                    }
                }
                Err(err) => {
                    warn!(issue = %record.id, error = %err, "ticket creation failed");
                    draft.note(NoteKind::TicketingFailure, Stage::Analyzing, record.id.as_str(), &err.to_string());
                }
            }
        }
        draft.issues = records;
        Ok(())
    }

    async fn plan(&self, collected: &Collected, draft: &mut RunReportDraft) -> Result<Step<()>, OrchestratorError> {
        let stage = Stage::Planning;
        let started = Instant::now();
        let rows = draft
            .mismatches
            .iter()
            .zip(&draft.classifications)
            .zip(&draft.evidence)
            .map(|((m, c), e)| (m.clone(), c.clone(), e.clone()))
            .collect::<Vec<_>>();
        let planner = RemediationPlanner::new(Arc::clone(&collected.index), Arc::clone(&collected.spec));
        let job = tokio::task::spawn_blocking(move || planner.plan_all(&rows));
        let planned = timeout(self.config.stage_timeout(stage), job).await;
        record_duration(draft, stage, started);
        let Ok(joined) = planned else {
            draft.note(NoteKind::StageTimeout, stage, "planner", "planning did not finish before its deadline");
            return Ok(Step::Report("planning stage timed out".to_string()));
        };
        draft.fixes = joined??;
        info!(
            fixes = draft.fixes.len(),
            unsafe_fixes = draft.fixes.iter().filter(|f| !f.safe).count(),
            "remediation planned"
        );
        if draft.fixes.is_empty() {
            return Ok(Step::Report("no eligible fixes".to_string()));
        }
        Ok(Step::Continue(()))
    }

    async fn gate(
        &self,
        draft: &mut RunReportDraft,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Step<()>, OrchestratorError> {
        let all_safe = draft.fixes.iter().all(|f| f.safe);
        if !self.config.needs_approval(all_safe) {
            advance(draft, RunState::Applying, "all fixes safe and unattended apply permitted")?;
            return Ok(Step::Continue(()));
        }
        let reason = if all_safe {
            "configuration requires approval for safe fixes"
        } else {
            "destructive fixes require approval"
        };
        advance(draft, RunState::AwaitingApproval, reason)?;

        let stage = Stage::Approval;
        let started = Instant::now();
        let fix_ids = draft.fixes.iter().map(|f| f.id.clone()).collect::<Vec<_>>();
        let wait = if self.auto_approve {
            ApprovalWait::Signal(ApprovalSignal {
                decision: ApprovalDecision::Accept,
                source: "auto-approve".to_string(),
                at_ms: now_ms(),
            })
        } else {
            let rx = self.broker.register(&draft.run_id, fix_ids.clone());
            info!(run_id = %draft.run_id, fixes = fix_ids.len(), "awaiting approval");
            let wait = tokio::select! {
                signal = rx => match signal {
                    Ok(signal) => ApprovalWait::Signal(signal),
                    Err(_) => ApprovalWait::TimedOut,
                },
                () = tokio::time::sleep(self.config.stage_timeout(stage)) => ApprovalWait::TimedOut,
                () = cancelled(cancel) => ApprovalWait::Cancelled,
            };
            self.broker.withdraw(&draft.run_id);
            wait
        };
        record_duration(draft, stage, started);

        match wait {
            ApprovalWait::Signal(signal) => {
                draft.approvals.push(ApprovalEvent {
                    run_id: draft.run_id.clone(),
                    decision: signal.decision,
                    fix_ids,
                    at_ms: signal.at_ms,
                    source: signal.source.clone(),
                });
                match signal.decision {
                    ApprovalDecision::Accept => {
                        advance(draft, RunState::Applying, &format!("approved via {}", signal.source))?;
                        Ok(Step::Continue(()))
                    }
                    ApprovalDecision::Reject => {
                        skip_from(draft, 0, "rejected")?;
                        Ok(Step::Report(format!("approval rejected via {}", signal.source)))
                    }
                }
            }
            ApprovalWait::TimedOut => {
                skip_from(draft, 0, "approval timeout")?;
                let subject = draft.run_id.to_string();
                draft.note(
                    NoteKind::ApprovalTimeout,
                    stage,
                    &subject,
                    "no approval signal before the deadline; pending fixes skipped",
                );
                Ok(Step::Report("approval timed out".to_string()))
            }
            ApprovalWait::Cancelled => {
                mark_cancelled(draft, stage);
                skip_from(draft, 0, "cancelled")?;
                Ok(Step::Report("cancelled".to_string()))
            }
        }
    }

    /// Fixes go one at a time so each rollback restores exactly its own snapshot.
    async fn apply_all(
        &self,
        inputs: &RunInputs,
        draft: &mut RunReportDraft,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, OrchestratorError> {
        for idx in 0..draft.fixes.len() {
            if draft.fixes[idx].status != FixStatus::Proposed {
                continue;
            }
            if is_cancelled(cancel) {
                mark_cancelled(draft, Stage::Applying);
                skip_from(draft, idx, "cancelled")?;
                return Ok("cancelled".to_string());
            }
            let fix = draft.fixes[idx].clone();
            if !fix.safe && !draft.has_accepted_approval(&fix.id) {
                warn!(fix = %fix.id, "destructive fix refused without an accepted approval");
                draft.fixes[idx].skip("no accepted approval")?;
                draft.note(
                    NoteKind::FixApplicationFailure,
                    Stage::Applying,
                    fix.id.as_str(),
                    "destructive fix refused: no accepted approval event",
                );
                continue;
            }
            if draft.state != RunState::Applying {
                advance(draft, RunState::Applying, &format!("next fix {}", fix.id))?;
            }
            match self.apply_one(inputs, idx, draft, cancel).await? {
                FixOutcome::Committed | FixOutcome::RolledBack => {}
                FixOutcome::Stop(reason) => {
                    skip_from(draft, idx + 1, &reason)?;
                    return Ok(reason);
                }
            }
        }
        Ok("every approved fix processed".to_string())
    }

    fn read_target(&self, root: &Path, rel: &str) -> JoinHandle<Result<String, String>> {
        let fs = Arc::clone(&self.fs);
        let (root, rel) = (root.to_path_buf(), PathBuf::from(rel));
        tokio::task::spawn_blocking(move || fs.read_text(&root, &rel).map_err(|e| e.to_string()))
    }

    fn write_target(&self, root: &Path, rel: &str, text: String) -> JoinHandle<Result<(), String>> {
        let writer = Arc::clone(&self.writer);
        let (root, rel) = (root.to_path_buf(), PathBuf::from(rel));
        tokio::task::spawn_blocking(move || writer.write_text(&root, &rel, &text).map_err(|e| e.to_string()))
    }

    /// Writes the snapshot back. On failure the fix keeps its status, its
    /// note names the target that may still be modified, and the run stops.
    async fn restore(
        &self,
        root: &Path,
        draft: &mut RunReportDraft,
        idx: usize,
        snapshot: &str,
    ) -> Result<(), OrchestratorError> {
        let (id, target) = (draft.fixes[idx].id.clone(), draft.fixes[idx].target.clone());
        let failed = match self.write_target(root, &target, snapshot.to_string()).await {
            Ok(Ok(())) => {
                info!(fix = %id, target = %target, "fix rolled back");
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(err) => err.to_string(),
        };
        let detail = format!("rollback failed, {target} may still be modified: {failed}");
        error!(fix = %id, target = %target, error = %failed, "rollback failed");
        draft.fixes[idx].note = Some(detail.clone());
        draft.note(NoteKind::FixApplicationFailure, Stage::Applying, id.as_str(), &detail);
        Err(OrchestratorError::Io(format!("rollback of {id} failed")))
    }

    fn roll_back_unapplied(draft: &mut RunReportDraft, idx: usize, detail: &str) -> Result<(), OrchestratorError> {
        let id = draft.fixes[idx].id.clone();
        warn!(fix = %id, detail, "fix not applied");
        draft.fixes[idx].mark(FixStatus::RolledBack)?;
        draft.fixes[idx].note = Some(detail.to_string());
        draft.note(NoteKind::FixApplicationFailure, Stage::Applying, id.as_str(), detail);
        advance(draft, RunState::RolledBack, detail)
    }

    async fn apply_one(
        &self,
        inputs: &RunInputs,
        idx: usize,
        draft: &mut RunReportDraft,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<FixOutcome, OrchestratorError> {
        let root = inputs.server.as_path();
        let fix = draft.fixes[idx].clone();
        let apply_budget = self.config.stage_timeout(Stage::Applying);
        let started = Instant::now();

        let snapshot = match timeout(apply_budget, self.read_target(root, &fix.target)).await {
            Err(_) => {
                record_duration(draft, Stage::Applying, started);
                draft.note(NoteKind::StageTimeout, Stage::Applying, fix.id.as_str(), "reading the target timed out");
                Self::roll_back_unapplied(draft, idx, "target read timed out")?;
                return Ok(FixOutcome::Stop("applying stage timed out".to_string()));
            }
            Ok(joined) => match joined? {
                Ok(text) => text,
                Err(err) => {
                    record_duration(draft, Stage::Applying, started);
                    Self::roll_back_unapplied(draft, idx, &format!("target unreadable: {err}"))?;
                    return Ok(FixOutcome::RolledBack);
                }
            },
        };
        let patched = match fix.apply_to(&snapshot) {
            Ok(text) => text,
            Err(err) => {
                record_duration(draft, Stage::Applying, started);
                Self::roll_back_unapplied(draft, idx, &format!("patch does not apply: {err}"))?;
                return Ok(FixOutcome::RolledBack);
            }
        };
        let written = timeout(apply_budget, self.write_target(root, &fix.target, patched)).await;
        record_duration(draft, Stage::Applying, started);
        match written {
            Ok(joined) => {
                if let Err(err) = joined? {
                    self.restore(root, draft, idx, &snapshot).await?;
                    Self::roll_back_unapplied(draft, idx, &format!("write failed: {err}"))?;
                    return Ok(FixOutcome::RolledBack);
                }
            }
            Err(_) => {
                self.restore(root, draft, idx, &snapshot).await?;
                draft.note(NoteKind::StageTimeout, Stage::Applying, fix.id.as_str(), "writing the target timed out");
                Self::roll_back_unapplied(draft, idx, "target write timed out")?;
                return Ok(FixOutcome::Stop("applying stage timed out".to_string()));
            }
        }
        draft.fixes[idx].mark(FixStatus::Applied)?;
        info!(fix = %fix.id, kind = fix.kind.as_str(), target = %fix.target, "fix applied");
        advance(draft, RunState::Verifying, &format!("verifying {}", fix.id))?;

        let started = Instant::now();
        let verify_budget = self.config.stage_timeout(Stage::Verifying);
        let outcome = tokio::select! {
            checked = timeout(verify_budget, self.verify(root, &fix)) => match checked {
                Ok(Ok(())) => VerifyOutcome::Passed,
                Ok(Err(reason)) => VerifyOutcome::Failed(reason),
                Err(_) => VerifyOutcome::TimedOut,
            },
            () = cancelled(cancel) => VerifyOutcome::Cancelled,
        };
        record_duration(draft, Stage::Verifying, started);

        if matches!(outcome, VerifyOutcome::Passed) {
            draft.fixes[idx].mark(FixStatus::Verified)?;
            advance(draft, RunState::Committed, &format!("{} verified", fix.id))?;
            return Ok(FixOutcome::Committed);
        }
        self.restore(root, draft, idx, &snapshot).await?;
        draft.fixes[idx].mark(FixStatus::RolledBack)?;
        let (detail, next) = match outcome {
            VerifyOutcome::Failed(reason) => {
                draft.note(NoteKind::FixApplicationFailure, Stage::Verifying, fix.id.as_str(), &reason);
                (format!("verification failed: {reason}"), FixOutcome::RolledBack)
            }
            VerifyOutcome::TimedOut => {
                draft.note(NoteKind::StageTimeout, Stage::Verifying, fix.id.as_str(), "verification did not finish before its deadline");
                ("verification timed out".to_string(), FixOutcome::Stop("verifying stage timed out".to_string()))
            }
            VerifyOutcome::Cancelled | VerifyOutcome::Passed => {
                mark_cancelled(draft, Stage::Verifying);
                ("cancelled during verification".to_string(), FixOutcome::Stop("cancelled".to_string()))
            }
        };
        draft.fixes[idx].note = Some(detail.clone());
        advance(draft, RunState::RolledBack, &detail)?;
        Ok(next)
    }

    /// Per-fix file checks first, then the project-level verifier.
    async fn verify(&self, root: &Path, fix: &Fix) -> Result<(), String> {
        for check in &fix.verification {
            let text = self
                .read_target(root, check.path())
                .await
                .map_err(|e| e.to_string())??;
            if !check.holds_for(&text) {
                return Err(format!("check failed on {}", check.path()));
            }
        }
        match self.verifier.verify(fix, root).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("verify command reported failure".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn finish(&self, mut draft: RunReportDraft, reason: &str) -> RunOutcome {
        let started = Instant::now();
        if draft.state != RunState::Reporting {
            if let Err(err) = advance(&mut draft, RunState::Reporting, reason) {
                error!(error = %err, "cannot enter reporting");
                draft.fatal.get_or_insert_with(|| err.to_string());
            }
        }
        let top_n = self.config.top_n;
        let preview = summarize(&draft.clone().finalize(now_ms()), top_n);
        let budget = self.config.stage_timeout(Stage::Reporting);
        match timeout(budget, self.notifier.notify(&preview)).await {
            Ok(Ok(())) => info!(run_id = %draft.run_id, delivered = true, "notification sent"),
            Ok(Err(err)) => {
                warn!(run_id = %draft.run_id, delivered = false, error = %err, "notification failed");
                draft.note(NoteKind::NotificationFailure, Stage::Reporting, "notifier", &err.to_string());
            }
            Err(_) => {
                warn!(run_id = %draft.run_id, delivered = false, "notification timed out");
                draft.note(NoteKind::NotificationFailure, Stage::Reporting, "notifier", "delivery timed out");
            }
        }
        record_duration(&mut draft, Stage::Reporting, started);
        if let Err(err) = advance(&mut draft, RunState::Done, "report rendered") {
            error!(error = %err, "cannot finish run");
        }
        let report = draft.finalize(now_ms());
        let summary = summarize(&report, top_n);
        let artifacts = match self.persist(&report) {
            Ok(paths) => Some(paths),
            Err(err) => {
                error!(run_id = %report.run_id, error = %err, "run artifacts not written");
                None
            }
        };
        info!(
            run_id = %report.run_id,
            regressions_open = report.counts.regressions_open,
            incomplete = report.counts.incomplete,
            "run finished"
        );
        RunOutcome {
            report,
            summary,
            artifacts,
        }
    }

    fn persist(&self, report: &RunReport) -> Result<ArtifactPaths, OrchestratorError> {
        let rendered = render(report, self.config.top_n)?;
        let paths = write_artifacts(report, &rendered, &self.artifacts_dir)?;
        RunLog::in_dir(&self.artifacts_dir).append(report)?;
        Ok(paths)
    }
}
