// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use bijux_drift_core::{resolve_config_path, resolve_store_path, ExitCode, MachineError};
use bijux_drift_model::{ApprovalDecision, IssueId, IssueRecord, IssueStatus, MismatchId, RunId};
use bijux_drift_orchestrator::{
    cancellation, load_config, send_approval, serve_approvals, DryRunTicketing, HttpTicketing,
    Orchestrator, OrchestratorConfig, RunInputs, RunOutcome, Ticketing,
};
use bijux_drift_store::{IssueStore, StoreError};
use clap::{error::ErrorKind, ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const CRATE_NAME: &str = "bijux-drift-cli";

#[derive(Parser)]
#[command(name = "bijux-drift")]
#[command(about = "Spec, client and server drift detection and remediation")]
#[command(
    after_help = "Environment:\n  DRIFT_CONFIG          Config file (default .bijux/drift.toml)\n  DRIFT_STORE           Issue store (default .bijux/drift-issues.sqlite)\n  DRIFT_ARTIFACTS_DIR   Run artifacts root\n  DRIFT_LOG_JSON        JSON logs on stderr (default true)\n  RUST_LOG              Log filter"
)]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[arg(long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, compare, classify, remediate and report once.
    Run {
        #[arg(long)]
        spec: PathBuf,
        #[arg(long)]
        client: PathBuf,
        #[arg(long)]
        server: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
        /// Serve the approval endpoint on this address while the run waits.
        #[arg(long)]
        approval_listen: Option<SocketAddr>,
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
    },
    Issues {
        #[command(subcommand)]
        command: IssuesCommand,
    },
    Ticket {
        #[command(subcommand)]
        command: TicketCommand,
    },
    /// Send an accept/reject decision to a waiting run.
    Approve {
        #[arg(long)]
        url: String,
        #[arg(long)]
        run_id: String,
        #[arg(long, value_enum)]
        decision: DecisionCli,
    },
}

#[derive(Subcommand)]
enum IssuesCommand {
    List {
        #[arg(long, value_enum)]
        status: Option<StatusCli>,
    },
    Resolve {
        id: String,
    },
    MarkDuplicate {
        id: String,
        #[arg(long)]
        of: String,
    },
}

#[derive(Subcommand)]
enum TicketCommand {
    /// File a ticket for the record of a mismatch even when filing was skipped.
    Create {
        #[arg(long)]
        mismatch: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusCli {
    Untracked,
    Tracked,
    Resolved,
    Duplicate,
}

impl From<StatusCli> for IssueStatus {
    fn from(value: StatusCli) -> Self {
        match value {
            StatusCli::Untracked => Self::Untracked,
            StatusCli::Tracked => Self::Tracked,
            StatusCli::Resolved => Self::Resolved,
            StatusCli::Duplicate => Self::Duplicate,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DecisionCli {
    Accept,
    Reject,
}

impl From<DecisionCli> for ApprovalDecision {
    fn from(value: DecisionCli) -> Self {
        match value {
            DecisionCli::Accept => Self::Accept,
            DecisionCli::Reject => Self::Reject,
        }
    }
}

#[derive(Debug)]
struct CliError {
    exit_code: ExitCode,
    machine: MachineError,
}

impl CliError {
    fn usage(message: &str) -> Self {
        Self {
            exit_code: ExitCode::Usage,
            machine: MachineError::new("usage_error", message),
        }
    }

    fn validation(code: &str, message: String) -> Self {
        Self {
            exit_code: ExitCode::Validation,
            machine: MachineError::new(code, &message),
        }
    }

    fn dependency(message: String) -> Self {
        Self {
            exit_code: ExitCode::DependencyFailure,
            machine: MachineError::new("dependency_failure", &message),
        }
    }

    fn internal(message: String) -> Self {
        Self {
            exit_code: ExitCode::Internal,
            machine: MachineError::new("internal_error", &message),
        }
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => {
                let mut err = Self::validation("not_found", format!("issue {id} not found"));
                err.machine = err.machine.with_detail("issue_id", id.as_str());
                err
            }
            StoreError::NoRecordForMismatch(id) => {
                let mut err =
                    Self::validation("not_found", format!("no issue record for mismatch {id}"));
                err.machine = err.machine.with_detail("mismatch_id", id.as_str());
                err
            }
            StoreError::Model(err) => Self::validation("invalid_transition", err.to_string()),
            other => Self::dependency(other.to_string()),
        }
    }
}

#[derive(Clone, Copy)]
struct OutputMode {
    json: bool,
}

impl OutputMode {
    fn emit(self, payload: &serde_json::Value, text: &str) -> Result<(), CliError> {
        if self.json {
            let encoded = serde_json::to_string_pretty(payload)
                .map_err(|e| CliError::internal(e.to_string()))?;
            println!("{encoded}");
        } else {
            print!("{text}");
        }
        Ok(())
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// Logs go to stderr; stdout carries command output only.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if env_bool(bijux_drift_core::ENV_DRIFT_LOG_JSON, true) {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("tracing already initialized: {err}");
    }
}

fn emit_error(error: &CliError, machine_json: bool) {
    if machine_json {
        match serde_json::to_string(&error.machine) {
            Ok(payload) => eprintln!("{payload}"),
            Err(_) => eprintln!(
                "{{\"code\":\"internal_error\",\"message\":\"failed to encode structured error\",\"details\":{{}}}}"
            ),
        }
    } else {
        eprintln!("{}", error.machine.message);
    }
}

pub fn main_entry() -> ProcessExitCode {
    let wants_json = std::env::args().any(|arg| arg == "--json");
    match run() {
        Ok(code) => ProcessExitCode::from(code as u8),
        Err(err) => {
            emit_error(&err, wants_json);
            ProcessExitCode::from(err.exit_code as u8)
        }
    }
}

fn run() -> Result<ExitCode, CliError> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{err}");
                return Ok(ExitCode::Success);
            }
            _ => {
                return Err(CliError {
                    exit_code: ExitCode::Usage,
                    machine: MachineError::new("usage_error", "invalid command line arguments")
                        .with_detail("error", &err.to_string()),
                });
            }
        },
    };
    let command = cli
        .command
        .ok_or_else(|| CliError::usage("missing command; see --help"))?;
    init_tracing(cli.verbose);
    let output = OutputMode { json: cli.json };
    let store_path = resolve_store_path(cli.store);

    match command {
        Commands::Run {
            spec,
            client,
            server,
            run_id,
            approval_listen,
            auto_approve,
        } => {
            let run_id = run_id
                .map(|raw| RunId::parse(&raw))
                .transpose()
                .map_err(|e| CliError::usage(&e.to_string()))?;
            let config = config(cli.config)?;
            let store = IssueStore::open(&store_path)?;
            let inputs = RunInputs {
                spec,
                client,
                server,
                run_id,
            };
            let outcome = runtime()?.block_on(drive_run(
                config,
                store,
                inputs,
                approval_listen,
                auto_approve,
            ))?;
            emit_outcome(&outcome, output)?;
            Ok(outcome.exit_code())
        }
        Commands::Issues { command } => {
            let store = IssueStore::open(&store_path)?;
            match command {
                IssuesCommand::List { status } => {
                    let records = store.list(status.map(IssueStatus::from))?;
                    emit_records(&records, output)?;
                }
                IssuesCommand::Resolve { id } => {
                    let id = issue_id(&id)?;
                    let record = store.transition(&id, IssueStatus::Resolved)?;
                    emit_records(std::slice::from_ref(&record), output)?;
                }
                IssuesCommand::MarkDuplicate { id, of } => {
                    let (id, of) = (issue_id(&id)?, issue_id(&of)?);
                    let outcome = store.mark_duplicate(&id, &of)?;
                    let changed = outcome.changed.iter().map(IssueId::as_str).collect::<Vec<_>>();
                    output.emit(
                        &json!({ "canonical": outcome.canonical, "changed": changed }),
                        &format!("{id} linked; canonical record is {}\n", outcome.canonical),
                    )?;
                }
            }
            Ok(ExitCode::Success)
        }
        Commands::Ticket {
            command: TicketCommand::Create { mismatch },
        } => {
            let mismatch =
                MismatchId::parse(&mismatch).map_err(|e| CliError::usage(&e.to_string()))?;
            let config = config(cli.config)?;
            let store = IssueStore::open(&store_path)?;
            let record = runtime()?.block_on(force_ticket(&config, &store, &mismatch))?;
            emit_records(std::slice::from_ref(&record), output)?;
            Ok(ExitCode::Success)
        }
        Commands::Approve {
            url,
            run_id,
            decision,
        } => {
            let run_id = RunId::parse(&run_id).map_err(|e| CliError::usage(&e.to_string()))?;
            let ack = runtime()?
                .block_on(send_approval(&url, &run_id, decision.into()))
                .map_err(|e| CliError::dependency(e.to_string()))?;
            output.emit(
                &json!({ "run_id": ack.run_id, "decision": ack.decision, "fix_ids": ack.fix_ids }),
                &format!(
                    "{} {} for {} fix(es)\n",
                    ack.run_id,
                    ack.decision.as_str(),
                    ack.fix_ids.len()
                ),
            )?;
            Ok(ExitCode::Success)
        }
    }
}

fn config(explicit: Option<PathBuf>) -> Result<OrchestratorConfig, CliError> {
    load_config(&resolve_config_path(explicit))
        .map_err(|e| CliError::validation("invalid_config", e.to_string()))
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::internal(format!("runtime start failed: {e}")))
}

fn issue_id(raw: &str) -> Result<IssueId, CliError> {
    IssueId::parse(raw).map_err(|e| CliError::usage(&e.to_string()))
}

async fn drive_run(
    config: OrchestratorConfig,
    store: IssueStore,
    inputs: RunInputs,
    approval_listen: Option<SocketAddr>,
    auto_approve: bool,
) -> Result<RunOutcome, CliError> {
    let orch = Orchestrator::new(config, store).with_auto_approve(auto_approve);
    let (cancel_tx, cancel_rx) = cancellation();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = match approval_listen {
        Some(addr) => {
            let (bound, handle) = serve_approvals(addr, orch.broker(), shutdown_rx)
                .await
                .map_err(|e| CliError::dependency(e.to_string()))?;
            info!(addr = %bound, "approvals accepted at POST /v1/runs/<run_id>/approval");
            Some(handle)
        }
        None => None,
    };
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel_tx.send_replace(true);
        }
    });

    let outcome = orch.run(inputs, cancel_rx).await;

    interrupt.abort();
    shutdown_tx.send_replace(true);
    if let Some(handle) = server {
        if let Err(err) = handle.await {
            warn!(error = %err, "approval endpoint task failed");
        }
    }
    Ok(outcome)
}

async fn force_ticket(
    config: &OrchestratorConfig,
    store: &IssueStore,
    mismatch: &MismatchId,
) -> Result<IssueRecord, CliError> {
    let record = store
        .find_by_mismatch(mismatch)?
        .ok_or_else(|| StoreError::NoRecordForMismatch(mismatch.clone()))?;
    let ticketing: Box<dyn Ticketing> = match &config.ticketing.url {
        Some(url) => Box::new(HttpTicketing::new(url, config.ticketing.bearer.clone())),
        None => Box::new(DryRunTicketing),
    };
    let description = format!(
        "{}\n\nissue: {}\n{}",
        record.symptom,
        record.id,
        record.reproduction_steps.join("\n")
    );
    let ticket = ticketing
        .create_ticket(&record.symptom, &description, record.severity)
        .await
        .map_err(|e| CliError::dependency(e.to_string()))?;
    info!(issue = %record.id, ticket = %ticket, "ticket filed by operator");
    Ok(store.force_ticket(&record.id, &ticket)?)
}

fn emit_outcome(outcome: &RunOutcome, output: OutputMode) -> Result<(), CliError> {
    let artifacts = outcome.artifacts.as_ref().map(|p| p.dir.display().to_string());
    output.emit(
        &json!({
            "run_id": outcome.report.run_id,
            "final_state": outcome.report.final_state,
            "counts": outcome.report.counts,
            "fatal": outcome.report.fatal,
            "summary": outcome.summary,
            "artifacts": artifacts,
        }),
        &outcome.summary.to_text(),
    )
}

fn emit_records(records: &[IssueRecord], output: OutputMode) -> Result<(), CliError> {
    let text = records
        .iter()
        .map(|r| {
            let ticket = r
                .ticket
                .as_ref()
                .map(|t| format!(" [{t}]"))
                .unwrap_or_default();
            format!(
                "{} {} {} {}: {}{ticket}\n",
                r.id,
                r.status.as_str(),
                r.severity.as_str(),
                r.component,
                r.symptom
            )
        })
        .collect::<String>();
    let payload = serde_json::to_value(records).map_err(|e| CliError::internal(e.to_string()))?;
    output.emit(&payload, &text)
}
