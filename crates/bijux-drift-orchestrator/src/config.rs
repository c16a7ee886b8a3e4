use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bijux_drift_model::Stage;
use serde::{Deserialize, Serialize};

use crate::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageTimeouts {
    pub collecting: u64,
    pub analyzing: u64,
    pub planning: u64,
    pub applying: u64,
    pub verifying: u64,
    pub reporting: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            collecting: 120_000,
            analyzing: 120_000,
            planning: 30_000,
            applying: 30_000,
            verifying: 300_000,
            reporting: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TicketingConfig {
    pub url: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    #[serde(rename = "stage_timeouts_ms")]
    pub stage_timeouts: StageTimeouts,
    pub approval_timeout_ms: u64,
    pub require_approval_for_safe_fixes: bool,
    pub allow_unattended_apply: bool,
    pub top_n: usize,
    pub verify_command: Option<VerifyCommand>,
    pub artifacts_dir: Option<PathBuf>,
    pub ticketing: TicketingConfig,
    pub notification: NotificationConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            stage_timeouts: StageTimeouts::default(),
            approval_timeout_ms: 15 * 60 * 1000,
            require_approval_for_safe_fixes: true,
            allow_unattended_apply: false,
            top_n: 5,
            verify_command: None,
            artifacts_dir: None,
            ticketing: TicketingConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        let t = &self.stage_timeouts;
        Duration::from_millis(match stage {
            Stage::Collecting => t.collecting,
            Stage::Analyzing => t.analyzing,
            Stage::Planning => t.planning,
            Stage::Approval => self.approval_timeout_ms,
            Stage::Applying => t.applying,
            Stage::Verifying => t.verifying,
            Stage::Reporting => t.reporting,
        })
    }

    /// Unattended apply needs every fix safe and no approval requirement.
    #[must_use]
    pub fn needs_approval(&self, all_safe: bool) -> bool {
        !(all_safe && !self.require_approval_for_safe_fixes && self.allow_unattended_apply)
    }
}

fn env_bool(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: usize) -> usize {
    lookup(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Reads `path` when it exists; a missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<OrchestratorConfig, OrchestratorError> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let text = fs::read_to_string(path)
        .map_err(|e| OrchestratorError::Config(format!("read {} failed: {e}", path.display())))?;
    toml::from_str(&text)
        .map_err(|e| OrchestratorError::Config(format!("{} is invalid: {e}", path.display())))
}

/// `DRIFT_*` variables override file values.
#[must_use]
pub fn apply_env_overrides(cfg: OrchestratorConfig) -> OrchestratorConfig {
    apply_overrides_from(cfg, &|name| env::var(name).ok())
}

#[must_use]
pub fn apply_overrides_from(
    cfg: OrchestratorConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> OrchestratorConfig {
    let t = &cfg.stage_timeouts;
    OrchestratorConfig {
        max_concurrency: env_usize(lookup, "DRIFT_MAX_CONCURRENCY", cfg.max_concurrency),
        stage_timeouts: StageTimeouts {
            collecting: env_u64(lookup, "DRIFT_COLLECTING_TIMEOUT_MS", t.collecting),
            analyzing: env_u64(lookup, "DRIFT_ANALYZING_TIMEOUT_MS", t.analyzing),
            planning: env_u64(lookup, "DRIFT_PLANNING_TIMEOUT_MS", t.planning),
            applying: env_u64(lookup, "DRIFT_APPLYING_TIMEOUT_MS", t.applying),
            verifying: env_u64(lookup, "DRIFT_VERIFYING_TIMEOUT_MS", t.verifying),
            reporting: env_u64(lookup, "DRIFT_REPORTING_TIMEOUT_MS", t.reporting),
        },
        approval_timeout_ms: env_u64(lookup, "DRIFT_APPROVAL_TIMEOUT_MS", cfg.approval_timeout_ms),
        require_approval_for_safe_fixes: env_bool(
            lookup,
            "DRIFT_REQUIRE_APPROVAL_FOR_SAFE_FIXES",
            cfg.require_approval_for_safe_fixes,
        ),
        allow_unattended_apply: env_bool(
            lookup,
            "DRIFT_ALLOW_UNATTENDED_APPLY",
            cfg.allow_unattended_apply,
        ),
        top_n: env_usize(lookup, "DRIFT_TOP_N", cfg.top_n),
        artifacts_dir: lookup(bijux_drift_core::ENV_DRIFT_ARTIFACTS_DIR)
            .map(PathBuf::from)
            .or(cfg.artifacts_dir),
        ticketing: TicketingConfig {
            url: lookup("DRIFT_TICKETING_URL").or(cfg.ticketing.url),
            bearer: lookup("DRIFT_TICKETING_BEARER").or(cfg.ticketing.bearer),
        },
        notification: NotificationConfig {
            webhook_url: lookup("DRIFT_NOTIFICATION_WEBHOOK_URL").or(cfg.notification.webhook_url),
        },
        verify_command: cfg.verify_command,
    }
}

pub fn validate_config_contract(cfg: &OrchestratorConfig) -> Result<(), String> {
    if cfg.max_concurrency == 0 {
        return Err("max_concurrency must be > 0".to_string());
    }
    let t = &cfg.stage_timeouts;
    if [t.collecting, t.analyzing, t.planning, t.applying, t.verifying, t.reporting]
        .contains(&0)
        || cfg.approval_timeout_ms == 0
    {
        return Err("stage and approval timeouts must be > 0".to_string());
    }
    if cfg.top_n == 0 {
        return Err("top_n must be > 0".to_string());
    }
    if cfg
        .verify_command
        .as_ref()
        .is_some_and(|cmd| cmd.program.trim().is_empty())
    {
        return Err("verify_command.program cannot be empty".to_string());
    }
    for url in [&cfg.ticketing.url, &cfg.notification.webhook_url]
        .into_iter()
        .flatten()
    {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("collaborator url must be http(s): {url}"));
        }
    }
    Ok(())
}

/// File, then environment, then validation.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, OrchestratorError> {
    let cfg = apply_env_overrides(load_config_file(path)?);
    validate_config_contract(&cfg).map_err(OrchestratorError::Config)?;
    Ok(cfg)
}
