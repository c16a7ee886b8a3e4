//! Structured and human-facing renderings of a finished run.
//!
//! The structured form carries every mismatch; only the human summary is
//! truncated to `top_n` items.

use std::fs;
use std::path::{Path, PathBuf};

use bijux_drift_model::{ClassificationKind, FixStatus, MismatchId, RunReport};
use serde::{Deserialize, Serialize};

use crate::OrchestratorError;

pub const REPORT_FILE: &str = "report.json";
pub const SUMMARY_JSON_FILE: &str = "summary.json";
pub const SUMMARY_TEXT_FILE: &str = "summary.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub mismatch_id: MismatchId,
    pub classification: ClassificationKind,
    pub low_confidence: bool,
    pub description: String,
    pub fix_status: Option<FixStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanSummary {
    pub title: String,
    pub timestamp_ms: u64,
    pub facts: Vec<Fact>,
    pub top_items: Vec<SummaryItem>,
    pub recommended_actions: Vec<String>,
    /// Items left out of `top_items`.
    pub truncated: usize,
}

impl HumanSummary {
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = vec![self.title.clone(), format!("finished_at_ms: {}", self.timestamp_ms)];
        out.extend(self.facts.iter().map(|f| format!("{}: {}", f.key, f.value)));
        if !self.top_items.is_empty() {
            out.push(String::new());
            out.push("top items:".to_string());
            for item in &self.top_items {
                let confidence = if item.low_confidence { " (low confidence)" } else { "" };
                let fix = item
                    .fix_status
                    .map(|s| format!(" [fix {}]", s.as_str()))
                    .unwrap_or_default();
                out.push(format!(
                    "- {} {}{confidence}: {}{fix}",
                    item.mismatch_id,
                    item.classification.as_str(),
                    item.description
                ));
            }
            if self.truncated > 0 {
                out.push(format!("... and {} more in report.json", self.truncated));
            }
        }
        if !self.recommended_actions.is_empty() {
            out.push(String::new());
            out.push("recommended actions:".to_string());
            out.extend(self.recommended_actions.iter().map(|a| format!("- {a}")));
        }
        out.push(String::new());
        out.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub structured: serde_json::Value,
    pub human: HumanSummary,
}

fn fact(key: &str, value: impl ToString) -> Fact {
    Fact {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn fix_status_for(report: &RunReport, id: &MismatchId) -> Option<FixStatus> {
    report
        .fixes
        .iter()
        .filter(|fix| fix.mismatch_ids.contains(id))
        .map(|fix| fix.status)
        .max_by_key(|status| match status {
            FixStatus::Verified => 4,
            FixStatus::RolledBack => 3,
            FixStatus::Applied => 2,
            FixStatus::Skipped => 1,
            FixStatus::Proposed => 0,
        })
}

fn recommended_actions(report: &RunReport) -> Vec<String> {
    let c = &report.counts;
    let mut out = Vec::new();
    if c.regressions_open > 0 {
        out.push(format!(
            "investigate {} open true regression(s); tracked issues are listed in report.json",
            c.regressions_open
        ));
    }
    if c.low_confidence > 0 {
        out.push(format!(
            "review {} low-confidence classification(s) manually",
            c.low_confidence
        ));
    }
    if c.skipped > 0 {
        out.push(format!("re-run with approval to apply {} skipped fix(es)", c.skipped));
    }
    if c.fixes_rolled_back > 0 {
        out.push(format!(
            "inspect {} rolled back fix(es); their targets were restored",
            c.fixes_rolled_back
        ));
    }
    if c.test_artifact > 0 {
        out.push(format!(
            "check harness or test configuration for {} test artifact(s)",
            c.test_artifact
        ));
    }
    if c.incomplete > 0 {
        out.push(format!(
            "{} item(s) are incomplete; absence of a finding there is not a pass",
            c.incomplete
        ));
    }
    if let Some(fatal) = &report.fatal {
        out.push(format!("fix the run failure: {fatal}"));
    }
    out
}

#[must_use]
pub fn summarize(report: &RunReport, top_n: usize) -> HumanSummary {
    let c = &report.counts;
    let status = if report.fatal.is_some() {
        "failed"
    } else if report.cancelled {
        "cancelled"
    } else if c.regressions_open > 0 {
        "regressions open"
    } else {
        "clean"
    };
    let facts = vec![
        fact("run_id", &report.run_id),
        fact("final_state", report.final_state.as_str()),
        fact("mismatches", c.mismatches),
        fact("true_regression", c.true_regression),
        fact("tool_artifact", c.tool_artifact),
        fact("test_artifact", c.test_artifact),
        fact("low_confidence", c.low_confidence),
        fact("incomplete", c.incomplete),
        fact("skipped", c.skipped),
        fact("fixes_proposed", c.fixes_proposed),
        fact("fixes_verified", c.fixes_verified),
        fact("fixes_rolled_back", c.fixes_rolled_back),
        fact("regressions_open", c.regressions_open),
        fact("tickets_filed", report.tickets.len()),
    ];

    let mut ranked = report
        .mismatches
        .iter()
        .map(|m| {
            let class = report.classification_for(&m.id);
            let kind = class.map_or(ClassificationKind::TrueRegression, |c| c.kind);
            (kind.priority(), m, class, kind)
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    let truncated = ranked.len().saturating_sub(top_n);
    let top_items = ranked
        .into_iter()
        .take(top_n)
        .map(|(_, m, class, kind)| SummaryItem {
            mismatch_id: m.id.clone(),
            classification: kind,
            // unclassified mismatches are reported conservatively
            low_confidence: class.map_or(true, |c| c.is_low_confidence()),
            description: m.describe(),
            fix_status: fix_status_for(report, &m.id),
        })
        .collect();

    HumanSummary {
        title: format!("bijux-drift run {}: {status}", report.run_id),
        timestamp_ms: report.finished_at_ms,
        facts,
        top_items,
        recommended_actions: recommended_actions(report),
        truncated,
    }
}

pub fn render(report: &RunReport, top_n: usize) -> Result<RenderedReport, OrchestratorError> {
    Ok(RenderedReport {
        structured: serde_json::to_value(report)?,
        human: summarize(report, top_n),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub report: PathBuf,
    pub summary_json: PathBuf,
    pub summary_text: PathBuf,
}

fn write_file(path: &Path, content: &str) -> Result<(), OrchestratorError> {
    fs::write(path, content)
        .map_err(|e| OrchestratorError::Io(format!("write {} failed: {e}", path.display())))
}

/// Writes `<root>/<run_id>/{report.json, summary.json, summary.txt}`.
pub fn write_artifacts(
    report: &RunReport,
    rendered: &RenderedReport,
    root: &Path,
) -> Result<ArtifactPaths, OrchestratorError> {
    let dir = root.join(report.run_id.as_str());
    fs::create_dir_all(&dir)
        .map_err(|e| OrchestratorError::Io(format!("mkdir {} failed: {e}", dir.display())))?;
    let paths = ArtifactPaths {
        report: dir.join(REPORT_FILE),
        summary_json: dir.join(SUMMARY_JSON_FILE),
        summary_text: dir.join(SUMMARY_TEXT_FILE),
        dir,
    };
    write_file(&paths.report, &serde_json::to_string_pretty(&rendered.structured)?)?;
    write_file(&paths.summary_json, &serde_json::to_string_pretty(&rendered.human)?)?;
    write_file(&paths.summary_text, &rendered.human.to_text())?;
    Ok(paths)
}
