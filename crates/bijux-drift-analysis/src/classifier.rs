//! Deterministic decision table over collected evidence.

use bijux_drift_model::{Classification, ClassificationKind, Evidence, Mismatch};

const ROW_TEST: &str = "handler exists and routing resolves to it: harness or config issue";
const ROW_WIRING_REGENERATED: &str = "handler exists, routing broken, regeneration is newer: regeneration broke wiring";
const ROW_WIRING_MANUAL: &str = "handler exists, routing broken, no regeneration since the last edit: wiring broken by a manual change";
const ROW_DROPPED: &str = "no handler, regeneration is newer: regeneration dropped the handler";
const ROW_MISSING: &str = "no handler, no regeneration since the last edit: handler never implemented or deleted";

fn unknown(mismatch: &Mismatch, consulted: &[&str]) -> Classification {
    let rationale = format!(
        "evidence unresolved ({}): conservative true regression, review manually",
        consulted.join(", ")
    );
    Classification::low(mismatch.id.clone(), ClassificationKind::TrueRegression, &rationale)
}

/// Pure function of the evidence: the same input always yields the same label.
#[must_use]
pub fn classify(mismatch: &Mismatch, evidence: &Evidence) -> Classification {
    let id = mismatch.id.clone();
    let Some(handler) = evidence.handler_exists else {
        return unknown(mismatch, &["handler_exists"]);
    };
    if handler {
        match evidence.routing_correct {
            None => unknown(mismatch, &["routing_correct"]),
            Some(true) => Classification::high(id, ClassificationKind::TestArtifact, ROW_TEST),
            Some(false) => match evidence.recent_regeneration {
                None => unknown(mismatch, &["recent_regeneration"]),
                Some(true) => Classification::high(id, ClassificationKind::ToolArtifact, ROW_WIRING_REGENERATED),
                Some(false) => Classification::high(id, ClassificationKind::TrueRegression, ROW_WIRING_MANUAL),
            },
        }
    } else {
        // routing is not consulted once the handler is known to be missing
        match evidence.recent_regeneration {
            None => unknown(mismatch, &["recent_regeneration"]),
            Some(true) => Classification::high(id, ClassificationKind::ToolArtifact, ROW_DROPPED),
            Some(false) => Classification::high(id, ClassificationKind::TrueRegression, ROW_MISSING),
        }
    }
}
