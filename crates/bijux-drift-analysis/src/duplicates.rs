//! Near-duplicate detection for issue records and the flattened relation
//! graph that links them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bijux_drift_model::{IssueId, IssueRecord, IssueStatus, ModelError};

pub const DUPLICATE_THRESHOLD: f64 = 0.70;

const KEYWORD_WEIGHT: f64 = 4.0;
const COMPONENT_WEIGHT: f64 = 3.0;
const FILES_WEIGHT: f64 = 3.0;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "was", "when", "with",
];

#[must_use]
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|tok| tok.len() >= 2 && !STOPWORDS.contains(tok))
        .map(str::to_string)
        .collect()
}

fn normalize_file(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut out = unified.as_str();
    while let Some(rest) = out.strip_prefix("./") {
        out = rest;
    }
    out.to_string()
}

/// Jaccard similarity; two empty sets are identical.
#[must_use]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    shared / union
}

#[must_use]
pub fn same_component(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Weighted overlap in `[0, 1]`; symmetric in its arguments.
#[must_use]
pub fn similarity(a: &IssueRecord, b: &IssueRecord) -> f64 {
    let keywords = jaccard(&tokens(&a.symptom), &tokens(&b.symptom));
    let component = if same_component(&a.component, &b.component) {
        1.0
    } else {
        0.0
    };
    let files_a = a.files.iter().map(|f| normalize_file(f)).collect::<BTreeSet<_>>();
    let files_b = b.files.iter().map(|f| normalize_file(f)).collect::<BTreeSet<_>>();
    let files = jaccard(&files_a, &files_b);
    (KEYWORD_WEIGHT * keywords + COMPONENT_WEIGHT * component + FILES_WEIGHT * files)
        / (KEYWORD_WEIGHT + COMPONENT_WEIGHT + FILES_WEIGHT)
}

#[must_use]
pub fn is_degenerate(record: &IssueRecord) -> bool {
    tokens(&record.symptom).is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub canonical: IssueId,
    /// Records whose relations or status changed.
    pub changed: BTreeSet<IssueId>,
}

fn inconsistent(detail: String) -> ModelError {
    ModelError::InconsistentRelations(detail)
}

/// Arena of issue records keyed by id. Relations are id lists, never
/// references, and every cluster points at one canonical original.
#[derive(Debug, Clone, Default)]
pub struct DuplicateGraph {
    records: BTreeMap<IssueId, IssueRecord>,
}

impl DuplicateGraph {
    pub fn new(records: impl IntoIterator<Item = IssueRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, id: &IssueId) -> Option<&IssueRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &IssueRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<IssueRecord> {
        self.records.into_values().collect()
    }

    #[must_use]
    pub fn canonical_of(&self, id: &IssueId) -> Option<IssueId> {
        let record = self.records.get(id)?;
        Some(
            record
                .potential_duplicates_of
                .iter()
                .next()
                .cloned()
                .unwrap_or_else(|| record.id.clone()),
        )
    }

    /// Records at or above the threshold for `id`, most similar first.
    #[must_use]
    pub fn candidates_for(&self, id: &IssueId) -> Vec<(IssueId, f64)> {
        let Some(subject) = self.records.get(id) else {
            return Vec::new();
        };
        if is_degenerate(subject) {
            return Vec::new();
        }
        let mut out = self
            .records
            .values()
            .filter(|other| other.id != *id && other.status != IssueStatus::Resolved)
            .filter(|other| !is_degenerate(other))
            .map(|other| (other.id.clone(), similarity(subject, other)))
            .filter(|(_, score)| *score >= DUPLICATE_THRESHOLD)
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn cluster(&self, seeds: &[&IssueId]) -> Result<BTreeSet<IssueId>, ModelError> {
        let mut seen = BTreeSet::new();
        let mut queue = seeds.iter().map(|id| (*id).clone()).collect::<VecDeque<_>>();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let record = self
                .records
                .get(&id)
                .ok_or_else(|| inconsistent(format!("{id} is referenced but not loaded")))?;
            queue.extend(record.potential_duplicates_of.iter().cloned());
            queue.extend(record.duplicated_by.iter().cloned());
        }
        Ok(seen)
    }

    /// Links `a` and `b` unconditionally and flattens the merged cluster onto
    /// its earliest-created record.
    pub fn link(&mut self, a: &IssueId, b: &IssueId) -> Result<LinkOutcome, ModelError> {
        if a == b {
            return Err(inconsistent(format!("{a} cannot duplicate itself")));
        }
        for id in [a, b] {
            let record = self
                .records
                .get(id)
                .ok_or_else(|| inconsistent(format!("{id} is not loaded")))?;
            if record.status == IssueStatus::Resolved {
                return Err(ModelError::IllegalTransition {
                    entity: "issue",
                    from: IssueStatus::Resolved.as_str().to_string(),
                    to: IssueStatus::Duplicate.as_str().to_string(),
                });
            }
        }
        let members = self.cluster(&[a, b])?;
        let canonical = members
            .iter()
            .filter_map(|id| self.records.get(id))
            .min_by(|x, y| {
                x.created_at_ms
                    .cmp(&y.created_at_ms)
                    .then_with(|| x.id.cmp(&y.id))
            })
            .map(|r| r.id.clone())
            .ok_or_else(|| inconsistent("empty cluster".to_string()))?;

        let others = members
            .iter()
            .filter(|id| **id != canonical)
            .cloned()
            .collect::<BTreeSet<_>>();
        let mut changed = BTreeSet::new();
        for id in &members {
            let Some(record) = self.records.get_mut(id) else {
                continue;
            };
            let before = record.clone();
            if *id == canonical {
                record.potential_duplicates_of.clear();
                record.duplicated_by = others.clone();
                if record.status == IssueStatus::Duplicate {
                    record.status = if record.ticket.is_some() {
                        IssueStatus::Tracked
                    } else {
                        IssueStatus::Untracked
                    };
                }
            } else {
                record.potential_duplicates_of = BTreeSet::from([canonical.clone()]);
                record.duplicated_by.clear();
                if record.status.can_transition_to(IssueStatus::Duplicate) {
                    record.status = IssueStatus::Duplicate;
                }
            }
            if *record != before {
                changed.insert(id.clone());
            }
        }
        self.check_consistency()?;
        Ok(LinkOutcome { canonical, changed })
    }

    /// Links only when the pair scores at or above the threshold.
    pub fn link_if_similar(&mut self, a: &IssueId, b: &IssueId) -> Result<Option<LinkOutcome>, ModelError> {
        let (Some(x), Some(y)) = (self.records.get(a), self.records.get(b)) else {
            return Err(inconsistent(format!("{a} or {b} is not loaded")));
        };
        if is_degenerate(x) || is_degenerate(y) || similarity(x, y) < DUPLICATE_THRESHOLD {
            return Ok(None);
        }
        self.link(a, b).map(Some)
    }

    /// Bidirectional relations, a single canonical per record and no chains.
    pub fn check_consistency(&self) -> Result<(), ModelError> {
        for record in self.records.values() {
            if record.potential_duplicates_of.len() > 1 {
                return Err(inconsistent(format!("{} points at several originals", record.id)));
            }
            if !record.potential_duplicates_of.is_empty() && !record.duplicated_by.is_empty() {
                return Err(inconsistent(format!("{} is both a duplicate and an original", record.id)));
            }
            for original in &record.potential_duplicates_of {
                let target = self
                    .records
                    .get(original)
                    .ok_or_else(|| inconsistent(format!("{original} is referenced but not loaded")))?;
                if !target.duplicated_by.contains(&record.id) {
                    return Err(inconsistent(format!(
                        "{} lists {original} but {original} does not list it back",
                        record.id
                    )));
                }
            }
            for copy in &record.duplicated_by {
                let target = self
                    .records
                    .get(copy)
                    .ok_or_else(|| inconsistent(format!("{copy} is referenced but not loaded")))?;
                if !target.potential_duplicates_of.contains(&record.id) {
                    return Err(inconsistent(format!(
                        "{} lists {copy} as duplicated-by but {copy} does not point back",
                        record.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, component: &str, symptom: &str) -> IssueRecord {
        IssueRecord::new(IssueId::from_sequence(seq), seq * 10, component, symptom)
    }

    #[test]
    fn tokens_drop_stopwords_and_short_words() {
        let got = tokens("The login-Form is a 500 on /auth");
        let want = ["login", "form", "500", "auth"]
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        assert_eq!(got, want);
    }

    #[test]
    fn identical_records_score_one() {
        let a = record(1, "Backend Auth", "token refresh returns 401");
        assert!((similarity(&a, &a) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn file_paths_are_normalized() {
        let mut a = record(1, "api", "crash on save");
        let mut b = record(2, "API ", "crash on save");
        a.files.insert("./src\\users.rs".to_string());
        b.files.insert("src/users.rs".to_string());
        assert!((similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn different_components_cap_below_threshold_without_files() {
        let mut a = record(1, "billing", "invoice total wrong");
        let mut b = record(2, "auth", "invoice total wrong");
        a.files.insert("a.rs".to_string());
        b.files.insert("b.rs".to_string());
        assert!(similarity(&a, &b) < DUPLICATE_THRESHOLD);
    }

    #[test]
    fn link_marks_later_record_duplicate() {
        let mut graph = DuplicateGraph::new([
            record(1, "auth", "login fails"),
            record(2, "auth", "login fails"),
        ]);
        let out = graph
            .link(&IssueId::from_sequence(2), &IssueId::from_sequence(1))
            .expect("link");
        assert_eq!(out.canonical, IssueId::from_sequence(1));
        let later = graph.get(&IssueId::from_sequence(2)).expect("later");
        assert_eq!(later.status, IssueStatus::Duplicate);
        assert!(!later.wants_ticket());
        graph.check_consistency().expect("consistent");
    }

    #[test]
    fn resolved_records_are_not_linked() {
        let mut resolved = record(1, "auth", "login fails");
        resolved.status = IssueStatus::Resolved;
        let mut graph = DuplicateGraph::new([resolved, record(2, "auth", "login fails")]);
        assert!(graph
            .link(&IssueId::from_sequence(1), &IssueId::from_sequence(2))
            .is_err());
    }

    #[test]
    fn degenerate_records_are_never_candidates() {
        let graph = DuplicateGraph::new([record(1, "auth", "?!"), record(2, "auth", "...")]);
        assert!(graph.candidates_for(&IssueId::from_sequence(1)).is_empty());
    }
}
