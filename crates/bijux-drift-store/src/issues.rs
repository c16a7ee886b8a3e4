use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bijux_drift_analysis::{DuplicateGraph, LinkOutcome};
use bijux_drift_model::{IssueId, IssueRecord, IssueStatus, MismatchId, Severity, TicketId};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::StoreError;

pub const STORE_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A finding to be tracked as an issue record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub mismatch_id: MismatchId,
    pub severity: Severity,
    pub component: String,
    pub symptom: String,
    pub reproduction_steps: Vec<String>,
    pub files: BTreeSet<String>,
}

enum Scope<'a> {
    Cluster(&'a [&'a IssueId]),
    All,
}

/// SQLite-backed issue records. Every write is one `BEGIN IMMEDIATE`
/// transaction that re-checks the duplicate relations it touched.
#[derive(Clone)]
pub struct IssueStore {
    conn: Arc<Mutex<Connection>>,
}

impl IssueStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS issue_records (
              id TEXT PRIMARY KEY,
              seq INTEGER NOT NULL UNIQUE,
              created_at INTEGER NOT NULL,
              status TEXT NOT NULL,
              mismatch_id TEXT,
              body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS issue_records_status ON issue_records(status);
            CREATE INDEX IF NOT EXISTS issue_records_mismatch ON issue_records(mismatch_id);
            ",
        )?;
        conn.execute_batch(&format!("PRAGMA user_version={STORE_SCHEMA_VERSION};"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Records a finding once per open mismatch. Returns the record and
    /// whether it was created by this call.
    pub fn record_finding(&self, finding: &Finding, now_ms: u64) -> Result<(IssueRecord, bool), StoreError> {
        self.with_tx(|tx| {
            if let Some(existing) = open_for_mismatch(tx, &finding.mismatch_id)? {
                return Ok((existing, false));
            }
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM issue_records",
                [],
                |row| row.get(0),
            )?;
            let mut record = IssueRecord::new(
                IssueId::from_sequence(u64::try_from(seq).unwrap_or(0)),
                now_ms,
                &finding.component,
                &finding.symptom,
            );
            record.severity = finding.severity;
            record.reproduction_steps = finding.reproduction_steps.clone();
            record.files = finding.files.clone();
            record.mismatch_id = Some(finding.mismatch_id.clone());
            insert(tx, seq, &record)?;
            info!(issue = %record.id, mismatch = %finding.mismatch_id, "issue recorded");
            Ok((record, true))
        })
    }

    pub fn get(&self, id: &IssueId) -> Result<Option<IssueRecord>, StoreError> {
        self.with_conn(|conn| load(conn, id))
    }

    /// Newest record for a mismatch, resolved or not.
    pub fn find_by_mismatch(&self, mismatch_id: &MismatchId) -> Result<Option<IssueRecord>, StoreError> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM issue_records WHERE mismatch_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![mismatch_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| decode(&b)).transpose()
        })
    }

    pub fn list(&self, status: Option<IssueStatus>) -> Result<Vec<IssueRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM issue_records WHERE (?1 IS NULL OR status = ?1) ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![status.map(IssueStatus::as_str)], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for body in rows {
                out.push(decode(&body?)?);
            }
            Ok(out)
        })
    }

    pub fn open_records(&self) -> Result<Vec<IssueRecord>, StoreError> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(IssueRecord::is_open)
            .collect())
    }

    pub fn transition(&self, id: &IssueId, to: IssueStatus) -> Result<IssueRecord, StoreError> {
        self.mutate_one(id, |record| record.transition(to))
    }

    /// Automated filing: Untracked, non-duplicate records only.
    pub fn attach_ticket(&self, id: &IssueId, ticket: &TicketId) -> Result<IssueRecord, StoreError> {
        self.mutate_one(id, |record| record.attach_ticket(ticket.clone()))
    }

    /// Operator override of the duplicate skip.
    pub fn force_ticket(&self, id: &IssueId, ticket: &TicketId) -> Result<IssueRecord, StoreError> {
        self.mutate_one(id, |record| record.force_ticket(ticket.clone()))
    }

    /// Links `id` to every open record similar enough to it.
    pub fn link_duplicates(&self, id: &IssueId) -> Result<Option<LinkOutcome>, StoreError> {
        self.mutate_graph(Scope::All, |graph| {
            let subject = graph.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if subject.status == IssueStatus::Resolved {
                return Ok(None);
            }
            let mut last = None;
            for (candidate, score) in graph.candidates_for(id) {
                if graph.canonical_of(&candidate) == graph.canonical_of(id) {
                    continue;
                }
                debug!(issue = %id, candidate = %candidate, score, "duplicate candidate");
                last = Some(graph.link(id, &candidate)?);
            }
            Ok(last)
        })
    }

    /// Operator override: links regardless of similarity.
    pub fn mark_duplicate(&self, id: &IssueId, of: &IssueId) -> Result<LinkOutcome, StoreError> {
        self.mutate_graph(Scope::Cluster(&[id, of]), |graph| Ok(graph.link(id, of)?))
    }

    fn mutate_one(
        &self,
        id: &IssueId,
        f: impl FnOnce(&mut IssueRecord) -> Result<(), bijux_drift_model::ModelError>,
    ) -> Result<IssueRecord, StoreError> {
        let target = id.clone();
        self.mutate_graph(Scope::Cluster(&[id]), move |graph| {
            let mut records = std::mem::take(graph).into_records();
            let record = records
                .iter_mut()
                .find(|r| r.id == target)
                .ok_or_else(|| StoreError::NotFound(target.clone()))?;
            f(record)?;
            let updated = record.clone();
            *graph = DuplicateGraph::new(records);
            Ok(updated)
        })
    }

    fn mutate_graph<T>(
        &self,
        scope: Scope<'_>,
        f: impl FnOnce(&mut DuplicateGraph) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_tx(|tx| {
            let before = match scope {
                Scope::All => load_all(tx)?,
                Scope::Cluster(seeds) => load_cluster(tx, seeds)?,
            };
            let mut graph = DuplicateGraph::new(before.values().cloned());
            let out = f(&mut graph)?;
            graph.check_consistency()?;
            for record in graph.records() {
                if before.get(&record.id) != Some(record) {
                    update(tx, record)?;
                }
            }
            Ok(out)
        })
    }
}

fn decode(body: &str) -> Result<IssueRecord, StoreError> {
    Ok(serde_json::from_str(body)?)
}

fn insert(tx: &Transaction<'_>, seq: i64, record: &IssueRecord) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO issue_records (id, seq, created_at, status, mismatch_id, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.id.as_str(),
            seq,
            i64::try_from(record.created_at_ms).unwrap_or(i64::MAX),
            record.status.as_str(),
            record.mismatch_id.as_ref().map(MismatchId::as_str),
            serde_json::to_string(record)?,
        ],
    )?;
    Ok(())
}

fn update(tx: &Transaction<'_>, record: &IssueRecord) -> Result<(), StoreError> {
    let changed = tx.execute(
        "UPDATE issue_records SET status = ?2, body = ?3 WHERE id = ?1",
        params![
            record.id.as_str(),
            record.status.as_str(),
            serde_json::to_string(record)?,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(record.id.clone()));
    }
    Ok(())
}

fn load(conn: &Connection, id: &IssueId) -> Result<Option<IssueRecord>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM issue_records WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| decode(&b)).transpose()
}

fn open_for_mismatch(conn: &Connection, mismatch_id: &MismatchId) -> Result<Option<IssueRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT body FROM issue_records WHERE mismatch_id = ?1 AND status != 'resolved' ORDER BY seq",
    )?;
    let mut rows = stmt.query_map(params![mismatch_id.as_str()], |row| row.get::<_, String>(0))?;
    let first = rows.next().transpose()?;
    first.map(|body| decode(&body)).transpose()
}

fn load_all(conn: &Connection) -> Result<BTreeMap<IssueId, IssueRecord>, StoreError> {
    let mut stmt = conn.prepare("SELECT body FROM issue_records ORDER BY seq")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = BTreeMap::new();
    for body in rows {
        let record = decode(&body?)?;
        out.insert(record.id.clone(), record);
    }
    Ok(out)
}

/// Seeds plus everything reachable through their relation lists.
fn load_cluster(conn: &Connection, seeds: &[&IssueId]) -> Result<BTreeMap<IssueId, IssueRecord>, StoreError> {
    let mut out = BTreeMap::new();
    let mut queue = seeds.iter().map(|id| (*id).clone()).collect::<VecDeque<_>>();
    while let Some(id) = queue.pop_front() {
        if out.contains_key(&id) {
            continue;
        }
        let record = load(conn, &id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
        queue.extend(record.potential_duplicates_of.iter().cloned());
        queue.extend(record.duplicated_by.iter().cloned());
        out.insert(id, record);
    }
    Ok(out)
}
