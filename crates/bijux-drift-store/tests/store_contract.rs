// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::thread;

use bijux_drift_model::{IssueStatus, MismatchId, RunId, RunReportDraft, Severity, TicketId};
use bijux_drift_store::{Finding, IssueStore, RunLog};

fn finding(n: u8, component: &str, symptom: &str) -> Finding {
    Finding {
        mismatch_id: MismatchId::parse(&format!("mm_{n:016x}")).expect("mismatch id"),
        severity: Severity::High,
        component: component.to_string(),
        symptom: symptom.to_string(),
        reproduction_steps: Vec::new(),
        files: BTreeSet::new(),
    }
}

#[test]
fn records_survive_reopen() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("nested/issues.sqlite");
    let id = {
        let store = IssueStore::open(&path).expect("open");
        store
            .record_finding(&finding(1, "api", "orders endpoint missing"), 5)
            .expect("record")
            .0
            .id
    };
    let reopened = IssueStore::open(&path).expect("reopen");
    let record = reopened.get(&id).expect("get").expect("record");
    assert_eq!(record.symptom, "orders endpoint missing");
    assert_eq!(record.created_at_ms, 5);
}

#[test]
fn similar_findings_link_and_later_one_skips_ticketing() {
    let store = IssueStore::open_in_memory().expect("store");
    let (first, _) = store
        .record_finding(&finding(1, "Backend Auth", "login token expired refresh session"), 1)
        .expect("first");
    let (later, _) = store
        .record_finding(&finding(2, "Backend Auth", "login token expired refresh"), 2)
        .expect("later");
    let outcome = store
        .link_duplicates(&later.id)
        .expect("link")
        .expect("linked");
    assert_eq!(outcome.canonical, first.id);

    let later = store.get(&later.id).expect("get").expect("later");
    assert_eq!(later.status, IssueStatus::Duplicate);
    assert!(store
        .attach_ticket(&later.id, &TicketId::parse("TCK-9").expect("ticket"))
        .is_err());
    let first = store.get(&first.id).expect("get").expect("first");
    assert!(first.duplicated_by.contains(&later.id));
    assert!(first.wants_ticket());
}

#[test]
fn operator_mark_duplicate_flattens_chains() {
    let store = IssueStore::open_in_memory().expect("store");
    let a = store.record_finding(&finding(1, "ui", "alpha"), 1).expect("a").0;
    let b = store.record_finding(&finding(2, "api", "beta"), 2).expect("b").0;
    let c = store.record_finding(&finding(3, "db", "gamma"), 3).expect("c").0;
    store.mark_duplicate(&c.id, &b.id).expect("c of b");
    store.mark_duplicate(&b.id, &a.id).expect("b of a");
    for id in [&b.id, &c.id] {
        let record = store.get(id).expect("get").expect("record");
        assert_eq!(record.potential_duplicates_of, BTreeSet::from([a.id.clone()]));
    }
    let a = store.get(&a.id).expect("get").expect("a");
    assert_eq!(a.duplicated_by, BTreeSet::from([b.id, c.id]));
}

#[test]
fn force_ticket_overrides_duplicate_skip() {
    let store = IssueStore::open_in_memory().expect("store");
    let a = store.record_finding(&finding(1, "ui", "alpha"), 1).expect("a").0;
    let b = store.record_finding(&finding(2, "ui", "alpha"), 2).expect("b").0;
    store.mark_duplicate(&b.id, &a.id).expect("dup");
    let forced = store
        .force_ticket(&b.id, &TicketId::parse("TCK-2").expect("ticket"))
        .expect("forced");
    assert_eq!(forced.status, IssueStatus::Duplicate);
    assert_eq!(forced.ticket.as_ref().map(TicketId::as_str), Some("TCK-2"));
}

#[test]
fn concurrent_writers_keep_relations_consistent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = IssueStore::open(&tmp.path().join("issues.sqlite")).expect("open");
    let ids = (1..=6u8)
        .map(|n| {
            store
                .record_finding(&finding(n, "Backend Auth", "login token expired refresh"), u64::from(n))
                .expect("record")
                .0
                .id
        })
        .collect::<Vec<_>>();
    let handles = ids
        .iter()
        .cloned()
        .map(|id| {
            let store = store.clone();
            thread::spawn(move || store.link_duplicates(&id).expect("link"))
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("join");
    }
    let records = store.list(None).expect("list");
    let canonical = &ids[0];
    for record in &records {
        if record.id == *canonical {
            assert_eq!(record.duplicated_by.len(), ids.len() - 1);
        } else {
            assert_eq!(record.potential_duplicates_of, BTreeSet::from([canonical.clone()]));
        }
    }
}

#[test]
fn run_log_appends_one_line_per_report() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let log = RunLog::in_dir(tmp.path());
    for n in 0..2u64 {
        let draft = RunReportDraft::new(RunId::parse(&format!("run_{n}")).expect("run id"), n);
        log.append(&draft.finalize(n + 1)).expect("append");
    }
    let reports = log.read_all().expect("read");
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].run_id.as_str(), "run_1");
}
