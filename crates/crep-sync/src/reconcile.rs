//! Decides which closed competencies of the current month are new work.
//!
//! Three snapshots take part: the current month and the two months before
//! it. A competency closed in both prior months is considered captured and
//! skipped, unless it went through a reopen cycle in the meantime.

use std::collections::HashSet;
use std::path::PathBuf;

use crep_core::MonthKey;
use crep_storage::{CompetencySnapshot, SnapshotError, SnapshotStore, Table};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("writing work-list {path}: {source}")]
    WriteWorkList {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// The three snapshots a decision is made from. Prior months are `None`
/// when absent or unusable.
#[derive(Debug, Clone)]
pub struct SnapshotTriple {
    pub current: CompetencySnapshot,
    pub month_1: Option<CompetencySnapshot>,
    pub month_2: Option<CompetencySnapshot>,
}

/// Outcome of the set arithmetic, before anything is persisted.
#[derive(Debug, Clone)]
pub struct WorkPlan {
    /// Current-snapshot rows that must be extracted, original order.
    pub work_list: Table,
    pub candidate_keys: HashSet<String>,
    pub excluded_keys: HashSet<String>,
    pub reopened_keys: HashSet<String>,
    pub first_run: bool,
}

impl WorkPlan {
    pub fn is_empty(&self) -> bool {
        self.work_list.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyReason {
    NoNewCompetencies,
    CurrentSnapshotUnavailable(String),
}

/// Top-level workflow selected for a month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileVerdict {
    Copy(CopyReason),
    Process { work_list: PathBuf, entries: usize },
}

impl ReconcileVerdict {
    pub fn mode_label(&self) -> &'static str {
        match self {
            Self::Copy(_) => "copy",
            Self::Process { .. } => "process",
        }
    }
}

/// Pure set computation over an explicit snapshot triple.
pub fn plan_work(triple: &SnapshotTriple, closed_only: bool) -> WorkPlan {
    let current = &triple.current;
    let candidate_keys: HashSet<String> = current
        .entries
        .iter()
        .filter(|c| !closed_only || c.status.is_eligible())
        .map(|c| c.key())
        .collect();

    let (excluded_keys, reopened_keys, first_run) = match (&triple.month_1, &triple.month_2) {
        (None, None) => (HashSet::new(), HashSet::new(), true),
        (Some(only), None) | (None, Some(only)) => (only.closed_keys(), HashSet::new(), false),
        (Some(m1), Some(m2)) => {
            let closed_1 = m1.closed_keys();
            let closed_2 = m2.closed_keys();
            let reopened_1 = m1.reopened_keys();
            let reopened_2 = m2.reopened_keys();

            // closed -> reopened -> closed
            let cycle_1: HashSet<String> = closed_2
                .intersection(&reopened_1)
                .filter(|k| candidate_keys.contains(*k))
                .cloned()
                .collect();
            // reopened -> closed -> closed
            let cycle_2: HashSet<String> = reopened_2
                .intersection(&closed_1)
                .filter(|k| candidate_keys.contains(*k))
                .cloned()
                .collect();
            let reopened: HashSet<String> = cycle_1.union(&cycle_2).cloned().collect();

            let excluded = closed_1
                .intersection(&closed_2)
                .filter(|k| !reopened.contains(*k))
                .cloned()
                .collect();
            (excluded, reopened, false)
        }
    };

    let work_list = current.select(|c| {
        (!closed_only || c.status.is_eligible()) && !excluded_keys.contains(&c.key())
    });

    WorkPlan {
        work_list,
        candidate_keys,
        excluded_keys,
        reopened_keys,
        first_run,
    }
}

pub struct ReconciliationEngine {
    store: SnapshotStore,
}

impl ReconciliationEngine {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    /// Loads `month` tolerating bad rows; prior months degrade to absent.
    pub fn load_triple(&self, month: MonthKey) -> Result<SnapshotTriple, SnapshotError> {
        let current = self.store.load_current_competencies(month)?;
        let prior_1 = month.previous();
        Ok(SnapshotTriple {
            current,
            month_1: self.store.read_competencies(prior_1),
            month_2: self.store.read_competencies(prior_1.previous()),
        })
    }

    /// Reconciles `month` and, in process mode, persists the work-list next
    /// to the current snapshot.
    pub fn reconcile(
        &self,
        month: MonthKey,
        closed_only: bool,
    ) -> Result<ReconcileVerdict, ReconcileError> {
        let triple = match self.load_triple(month) {
            Ok(triple) => triple,
            Err(err) => {
                error!(month = %month, error = %err, "current competency snapshot unavailable; falling back to copy");
                return Ok(ReconcileVerdict::Copy(CopyReason::CurrentSnapshotUnavailable(
                    err.to_string(),
                )));
            }
        };
        self.decide(&triple, closed_only)
    }

    pub fn decide(
        &self,
        triple: &SnapshotTriple,
        closed_only: bool,
    ) -> Result<ReconcileVerdict, ReconcileError> {
        let month = triple.current.month;
        if triple.month_1.is_some() != triple.month_2.is_some() {
            warn!(month = %month, "only one prior snapshot available; reopen detection disabled");
        }

        let plan = plan_work(triple, closed_only);
        info!(
            month = %month,
            candidates = plan.candidate_keys.len(),
            excluded = plan.excluded_keys.len(),
            reopened = plan.reopened_keys.len(),
            work_items = plan.work_list.len(),
            first_run = plan.first_run,
            "reconciliation finished"
        );

        if plan.is_empty() {
            info!(month = %month, "no new competencies; copy mode");
            return Ok(ReconcileVerdict::Copy(CopyReason::NoNewCompetencies));
        }

        let path = self
            .store
            .write_work_list(month, &plan.work_list)
            .map_err(|source| ReconcileError::WriteWorkList {
                path: self.store.work_list_path(month),
                source,
            })?;
        Ok(ReconcileVerdict::Process {
            work_list: path,
            entries: plan.work_list.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crep_storage::{read_table, REQUIRED_COMPETENCY_COLUMNS};
    use tempfile::tempdir;

    fn snapshot(month: MonthKey, rows: &[(&str, &str, &str)]) -> CompetencySnapshot {
        let table = Table::with_rows(
            REQUIRED_COMPETENCY_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|(unit, period, status)| {
                    vec![
                        format!("id-{unit}"),
                        "tok".to_string(),
                        period.to_string(),
                        unit.to_string(),
                        status.to_string(),
                    ]
                })
                .collect(),
        );
        CompetencySnapshot::from_table(month, PathBuf::from("mem"), table).unwrap()
    }

    fn month(m: u32) -> MonthKey {
        MonthKey::new(m, 2024).unwrap()
    }

    fn work_keys(plan: &WorkPlan) -> Vec<String> {
        (0..plan.work_list.len())
            .map(|i| {
                format!(
                    "{}_{}",
                    plan.work_list.cell(i, "nome").unwrap(),
                    plan.work_list.cell(i, "competencia").unwrap()
                )
            })
            .collect()
    }

    #[test]
    fn reopen_cycle_is_included_and_stable_close_excluded() {
        let triple = SnapshotTriple {
            current: snapshot(
                month(4),
                &[
                    ("Hospital A", "03/2024", "FECHADA"),
                    ("Hospital A", "02/2024", "FECHADA"),
                    ("Hospital A", "04/2024", "ABERTA"),
                ],
            ),
            month_1: Some(snapshot(
                month(3),
                &[
                    ("Hospital A", "03/2024", "REABERTA"),
                    ("Hospital A", "02/2024", "FECHADA"),
                ],
            )),
            month_2: Some(snapshot(
                month(2),
                &[
                    ("Hospital A", "03/2024", "FECHADA"),
                    ("Hospital A", "02/2024", "FECHADA"),
                ],
            )),
        };

        let plan = plan_work(&triple, true);
        assert_eq!(work_keys(&plan), vec!["Hospital A_03/2024"]);
        assert!(plan.excluded_keys.contains("Hospital A_02/2024"));
    }

    #[test]
    fn reopen_then_close_across_prior_months_is_included() {
        let triple = SnapshotTriple {
            current: snapshot(month(4), &[("UPA B", "01/2024", "FECHADA")]),
            month_1: Some(snapshot(month(3), &[("UPA B", "01/2024", "FECHADA")])),
            month_2: Some(snapshot(month(2), &[("UPA B", "01/2024", "REABERTA")])),
        };
        let plan = plan_work(&triple, true);
        assert_eq!(work_keys(&plan), vec!["UPA B_01/2024"]);
        assert!(plan.reopened_keys.contains("UPA B_01/2024"));
    }

    #[test]
    fn closed_in_only_one_prior_month_is_still_work() {
        let triple = SnapshotTriple {
            current: snapshot(month(4), &[("AME C", "02/2024", "FECHADA")]),
            month_1: Some(snapshot(month(3), &[("AME C", "02/2024", "FECHADA")])),
            month_2: Some(snapshot(month(2), &[("AME C", "02/2024", "ABERTA")])),
        };
        assert_eq!(work_keys(&plan_work(&triple, true)), vec!["AME C_02/2024"]);
    }

    #[test]
    fn first_run_takes_every_closed_entry() {
        let triple = SnapshotTriple {
            current: snapshot(
                month(4),
                &[
                    ("Hospital A", "03/2024", "FECHADA"),
                    ("Hospital A", "04/2024", "ABERTA"),
                    ("UPA B", "03/2024", "REABERTA"),
                    ("UPA B", "02/2024", "FECHADA"),
                ],
            ),
            month_1: None,
            month_2: None,
        };
        let plan = plan_work(&triple, true);
        assert!(plan.first_run);
        assert_eq!(work_keys(&plan), vec!["Hospital A_03/2024", "UPA B_02/2024"]);
    }

    #[test]
    fn single_prior_month_excludes_its_closed_set_without_reopen_override() {
        let triple = SnapshotTriple {
            current: snapshot(
                month(4),
                &[("Hospital A", "03/2024", "FECHADA"), ("Hospital A", "02/2024", "FECHADA")],
            ),
            month_1: None,
            month_2: Some(snapshot(month(2), &[("Hospital A", "03/2024", "FECHADA")])),
        };
        let plan = plan_work(&triple, true);
        assert_eq!(work_keys(&plan), vec!["Hospital A_02/2024"]);
        assert!(plan.reopened_keys.is_empty());
    }

    #[test]
    fn reconcile_writes_work_list_or_signals_copy() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let engine = ReconciliationEngine::new(store.clone());

        let current = snapshot(month(4), &[("Hospital A", "03/2024", "FECHADA")]);
        store.ensure_month_dir(month(4)).unwrap();
        store.write_competencies(month(4), &current.table).unwrap();

        let verdict = engine.reconcile(month(4), true).unwrap();
        let ReconcileVerdict::Process { work_list, entries } = verdict else {
            panic!("expected process verdict");
        };
        assert_eq!(entries, 1);
        assert_eq!(read_table(&work_list).unwrap(), current.table);

        for m in [2, 3] {
            store.ensure_month_dir(month(m)).unwrap();
            store.write_competencies(month(m), &current.table).unwrap();
        }
        assert_eq!(
            engine.reconcile(month(4), true).unwrap(),
            ReconcileVerdict::Copy(CopyReason::NoNewCompetencies)
        );
    }

    #[test]
    fn unknown_status_in_current_month_does_not_force_copy() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let table = Table::with_rows(
            REQUIRED_COMPETENCY_COLUMNS.iter().map(|c| c.to_string()).collect(),
            vec![
                vec!["1".into(), "t".into(), "02/2024".into(), "Hospital A".into(), "FECHADA".into()],
                vec!["2".into(), "t".into(), "02/2024".into(), "UPA B".into(), "EM_ANALISE".into()],
                vec!["3".into(), "t".into(), "03/2024".into(), "AME C".into(), "ABERTA".into()],
            ],
        );
        store.ensure_month_dir(month(3)).unwrap();
        store.write_competencies(month(3), &table).unwrap();

        let engine = ReconciliationEngine::new(store);
        let ReconcileVerdict::Process { work_list, entries } = engine.reconcile(month(3), true).unwrap()
        else {
            panic!("expected process verdict");
        };
        assert_eq!(entries, 2);
        let written = read_table(&work_list).unwrap();
        assert_eq!(written.cell(0, "nome"), Some("Hospital A"));
        assert_eq!(written.cell(1, "situacao"), Some("EM_ANALISE"));
    }

    #[test]
    fn missing_current_snapshot_falls_back_to_copy() {
        let dir = tempdir().unwrap();
        let engine = ReconciliationEngine::new(SnapshotStore::new(dir.path()));
        assert!(matches!(
            engine.reconcile(month(4), true).unwrap(),
            ReconcileVerdict::Copy(CopyReason::CurrentSnapshotUnavailable(_))
        ));
    }
}
