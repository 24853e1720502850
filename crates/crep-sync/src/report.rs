//! Execution tracker: collects outcomes and renders the run report.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use crep_core::{ExecutionOutcome, OutcomeStatus};
use crep_storage::{write_atomic, write_table, Table, TableFormat};
use serde::Serialize;
use tracing::info;

use crate::extract::OutcomeSink;

const REPORT_COLUMNS: [&str; 8] = [
    "data_hora",
    "endpoint",
    "unidade",
    "competencia",
    "status",
    "registros",
    "erro",
    "tempo_execucao_s",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerSummary {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub timeout: usize,
    pub no_data: usize,
    pub unavailable: usize,
    pub records: usize,
}

impl TrackerSummary {
    fn add(&mut self, outcome: &ExecutionOutcome) {
        self.total += 1;
        self.records += outcome.records;
        match outcome.status {
            OutcomeStatus::Success => self.success += 1,
            OutcomeStatus::Error => self.error += 1,
            OutcomeStatus::Timeout => self.timeout += 1,
            OutcomeStatus::NoData => self.no_data += 1,
            OutcomeStatus::Unavailable => self.unavailable += 1,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 * 100.0 / self.total as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTracker {
    started_at: DateTime<Utc>,
    outcomes: Vec<ExecutionOutcome>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeSink for ExecutionTracker {
    fn record(&mut self, outcome: ExecutionOutcome) {
        self.outcomes.push(outcome);
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            outcomes: Vec::new(),
        }
    }

    pub fn outcomes(&self) -> &[ExecutionOutcome] {
        &self.outcomes
    }

    pub fn summary(&self) -> TrackerSummary {
        let mut summary = TrackerSummary::default();
        for outcome in &self.outcomes {
            summary.add(outcome);
        }
        summary
    }

    fn per_topic(&self) -> BTreeMap<&str, (TrackerSummary, f64)> {
        let mut topics: BTreeMap<&str, (TrackerSummary, f64)> = BTreeMap::new();
        for outcome in &self.outcomes {
            let entry = topics.entry(outcome.topic.as_str()).or_default();
            entry.0.add(outcome);
            entry.1 += outcome.duration.as_secs_f64();
        }
        topics
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new(REPORT_COLUMNS.iter().map(|c| c.to_string()).collect());
        for o in &self.outcomes {
            table.push_row(vec![
                o.recorded_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
                o.topic.clone(),
                o.unit.clone(),
                o.period.clone(),
                o.status.to_string(),
                o.records.to_string(),
                o.error.clone().unwrap_or_default(),
                format!("{:.2}", o.duration.as_secs_f64()),
            ]);
        }
        table
    }

    pub fn render_markdown(&self, finished_at: DateTime<Utc>) -> String {
        let summary = self.summary();
        let elapsed = (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let mut md = String::new();

        let _ = writeln!(md, "# Execution report\n");
        let _ = writeln!(md, "- Started: {}", self.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(md, "- Finished: {}", finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(md, "- Elapsed: {elapsed:.1}s\n");

        let _ = writeln!(md, "## Totals\n");
        let _ = writeln!(md, "- Requests: {}", summary.total);
        let _ = writeln!(md, "- success: {} ({:.1}%)", summary.success, summary.success_rate());
        let _ = writeln!(md, "- error: {}", summary.error);
        let _ = writeln!(md, "- timeout: {}", summary.timeout);
        let _ = writeln!(md, "- no_data: {}", summary.no_data);
        let _ = writeln!(md, "- unavailable: {}", summary.unavailable);
        let _ = writeln!(md, "- Records extracted: {}\n", summary.records);

        let _ = writeln!(md, "## Per topic\n");
        let _ = writeln!(md, "| topic | requests | success | rate | records | mean s |");
        let _ = writeln!(md, "|---|---|---|---|---|---|");
        for (topic, (s, seconds)) in self.per_topic() {
            let mean = if s.total == 0 { 0.0 } else { seconds / s.total as f64 };
            let _ = writeln!(
                md,
                "| {topic} | {} | {} | {:.1}% | {} | {mean:.2} |",
                s.total,
                s.success,
                s.success_rate(),
                s.records
            );
        }

        let failures: Vec<&ExecutionOutcome> = self
            .outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Error | OutcomeStatus::Timeout))
            .collect();
        if !failures.is_empty() {
            let _ = writeln!(md, "\n## Errors\n");
            for o in failures {
                let _ = writeln!(
                    md,
                    "- {} / {} / {}: {} {}",
                    o.topic,
                    o.unit,
                    o.period,
                    o.status,
                    o.error.as_deref().unwrap_or_default()
                );
            }
        }

        let empty: Vec<&ExecutionOutcome> = self
            .outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::NoData | OutcomeStatus::Unavailable))
            .collect();
        if !empty.is_empty() {
            let _ = writeln!(md, "\n## Without data\n");
            for o in empty {
                let _ = writeln!(md, "- {} / {} / {} ({})", o.topic, o.unit, o.period, o.status);
            }
        }
        md
    }

    /// Writes `relatorio_execucao_{stamp}.csv` and `.md` into `dir`.
    /// Returns `None` when nothing was recorded.
    pub fn write_reports(&self, dir: &Path) -> anyhow::Result<Option<(PathBuf, PathBuf)>> {
        if self.outcomes.is_empty() {
            info!("no executions recorded; report skipped");
            return Ok(None);
        }
        let finished_at = Utc::now();
        let stamp = finished_at.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        let csv_path = dir.join(format!("relatorio_execucao_{stamp}.csv"));
        let md_path = dir.join(format!("relatorio_execucao_{stamp}.md"));

        write_table(&csv_path, &self.to_table(), TableFormat::Csv)
            .with_context(|| format!("writing {}", csv_path.display()))?;
        write_atomic(&md_path, self.render_markdown(finished_at).as_bytes())
            .with_context(|| format!("writing {}", md_path.display()))?;
        info!(csv = %csv_path.display(), summary = %md_path.display(), "execution report written");
        Ok(Some((csv_path, md_path)))
    }
}
