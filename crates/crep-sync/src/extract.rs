//! Drives the backoff requester over a work-list for one topic.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crep_adapters::{Pacing, TopicConfig, TopicScope};
use crep_core::{normalize_period, CompetencyStatus, ExecutionOutcome, MonthKey, OutcomeStatus, Period, Unit};
use crep_storage::{
    read_table, write_table, ApiRequest, BackoffRequester, RequestOutcome, SnapshotStore, StatusCode,
    Table, TableFormat, TransportError, COL_PERIOD, COL_STATUS, COL_TOKEN, COL_UNIT_ID, COL_UNIT_NAME,
    REQUIRED_COMPETENCY_COLUMNS,
};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Column added to every extracted row with the unit's name.
pub const TAG_UNIT: &str = "unidade";
/// Column added to every extracted row with the requested period.
pub const TAG_PERIOD: &str = "competencia";

const PERIOD_COLUMNS: [&str; 2] = ["competencia", "competenciaDescr"];
const BOOKKEEPING_COLUMNS: [&str; 2] = ["chave", "token"];

/// Receives one outcome per processed work item.
pub trait OutcomeSink {
    fn record(&mut self, outcome: ExecutionOutcome);
}

impl OutcomeSink for Vec<ExecutionOutcome> {
    fn record(&mut self, outcome: ExecutionOutcome) {
        self.push(outcome);
    }
}

/// One (unit, period) row of the work-list. `period` is `None` for
/// per-unit topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub unit: Unit,
    pub period: Option<String>,
}

impl WorkItem {
    fn period_label(&self) -> &str {
        self.period.as_deref().unwrap_or("")
    }
}

/// Reads a work-list file and keeps the rows eligible for extraction.
///
/// Returns `None` when the file is unreadable or lacks a required column.
pub fn load_work_items(path: &Path) -> Option<Vec<WorkItem>> {
    let table = match read_table(path) {
        Ok(table) => table,
        Err(err) => {
            error!(path = %path.display(), error = %err, "work-list unreadable");
            return None;
        }
    };
    let missing = table.missing_columns(&REQUIRED_COMPETENCY_COLUMNS);
    if !missing.is_empty() {
        error!(path = %path.display(), ?missing, "work-list lacks required columns");
        return None;
    }

    let mut items = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let cell = |col: &str| table.cell(row, col).unwrap_or_default().to_string();
        let status = CompetencyStatus::parse_lenient(&cell(COL_STATUS));
        if !status.is_eligible() {
            continue;
        }
        if status == CompetencyStatus::Unrecognized {
            warn!(row = row + 1, status = %cell(COL_STATUS), "unrecognized status in work-list; extracting anyway");
        }
        items.push(WorkItem {
            unit: Unit {
                id: cell(COL_UNIT_ID),
                name: cell(COL_UNIT_NAME),
                token: cell(COL_TOKEN),
            },
            period: Some(cell(COL_PERIOD)),
        });
    }
    Some(items)
}

fn unit_sort_key(id: &str) -> (Option<u64>, String) {
    (id.trim().parse().ok(), id.to_string())
}

fn period_sort_key(period: Option<&str>) -> (Option<Period>, String) {
    let raw = period.unwrap_or_default();
    (Period::parse_lenient(raw), raw.to_string())
}

/// Orders and reshapes the closed work items for one topic.
pub fn plan_items(items: Vec<WorkItem>, topic: &TopicConfig, group_by_unit: bool) -> Vec<WorkItem> {
    let before = items.len();
    let mut items: Vec<WorkItem> = items
        .into_iter()
        .filter(|item| topic.applies_to_unit(&item.unit.name))
        .collect();
    if items.len() < before {
        info!(
            topic = %topic.id,
            skipped = before - items.len(),
            kept = items.len(),
            "work items filtered by unit type"
        );
    }

    if topic.scope == TopicScope::PerUnit {
        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.unit.id.clone()));
        for item in &mut items {
            item.period = None;
        }
    }

    if group_by_unit {
        items.sort_by(|a, b| {
            unit_sort_key(&a.unit.id)
                .cmp(&unit_sort_key(&b.unit.id))
                .then_with(|| {
                    period_sort_key(a.period.as_deref()).cmp(&period_sort_key(b.period.as_deref()))
                })
        });
    }
    items
}

/// Classification of one finished request.
#[derive(Debug)]
enum ItemResult {
    Rows(Table),
    Outcome(OutcomeStatus, Option<String>),
}

fn classify(outcome: &RequestOutcome) -> ItemResult {
    let response = match &outcome.result {
        Ok(response) => response,
        Err(TransportError::Timeout) => {
            return ItemResult::Outcome(
                OutcomeStatus::Timeout,
                Some(format!("timed out after {} attempts", outcome.attempts)),
            )
        }
        Err(err) => return ItemResult::Outcome(OutcomeStatus::Error, Some(err.to_string())),
    };

    let status = response.status;
    if status.is_success() {
        let body: JsonValue = match response.json() {
            Ok(body) => body,
            Err(err) => {
                return ItemResult::Outcome(
                    OutcomeStatus::Error,
                    Some(format!("invalid JSON body: {err}")),
                )
            }
        };
        return match body.get("items").and_then(JsonValue::as_array) {
            Some(items) if !items.is_empty() => ItemResult::Rows(Table::from_json_items(items)),
            _ => ItemResult::Outcome(OutcomeStatus::NoData, None),
        };
    }

    let (status_class, message) = match status {
        StatusCode::UNAUTHORIZED => (OutcomeStatus::Error, "invalid credential (HTTP 401)".to_string()),
        StatusCode::FORBIDDEN => (
            OutcomeStatus::Error,
            format!("persistent rejection (HTTP 403) after {} attempts", outcome.attempts),
        ),
        StatusCode::NOT_FOUND => (OutcomeStatus::Error, "endpoint not found (HTTP 404)".to_string()),
        StatusCode::INTERNAL_SERVER_ERROR => (
            OutcomeStatus::Unavailable,
            "not available for this unit or period (HTTP 500)".to_string(),
        ),
        other => (OutcomeStatus::Error, format!("HTTP {}", other.as_u16())),
    };
    ItemResult::Outcome(status_class, Some(message))
}

/// Rewrites recognisable period cells as `MM/YYYY`; returns how many cells
/// could not be recognised.
pub fn normalize_period_columns(table: &mut Table) -> usize {
    let mut unrecognised = 0usize;
    for column in PERIOD_COLUMNS {
        let Some(actual) = table.find_column_ci(column).map(str::to_string) else {
            continue;
        };
        table.map_column(&actual, |raw| match normalize_period(raw) {
            Some(canonical) => canonical,
            None => {
                if !raw.trim().is_empty() {
                    unrecognised += 1;
                }
                raw.to_string()
            }
        });
    }
    unrecognised
}

pub fn drop_bookkeeping_columns(table: &mut Table) {
    table.drop_columns(|name| {
        name.starts_with('_')
            || BOOKKEEPING_COLUMNS
                .iter()
                .any(|b| name.eq_ignore_ascii_case(b))
    });
}

/// Extracts one topic for the target month into `api_{topic}_{MM_YYYY}.csv`.
pub struct TopicExtractor {
    requester: BackoffRequester,
    store: SnapshotStore,
    month: MonthKey,
    pacing: Pacing,
}

impl TopicExtractor {
    pub fn new(requester: BackoffRequester, store: SnapshotStore, month: MonthKey, pacing: Pacing) -> Self {
        Self {
            requester,
            store,
            month,
            pacing,
        }
    }

    /// Runs the topic over `work_list`. `None` means nothing was written,
    /// either because the input was unusable or because no rows came back.
    pub async fn extract(
        &self,
        work_list: &Path,
        topic: &TopicConfig,
        base_url: &str,
        sink: &mut dyn OutcomeSink,
    ) -> Option<PathBuf> {
        let span = info_span!("topic_extract", topic = %topic.id, month = %self.month);
        async {
            let items = load_work_items(work_list)?;
            self.extract_items(items, topic, base_url, sink).await
        }
        .instrument(span)
        .await
    }

    pub async fn extract_items(
        &self,
        items: Vec<WorkItem>,
        topic: &TopicConfig,
        base_url: &str,
        sink: &mut dyn OutcomeSink,
    ) -> Option<PathBuf> {
        let pacing = topic.pacing(&self.pacing);
        let items = plan_items(items, topic, pacing.group_by_unit);
        if items.is_empty() {
            warn!(topic = %topic.id, "no applicable closed work items");
            return None;
        }
        info!(topic = %topic.id, items = items.len(), "extraction started");

        let mut accumulated: Vec<Table> = Vec::new();
        let mut previous_unit: Option<&str> = None;

        for (idx, item) in items.iter().enumerate() {
            if idx > 0 {
                self.pause(pacing.delay_between_calls).await;
                if pacing.group_by_unit && previous_unit != Some(item.unit.id.as_str()) {
                    debug!(topic = %topic.id, unit = %item.unit.name, "unit changed; pausing");
                    self.pause(pacing.delay_between_units).await;
                }
            }
            previous_unit = Some(item.unit.id.as_str());

            let request = ApiRequest {
                method: topic.method,
                url: topic.endpoint(base_url, &item.unit.id),
                bearer_token: item.unit.token.clone(),
                body: item.period.as_deref().and_then(|p| topic.build_payload(p)),
                timeout: topic.timeout(),
            };
            let outcome = self.requester.execute(&request, &pacing.backoff).await;
            let record = ExecutionOutcome::new(
                &topic.id,
                &item.unit.name,
                item.period_label(),
                OutcomeStatus::Success,
            )
            .with_duration(outcome.elapsed);

            let record = match classify(&outcome) {
                ItemResult::Rows(mut rows) => {
                    rows.set_constant_column(TAG_UNIT, &item.unit.name);
                    if let Some(period) = &item.period {
                        rows.set_constant_column(TAG_PERIOD, period);
                    }
                    let count = rows.len();
                    debug!(topic = %topic.id, unit = %item.unit.name, period = item.period_label(), records = count, "rows collected");
                    accumulated.push(rows);
                    record.with_records(count)
                }
                ItemResult::Outcome(status, message) => {
                    match status {
                        OutcomeStatus::Unavailable | OutcomeStatus::NoData => {
                            debug!(topic = %topic.id, unit = %item.unit.name, period = item.period_label(), status = %status, "no rows")
                        }
                        _ => warn!(
                            topic = %topic.id,
                            unit = %item.unit.name,
                            period = item.period_label(),
                            status = %status,
                            attempts = outcome.attempts,
                            error = message.as_deref().unwrap_or_default(),
                            "work item failed"
                        ),
                    }
                    let record = ExecutionOutcome { status, ..record };
                    match message {
                        Some(message) => record.with_error(message),
                        None => record,
                    }
                }
            };
            sink.record(record);
        }

        if accumulated.is_empty() {
            warn!(topic = %topic.id, "topic yielded no rows; nothing written");
            return None;
        }

        let parts: Vec<&Table> = accumulated.iter().collect();
        let mut dataset = Table::concat(&parts);
        let unrecognised = normalize_period_columns(&mut dataset);
        if unrecognised > 0 {
            warn!(topic = %topic.id, cells = unrecognised, "period values left as received");
        }
        drop_bookkeeping_columns(&mut dataset);

        let dir = match self.store.ensure_month_dir(self.month) {
            Ok(dir) => dir,
            Err(err) => {
                error!(topic = %topic.id, error = %err, "cannot create month directory");
                return None;
            }
        };
        let path = dir.join(topic.dataset_file_name(self.month, TableFormat::Csv));
        if let Err(err) = write_table(&path, &dataset, TableFormat::Csv) {
            error!(topic = %topic.id, path = %path.display(), error = %err, "writing topic dataset failed");
            return None;
        }
        info!(topic = %topic.id, rows = dataset.len(), path = %path.display(), "topic dataset written");
        Some(path)
    }

    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.requester.sleeper().sleep(duration).await;
        }
    }
}
