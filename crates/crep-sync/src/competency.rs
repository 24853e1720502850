//! Builds the current month's competency snapshot from the upstream API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crep_core::{MonthKey, Unit};
use crep_storage::{
    read_table, ApiRequest, BackoffPolicy, BackoffRequester, HttpMethod, SnapshotStore, Table,
    COL_PERIOD, COL_TOKEN, COL_UNIT_ID, COL_UNIT_NAME,
};
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, warn, Instrument};

/// Settings for one snapshot fetch.
#[derive(Debug, Clone)]
pub struct CompetencyFetch {
    pub base_url: String,
    pub timeout: Duration,
    pub min_year: i32,
    pub delay_between_calls: Duration,
    pub backoff: BackoffPolicy,
}

/// Reads the unit roster (`id;nome;token`, header names case-insensitive).
pub fn load_roster(path: &Path) -> anyhow::Result<Vec<Unit>> {
    let table = read_table(path)?;
    let column = |name: &str| -> anyhow::Result<String> {
        table
            .find_column_ci(name)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("roster {} lacks column {name:?}", path.display()))
    };
    let (id_col, name_col, token_col) = (column("id")?, column("nome")?, column("token")?);

    Ok((0..table.len())
        .map(|row| {
            let cell = |col: &str| table.cell(row, col).unwrap_or_default().trim().to_string();
            let id = cell(&id_col);
            let name = cell(&name_col);
            Unit {
                name: if name.is_empty() { format!("ID {id}") } else { name },
                id,
                token: cell(&token_col),
            }
        })
        .filter(|unit| !unit.id.is_empty())
        .collect())
}

/// Turns one unit's `items` into snapshot rows. Rows below `min_year` or
/// without a usable `mes`/`ano` are dropped.
pub fn competency_rows(unit: &Unit, items: &[JsonValue], min_year: i32) -> Table {
    let mut table = Table::from_json_items(items);
    let number = |row: &[String], idx: Option<usize>| -> Option<i64> {
        idx.and_then(|i| row[i].trim().parse::<f64>().ok()).map(|v| v as i64)
    };
    let (mes, ano) = (table.column_index("mes"), table.column_index("ano"));
    table = table.select_rows(|_, row| {
        matches!(
            (number(row, mes), number(row, ano)),
            (Some(m), Some(y)) if (1..=12).contains(&m) && y >= i64::from(min_year)
        )
    });

    let periods: Vec<String> = table
        .rows()
        .iter()
        .map(|row| {
            format!(
                "{:02}/{}",
                number(row, mes).unwrap_or_default(),
                number(row, ano).unwrap_or_default()
            )
        })
        .collect();
    table.set_constant_column(COL_PERIOD, "");
    let mut periods = periods.into_iter();
    table.map_column(COL_PERIOD, |_| periods.next().unwrap_or_default());

    table.set_constant_column(COL_UNIT_ID, &unit.id);
    table.set_constant_column(COL_UNIT_NAME, &unit.name);
    table.set_constant_column(COL_TOKEN, &unit.token);
    table
}

/// Queries every unit of the roster and writes the month's snapshot.
/// Returns `None` when no unit produced rows.
pub async fn fetch_competencies(
    requester: &BackoffRequester,
    store: &SnapshotStore,
    month: MonthKey,
    roster: &[Unit],
    fetch: &CompetencyFetch,
) -> anyhow::Result<Option<PathBuf>> {
    let span = info_span!("competency_fetch", month = %month, units = roster.len());
    async {
        let mut collected: Vec<Table> = Vec::new();
        for (idx, unit) in roster.iter().enumerate() {
            if idx > 0 && !fetch.delay_between_calls.is_zero() {
                requester.sleeper().sleep(fetch.delay_between_calls).await;
            }
            let request = ApiRequest {
                method: HttpMethod::Get,
                url: format!("{}{}", fetch.base_url, unit.id),
                bearer_token: unit.token.clone(),
                body: None,
                timeout: fetch.timeout,
            };
            let outcome = requester.execute(&request, &fetch.backoff).await;
            let response = match outcome.result {
                Ok(response) if response.status.is_success() => response,
                Ok(response) => {
                    warn!(unit = %unit.name, status = response.status.as_u16(), "competency request rejected");
                    continue;
                }
                Err(err) => {
                    warn!(unit = %unit.name, error = %err, "competency request failed");
                    continue;
                }
            };
            let items = match response.json::<JsonValue>() {
                Ok(body) => body
                    .get("items")
                    .and_then(JsonValue::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Err(err) => {
                    warn!(unit = %unit.name, error = %err, "competency response is not JSON");
                    continue;
                }
            };
            if items.is_empty() {
                warn!(unit = %unit.name, "unit returned no competencies");
                continue;
            }
            let rows = competency_rows(unit, &items, fetch.min_year);
            info!(unit = %unit.name, received = items.len(), kept = rows.len(), "competencies collected");
            collected.push(rows);
        }

        let parts: Vec<&Table> = collected.iter().collect();
        let snapshot = Table::concat(&parts);
        if snapshot.is_empty() {
            error!("no competencies collected from any unit");
            return Ok(None);
        }
        store.ensure_month_dir(month)?;
        let path = store.write_competencies(month, &snapshot)?;
        info!(rows = snapshot.len(), path = %path.display(), "competency snapshot written");
        Ok::<_, anyhow::Error>(Some(path))
    }
    .instrument(span)
    .await
}
