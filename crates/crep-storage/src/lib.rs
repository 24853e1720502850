//! Flat-file datasets, month snapshot layout and resilient HTTP for CREP.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use arrow_array::{
    Array, BooleanArray, Float64Array, Int64Array, LargeStringArray, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use crep_core::{Competency, CompetencyStatus, MonthKey, Period, Unit};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "crep-storage";

pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const PARQUET_MAGIC: &[u8] = b"PAR1";

pub const COMPETENCY_FILE: &str = "competencias_todas_unidades.csv";
pub const WORK_LIST_FILE: &str = "competencias_todas_unidades_filtrado.csv";

pub const COL_UNIT_ID: &str = "unidade_id";
pub const COL_TOKEN: &str = "token";
pub const COL_UNIT_NAME: &str = "nome";
pub const COL_PERIOD: &str = "competencia";
pub const COL_STATUS: &str = "situacao";

/// Columns every competency snapshot and work-list must carry.
pub const REQUIRED_COMPETENCY_COLUMNS: [&str; 5] =
    [COL_UNIT_ID, COL_TOKEN, COL_PERIOD, COL_UNIT_NAME, COL_STATUS];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("unsupported parquet column {column} of type {data_type}")]
    UnsupportedColumn { column: String, data_type: String },
    #[error("table has no columns")]
    NoColumns,
}

impl TableError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory tabular dataset. Every cell is kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Case-insensitive lookup returning the column's actual spelling.
    pub fn find_column_ci(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    pub fn missing_columns<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|name| self.column_index(name).is_none())
            .collect()
    }

    /// Appends a row, padding or truncating it to the column count.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| r[idx].as_str())
    }

    /// Builds a table from a JSON item collection. Columns are the union of
    /// object keys in first-seen order; non-object items become a `value` column.
    pub fn from_json_items(items: &[JsonValue]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for item in items {
            match item {
                JsonValue::Object(map) => {
                    for key in map.keys() {
                        if !columns.iter().any(|c| c == key) {
                            columns.push(key.clone());
                        }
                    }
                }
                _ => {
                    if !columns.iter().any(|c| c == "value") {
                        columns.push("value".to_string());
                    }
                }
            }
        }

        let mut table = Self::new(columns);
        for item in items {
            let row = table
                .columns
                .iter()
                .map(|col| match item {
                    JsonValue::Object(map) => map.get(col).map(json_cell).unwrap_or_default(),
                    other if col == "value" => json_cell(other),
                    _ => String::new(),
                })
                .collect();
            table.rows.push(row);
        }
        table
    }

    /// Sets `name` to `value` on every row, adding the column if absent.
    pub fn set_constant_column(&mut self, name: &str, value: &str) {
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = value.to_string();
                }
            }
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(value.to_string());
                }
            }
        }
    }

    pub fn drop_columns(&mut self, mut should_drop: impl FnMut(&str) -> bool) {
        let keep: Vec<bool> = self.columns.iter().map(|c| !should_drop(c)).collect();
        let mut flags = keep.iter();
        self.columns.retain(|_| *flags.next().unwrap_or(&true));
        for row in &mut self.rows {
            let mut flags = keep.iter();
            row.retain(|_| *flags.next().unwrap_or(&true));
        }
    }

    pub fn map_column(&mut self, name: &str, mut f: impl FnMut(&str) -> String) -> bool {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        true
    }

    /// Returns a table with the same columns holding only the selected rows.
    pub fn select_rows(&self, mut keep: impl FnMut(usize, &[String]) -> bool) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .enumerate()
                .filter(|(i, row)| keep(*i, row))
                .map(|(_, row)| row.clone())
                .collect(),
        }
    }

    /// Vertical concatenation over the union of columns (first-seen order).
    /// Cells of columns a source table lacks are left empty.
    pub fn concat(tables: &[&Table]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for table in tables {
            for col in &table.columns {
                if !columns.contains(col) {
                    columns.push(col.clone());
                }
            }
        }
        let mut out = Self::new(columns);
        for table in tables {
            let mapping: Vec<Option<usize>> = out
                .columns
                .iter()
                .map(|c| table.column_index(c))
                .collect();
            for row in &table.rows {
                out.rows.push(
                    mapping
                        .iter()
                        .map(|m| m.map(|i| row[i].clone()).unwrap_or_default())
                        .collect(),
                );
            }
        }
        out
    }
}

fn json_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// On-disk tabular encodings a dataset may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Parquet,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "parquet" => Some(Self::Parquet),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }

    pub const ALL: [TableFormat; 2] = [TableFormat::Csv, TableFormat::Parquet];
}

/// Reads a dataset, detecting Parquet by its magic bytes regardless of extension.
pub fn read_table(path: &Path) -> Result<Table, TableError> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| TableError::io(path, e))?;

    if bytes.starts_with(PARQUET_MAGIC) {
        if TableFormat::from_path(path) != Some(TableFormat::Parquet) {
            warn!(path = %path.display(), "file content is parquet despite its extension");
        }
        return read_parquet(path);
    }
    parse_csv(&bytes)
}

/// Detects the real encoding of a file from its content.
pub fn sniff_format(path: &Path) -> Result<TableFormat, TableError> {
    let mut head = [0u8; 4];
    let mut file = File::open(path).map_err(|e| TableError::io(path, e))?;
    let n = file.read(&mut head).map_err(|e| TableError::io(path, e))?;
    if head[..n].starts_with(PARQUET_MAGIC) && n == PARQUET_MAGIC.len() {
        Ok(TableFormat::Parquet)
    } else {
        Ok(TableFormat::Csv)
    }
}

pub fn write_table(path: &Path, table: &Table, format: TableFormat) -> Result<(), TableError> {
    let bytes = match format {
        TableFormat::Csv => encode_csv(table)?,
        TableFormat::Parquet => encode_parquet(table)?,
    };
    write_atomic(path, &bytes).map_err(|e| TableError::io(path, e))
}

/// Parses semicolon-delimited text, tolerating a BOM, Latin-1 bytes and a
/// comma-delimited file saved by hand.
pub fn parse_csv(bytes: &[u8]) -> Result<Table, TableError> {
    let text = decode_text(bytes);
    let table = parse_delimited(&text, b';')?;
    if table.columns.len() == 1 && table.columns[0].contains(',') {
        debug!("single-column header contains commas; retrying with ',' delimiter");
        return parse_delimited(&text, b',');
    }
    Ok(table)
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn parse_delimited(text: &str, delimiter: u8) -> Result<Table, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut table = Table::new(columns);
    for record in reader.records() {
        let record = record?;
        table.push_row(record.iter().map(str::to_string).collect());
    }
    Ok(table)
}

pub fn encode_csv(table: &Table) -> Result<Vec<u8>, TableError> {
    if table.columns.is_empty() {
        return Ok(UTF8_BOM.to_vec());
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(UTF8_BOM.to_vec());
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|e| TableError::Io {
        path: PathBuf::from("<memory>"),
        source: e.into_error(),
    })
}

fn encode_parquet(table: &Table) -> Result<Vec<u8>, TableError> {
    if table.columns.is_empty() {
        return Err(TableError::NoColumns);
    }
    let schema = Arc::new(Schema::new(
        table
            .columns
            .iter()
            .map(|c| ArrowField::new(c, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    let arrays = (0..table.columns.len())
        .map(|i| {
            Arc::new(StringArray::from(
                table.rows.iter().map(|r| r[i].as_str()).collect::<Vec<_>>(),
            )) as Arc<dyn Array>
        })
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(schema, arrays)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

fn read_parquet(path: &Path) -> Result<Table, TableError> {
    let file = File::open(path).map_err(|e| TableError::io(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build()?;

    let mut table = Table::new(columns);
    for batch in reader {
        let batch = batch?;
        let mut cols: Vec<Vec<String>> = Vec::with_capacity(batch.num_columns());
        for (idx, array) in batch.columns().iter().enumerate() {
            cols.push(array_to_strings(&table.columns[idx], array.as_ref())?);
        }
        for row in 0..batch.num_rows() {
            table
                .rows
                .push(cols.iter().map(|c| c[row].clone()).collect());
        }
    }
    Ok(table)
}

fn array_to_strings(column: &str, array: &dyn Array) -> Result<Vec<String>, TableError> {
    fn collect<A: Array>(array: &A, f: impl Fn(usize) -> String) -> Vec<String> {
        (0..array.len())
            .map(|i| if array.is_null(i) { String::new() } else { f(i) })
            .collect()
    }

    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<StringArray>() {
        return Ok(collect(a, |i| a.value(i).to_string()));
    }
    if let Some(a) = any.downcast_ref::<LargeStringArray>() {
        return Ok(collect(a, |i| a.value(i).to_string()));
    }
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Ok(collect(a, |i| a.value(i).to_string()));
    }
    if let Some(a) = any.downcast_ref::<Float64Array>() {
        return Ok(collect(a, |i| a.value(i).to_string()));
    }
    if let Some(a) = any.downcast_ref::<BooleanArray>() {
        return Ok(collect(a, |i| a.value(i).to_string()));
    }
    Err(TableError::UnsupportedColumn {
        column: column.to_string(),
        data_type: array.data_type().to_string(),
    })
}

/// Writes bytes through a temp file in the target directory and renames it
/// into place, so readers never observe a half-written dataset.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash and size of a file on disk.
pub fn file_digest(path: &Path) -> anyhow::Result<(String, u64)> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok((sha256_hex(&bytes), bytes.len() as u64))
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot file {0} does not exist")]
    Missing(PathBuf),
    #[error("reading snapshot: {0}")]
    Table(#[from] TableError),
    #[error("snapshot {path} lacks columns {missing:?}")]
    MissingColumns { path: PathBuf, missing: Vec<String> },
    #[error("snapshot {path} row {row}: {reason}")]
    Malformed {
        path: PathBuf,
        row: usize,
        reason: String,
    },
}

/// Competency-status table of one month, validated row by row.
///
/// `entries[i]` is the typed view of `table.rows()[i]`.
#[derive(Debug, Clone)]
pub struct CompetencySnapshot {
    pub month: MonthKey,
    pub path: PathBuf,
    pub table: Table,
    pub entries: Vec<Competency>,
}

impl CompetencySnapshot {
    /// Strict validation: any unparseable period or status makes the whole
    /// snapshot malformed.
    pub fn from_table(month: MonthKey, path: PathBuf, table: Table) -> Result<Self, SnapshotError> {
        Self::build(month, path, table, false)
    }

    /// Validation for the month being processed. Unknown status labels become
    /// [`CompetencyStatus::Unrecognized`] and rows with an unparseable period
    /// are dropped, each with a warning. Missing columns still fail.
    pub fn from_current_table(
        month: MonthKey,
        path: PathBuf,
        table: Table,
    ) -> Result<Self, SnapshotError> {
        Self::build(month, path, table, true)
    }

    fn build(
        month: MonthKey,
        path: PathBuf,
        table: Table,
        tolerant: bool,
    ) -> Result<Self, SnapshotError> {
        let missing = table.missing_columns(&REQUIRED_COMPETENCY_COLUMNS);
        if !missing.is_empty() {
            return Err(SnapshotError::MissingColumns {
                path,
                missing: missing.into_iter().map(str::to_string).collect(),
            });
        }

        let mut entries = Vec::with_capacity(table.len());
        let mut kept = vec![true; table.len()];
        for row in 0..table.len() {
            let cell = |col: &str| table.cell(row, col).unwrap_or_default();
            let malformed = |reason: String| SnapshotError::Malformed {
                path: path.clone(),
                row: row + 1,
                reason,
            };
            let period: Period = match cell(COL_PERIOD).parse() {
                Ok(period) => period,
                Err(err) if tolerant => {
                    warn!(month = %month, row = row + 1, error = %err, "dropping competency row with unreadable period");
                    kept[row] = false;
                    continue;
                }
                Err(err) => return Err(malformed(err.to_string())),
            };
            let status = match cell(COL_STATUS).parse::<CompetencyStatus>() {
                Ok(status) => status,
                Err(err) if tolerant => {
                    warn!(month = %month, row = row + 1, error = %err, "unrecognized competency status; treated as eligible");
                    CompetencyStatus::Unrecognized
                }
                Err(err) => return Err(malformed(err.to_string())),
            };
            entries.push(Competency {
                unit: Unit {
                    id: cell(COL_UNIT_ID).to_string(),
                    name: cell(COL_UNIT_NAME).to_string(),
                    token: cell(COL_TOKEN).to_string(),
                },
                period,
                status,
            });
        }

        let table = if kept.iter().all(|k| *k) {
            table
        } else {
            table.select_rows(|i, _| kept[i])
        };
        Ok(Self {
            month,
            path,
            table,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys_with_status(&self, status: CompetencyStatus) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|c| c.status == status)
            .map(Competency::key)
            .collect()
    }

    pub fn closed_keys(&self) -> HashSet<String> {
        self.keys_with_status(CompetencyStatus::Closed)
    }

    pub fn reopened_keys(&self) -> HashSet<String> {
        self.keys_with_status(CompetencyStatus::Reopened)
    }

    /// Rows of the underlying table whose entry satisfies `keep`, original shape preserved.
    pub fn select(&self, mut keep: impl FnMut(&Competency) -> bool) -> Table {
        self.table.select_rows(|i, _| keep(&self.entries[i]))
    }
}

/// Month-keyed directory tree: `{root}/{YYYY}/{MM_YYYY}/`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn month_dir(&self, month: MonthKey) -> PathBuf {
        self.root
            .join(format!("{:04}", month.year))
            .join(month.dir_name())
    }

    pub fn month_exists(&self, month: MonthKey) -> bool {
        self.month_dir(month).is_dir()
    }

    pub fn ensure_month_dir(&self, month: MonthKey) -> anyhow::Result<PathBuf> {
        let dir = self.month_dir(month);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    pub fn competency_path(&self, month: MonthKey) -> PathBuf {
        self.month_dir(month).join(COMPETENCY_FILE)
    }

    pub fn work_list_path(&self, month: MonthKey) -> PathBuf {
        self.month_dir(month).join(WORK_LIST_FILE)
    }

    /// Loads and validates a month's competency table.
    pub fn load_competencies(&self, month: MonthKey) -> Result<CompetencySnapshot, SnapshotError> {
        let path = self.competency_path(month);
        if !path.is_file() {
            return Err(SnapshotError::Missing(path));
        }
        let table = read_table(&path)?;
        CompetencySnapshot::from_table(month, path, table)
    }

    /// Loads the snapshot of the month being processed, tolerating bad rows.
    pub fn load_current_competencies(
        &self,
        month: MonthKey,
    ) -> Result<CompetencySnapshot, SnapshotError> {
        let path = self.competency_path(month);
        if !path.is_file() {
            return Err(SnapshotError::Missing(path));
        }
        let table = read_table(&path)?;
        CompetencySnapshot::from_current_table(month, path, table)
    }

    /// Like [`Self::load_competencies`] but degrades every failure to `None`.
    pub fn read_competencies(&self, month: MonthKey) -> Option<CompetencySnapshot> {
        match self.load_competencies(month) {
            Ok(snapshot) => {
                debug!(month = %month, rows = snapshot.len(), "competency snapshot loaded");
                Some(snapshot)
            }
            Err(SnapshotError::Missing(path)) => {
                debug!(month = %month, path = %path.display(), "competency snapshot absent");
                None
            }
            Err(err) => {
                warn!(month = %month, error = %err, "competency snapshot unusable; treating as absent");
                None
            }
        }
    }

    pub fn write_competencies(&self, month: MonthKey, table: &Table) -> anyhow::Result<PathBuf> {
        let path = self.competency_path(month);
        write_table(&path, table, TableFormat::Csv)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn write_work_list(&self, month: MonthKey, table: &Table) -> anyhow::Result<PathBuf> {
        let path = self.work_list_path(month);
        write_table(&path, table, TableFormat::Csv)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub bearer_token: String,
    pub body: Option<JsonValue>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Sends one HTTP request. Implementations do not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Time source for waits, injectable so retry and pacing are testable.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

pub trait JitterSource: Send + Sync {
    /// Uniform value in `[0, max]`.
    fn jitter(&self, max: Duration) -> Duration;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Wait `initial_backoff * 2^(attempt-1) + jitter`, then retry.
    Backoff,
    /// Wait the fixed timeout pause, then retry.
    FixedWait,
    Terminal,
}

/// Only the "forbidden" rejection is retried; every other status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::FORBIDDEN {
        RetryDisposition::Backoff
    } else {
        RetryDisposition::Terminal
    }
}

pub fn classify_transport_error(err: &TransportError) -> RetryDisposition {
    match err {
        TransportError::Timeout => RetryDisposition::FixedWait,
        TransportError::Transport(_) => RetryDisposition::Terminal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_jitter: Duration,
    pub timeout_wait: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(3),
            max_jitter: Duration::from_millis(500),
            timeout_wait: Duration::from_secs(3),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the wait after failed attempt `attempt` (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exp)
    }
}

/// Result of driving one request through the retry state machine.
#[derive(Debug)]
pub struct RequestOutcome {
    pub result: Result<ApiResponse, TransportError>,
    pub elapsed: Duration,
    pub attempts: u32,
    pub waits: Vec<Duration>,
}

impl RequestOutcome {
    pub fn status(&self) -> Option<StatusCode> {
        self.result.as_ref().ok().map(|r| r.status)
    }
}

/// Issues a request with bounded retry on the forbidden status and on timeouts.
///
/// After the last rejected attempt the final response is handed back as-is,
/// so the caller decides what a persistent 403 means.
#[derive(Clone)]
pub struct BackoffRequester {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
}

impl BackoffRequester {
    pub fn new(transport: Arc<dyn Transport>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            transport,
            sleeper,
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    pub async fn execute(&self, request: &ApiRequest, policy: &BackoffPolicy) -> RequestOutcome {
        let span = info_span!("api_request", url = %request.url);
        self.run(request, policy).instrument(span).await
    }

    async fn run(&self, request: &ApiRequest, policy: &BackoffPolicy) -> RequestOutcome {
        let started = Instant::now();
        let max_attempts = policy.max_attempts.max(1);
        let mut waits = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.transport.send(request).await;

            let disposition = match &result {
                Ok(resp) => classify_status(resp.status),
                Err(err) => classify_transport_error(err),
            };
            let exhausted = attempt >= max_attempts;

            let wait = match disposition {
                RetryDisposition::Backoff if !exhausted => {
                    policy.backoff_for_attempt(attempt) + self.jitter.jitter(policy.max_jitter)
                }
                RetryDisposition::FixedWait if !exhausted => policy.timeout_wait,
                _ => {
                    if exhausted && disposition != RetryDisposition::Terminal {
                        warn!(attempt, max_attempts, "retry budget exhausted");
                    }
                    return RequestOutcome {
                        result,
                        elapsed: started.elapsed(),
                        attempts: attempt,
                        waits,
                    };
                }
            };

            // Waits never shrink, even when jitter outweighed the previous doubling.
            let wait = waits.last().map_or(wait, |last: &Duration| wait.max(*last));
            warn!(
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                reason = ?disposition,
                "transient rejection; retrying"
            );
            waits.push(wait);
            self.sleeper.sleep(wait).await;
        }
    }
}

/// Production transport on top of reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        let mut builder = builder
            .bearer_auth(&request.bearer_token)
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Transport(err.to_string())
            }
        };
        let resp = builder.send().await.map_err(map_err)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(map_err)?.to_vec();
        Ok(ApiResponse { status, body })
    }
}
