//! Folds a topic's fresh rows into its running dataset, newest first.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use crep_adapters::{KeyResolution, TopicConfig};
use crep_core::MonthKey;
use crep_storage::{read_table, sniff_format, write_table, SnapshotStore, Table, TableFormat};
use tracing::{error, info, warn};

/// Topic dataset found in a month directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFile {
    pub path: PathBuf,
    pub stamp: MonthKey,
    pub format: TableFormat,
}

impl DatasetFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Every dataset of `topic` in `dir`, newest stamp first.
pub fn find_datasets(dir: &Path, topic: &TopicConfig) -> Vec<DatasetFile> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<DatasetFile> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (stamp, format) = topic.match_dataset_file(&name)?;
            Some(DatasetFile {
                path: entry.path(),
                stamp,
                format,
            })
        })
        .collect();
    found.sort_by(|a, b| b.stamp.cmp(&a.stamp).then_with(|| a.path.cmp(&b.path)));
    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing was extracted for the topic this month and no history exists.
    NoCurrentDataset,
    /// First month with data for the topic; the fresh file stands as-is.
    NoPreviousDataset,
    /// Nothing was extracted this month; last month's file was carried over.
    CarriedForward(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged {
        path: PathBuf,
        new_rows: usize,
        old_rows: usize,
        merged_rows: usize,
        key: KeyResolution,
    },
    Skipped(SkipReason),
    Failed(String),
}

impl MergeOutcome {
    /// The topic file that ends up in the current month, if any.
    pub fn final_path(&self) -> Option<&Path> {
        match self {
            Self::Merged { path, .. } => Some(path.as_path()),
            Self::Skipped(SkipReason::CarriedForward(path)) => Some(path.as_path()),
            _ => None,
        }
    }
}

/// Keeps the first row per key, in input order. With no resolvable key all
/// rows are kept.
pub fn dedup_keep_first(table: &Table, key: &KeyResolution) -> Table {
    let Some(columns) = key.columns() else {
        return table.clone();
    };
    let indices: Vec<usize> = columns
        .iter()
        .filter_map(|c| table.column_index(c))
        .collect();
    let mut seen = HashSet::new();
    table.select_rows(|_, row| {
        let composite: Vec<&str> = indices.iter().map(|&i| row[i].as_str()).collect();
        seen.insert(composite.join("\u{1f}"))
    })
}

/// New rows first, then old, deduplicated by the topic key.
pub fn merge_tables(topic: &TopicConfig, new_rows: &Table, old_rows: &Table) -> (Table, KeyResolution) {
    let combined = Table::concat(&[new_rows, old_rows]);
    let key = topic.resolve_key_columns(combined.columns());
    (dedup_keep_first(&combined, &key), key)
}

pub struct ConsolidationMerger {
    store: SnapshotStore,
}

impl ConsolidationMerger {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    fn current_dataset(&self, topic: &TopicConfig, month: MonthKey) -> Option<DatasetFile> {
        find_datasets(&self.store.month_dir(month), topic)
            .into_iter()
            .find(|f| f.stamp == month)
    }

    fn previous_dataset(&self, topic: &TopicConfig, month: MonthKey) -> Option<DatasetFile> {
        find_datasets(&self.store.month_dir(month.previous()), topic)
            .into_iter()
            .next()
    }

    pub fn merge(&self, topic: &TopicConfig, month: MonthKey) -> MergeOutcome {
        let previous = self.previous_dataset(topic, month);
        let Some(current) = self.current_dataset(topic, month) else {
            return match previous {
                Some(previous) => match self.copy_into(&previous, month) {
                    Ok(path) => {
                        info!(topic = %topic.id, path = %path.display(), "no fresh rows; previous dataset carried forward");
                        MergeOutcome::Skipped(SkipReason::CarriedForward(path))
                    }
                    Err(err) => {
                        error!(topic = %topic.id, error = %err, "carrying dataset forward failed");
                        MergeOutcome::Failed(err.to_string())
                    }
                },
                None => MergeOutcome::Skipped(SkipReason::NoCurrentDataset),
            };
        };
        let Some(previous) = previous else {
            info!(topic = %topic.id, "no previous dataset; current file stands");
            return MergeOutcome::Skipped(SkipReason::NoPreviousDataset);
        };

        match self.merge_files(topic, &current, &previous) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(topic = %topic.id, error = %err, "merge failed");
                MergeOutcome::Failed(format!("{err:#}"))
            }
        }
    }

    fn merge_files(
        &self,
        topic: &TopicConfig,
        current: &DatasetFile,
        previous: &DatasetFile,
    ) -> anyhow::Result<MergeOutcome> {
        let new_rows = read_table(&current.path)
            .with_context(|| format!("reading {}", current.path.display()))?;
        let old_rows = read_table(&previous.path)
            .with_context(|| format!("reading {}", previous.path.display()))?;
        let (merged, key) = merge_tables(topic, &new_rows, &old_rows);

        match &key {
            KeyResolution::Unresolved => warn!(
                topic = %topic.id,
                declared = ?topic.key_columns,
                "no key columns resolved; rows kept without deduplication"
            ),
            KeyResolution::Declared(cols) if cols.len() < topic.key_columns.len() => warn!(
                topic = %topic.id,
                key = ?cols,
                missing = ?topic.missing_key_columns(merged.columns()),
                "declared key only partially present; deduplicating on the columns found"
            ),
            KeyResolution::Fallback(cols) if !topic.key_columns.is_empty() => warn!(
                topic = %topic.id,
                key = ?cols,
                missing = ?topic.missing_key_columns(merged.columns()),
                "declared key incomplete; deduplicating on unidade and competencia"
            ),
            _ => {}
        }

        let format = sniff_format(&current.path).unwrap_or(current.format);
        write_table(&current.path, &merged, format)
            .with_context(|| format!("writing {}", current.path.display()))?;

        info!(
            topic = %topic.id,
            new_rows = new_rows.len(),
            old_rows = old_rows.len(),
            merged_rows = merged.len(),
            key = ?key,
            "topic dataset consolidated"
        );
        Ok(MergeOutcome::Merged {
            path: current.path.clone(),
            new_rows: new_rows.len(),
            old_rows: old_rows.len(),
            merged_rows: merged.len(),
            key,
        })
    }

    fn copy_into(&self, file: &DatasetFile, month: MonthKey) -> anyhow::Result<PathBuf> {
        let dir = self.store.ensure_month_dir(month)?;
        let target = dir.join(file.file_name());
        fs::copy(&file.path, &target)
            .with_context(|| format!("copying {} to {}", file.path.display(), target.display()))?;
        Ok(target)
    }

    /// Copy mode: every topic's previous-month file is copied byte for byte,
    /// under its original name. Returns the copied paths.
    pub fn copy_previous<'a>(
        &self,
        topics: impl IntoIterator<Item = &'a TopicConfig>,
        month: MonthKey,
    ) -> Vec<PathBuf> {
        let mut copied = Vec::new();
        for topic in topics {
            let Some(previous) = self.previous_dataset(topic, month) else {
                warn!(topic = %topic.id, "no previous dataset to copy");
                continue;
            };
            match self.copy_into(&previous, month) {
                Ok(path) => {
                    info!(topic = %topic.id, path = %path.display(), "dataset copied forward");
                    copied.push(path);
                }
                Err(err) => error!(topic = %topic.id, error = %err, "copy failed"),
            }
        }
        copied
    }
}
