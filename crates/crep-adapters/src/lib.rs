//! Topic catalog: per-topic endpoint, payload template, pacing and business key.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crep_core::MonthKey;
use crep_storage::{BackoffPolicy, HttpMethod, TableFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "crep-adapters";

pub const CATALOG_FILE: &str = "topics.yaml";

/// Generic key used when a topic's declared key does not fully resolve.
pub const FALLBACK_KEY_COLUMNS: [&str; 2] = ["unidade", "competencia"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading topic catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing topic catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("topic #{0} has an empty id")]
    EmptyId(usize),
    #[error("duplicate topic id {0:?}")]
    DuplicateId(String),
    #[error("topic {0:?}: payload template must be a JSON object")]
    PayloadNotObject(String),
    #[error("topic {0:?}: url_env is empty")]
    EmptyUrlEnv(String),
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicScope {
    /// One request per (unit, period) row of the work-list.
    PerPeriod,
    /// One request per distinct unit, no period in the request.
    PerUnit,
}

fn default_true() -> bool {
    true
}

fn default_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_scope() -> TopicScope {
    TopicScope::PerPeriod
}

fn default_payload() -> JsonValue {
    JsonValue::Object(Map::new())
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url_env: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    #[serde(default = "default_scope")]
    pub scope: TopicScope,
    #[serde(default = "default_payload")]
    pub payload: JsonValue,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub delay_between_calls_ms: Option<u64>,
    #[serde(default)]
    pub delay_between_units_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub group_by_unit: Option<bool>,
    #[serde(default)]
    pub applicable_unit_keywords: Vec<String>,
    #[serde(default)]
    pub key_columns: Vec<String>,
}

/// Request pacing and retry settings in effect for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub delay_between_calls: Duration,
    pub delay_between_units: Duration,
    pub group_by_unit: bool,
    pub backoff: BackoffPolicy,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            delay_between_calls: Duration::from_millis(300),
            delay_between_units: Duration::from_secs(3),
            group_by_unit: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How a topic's deduplication key was resolved against a dataset header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    /// Declared key columns found in the dataset, in declared order with the
    /// dataset's spelling. May be partial; see [`TopicConfig::resolve_key_columns`].
    Declared(Vec<String>),
    /// The generic `{unidade, competencia}` pair.
    Fallback(Vec<String>),
    Unresolved,
}

impl KeyResolution {
    pub fn columns(&self) -> Option<&[String]> {
        match self {
            Self::Declared(cols) | Self::Fallback(cols) => Some(cols),
            Self::Unresolved => None,
        }
    }
}

fn find_ci<'a>(columns: &'a [String], name: &str) -> Option<&'a String> {
    columns.iter().find(|c| c.eq_ignore_ascii_case(name))
}

impl TopicConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reads the topic's base URL from the environment variable it names.
    pub fn base_url_from_env(&self) -> Option<String> {
        std::env::var(&self.url_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn endpoint(&self, base_url: &str, unit_id: &str) -> String {
        format!("{base_url}{unit_id}")
    }

    /// Request body for one period: the template with the period injected as
    /// both range bounds. `GET` topics send no body.
    pub fn build_payload(&self, period: &str) -> Option<JsonValue> {
        if self.method == HttpMethod::Get {
            return None;
        }
        let mut body = match &self.payload {
            JsonValue::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert(
            "competenciaInicial".to_string(),
            JsonValue::String(period.to_string()),
        );
        body.insert(
            "competenciaFinal".to_string(),
            JsonValue::String(period.to_string()),
        );
        Some(JsonValue::Object(body))
    }

    pub fn applies_to_unit(&self, unit_name: &str) -> bool {
        if self.applicable_unit_keywords.is_empty() {
            return true;
        }
        let name = unit_name.to_uppercase();
        self.applicable_unit_keywords
            .iter()
            .any(|kw| name.contains(&kw.to_uppercase()))
    }

    pub fn pacing(&self, base: &Pacing) -> Pacing {
        let mut pacing = *base;
        if let Some(ms) = self.delay_between_calls_ms {
            pacing.delay_between_calls = Duration::from_millis(ms);
        }
        if let Some(ms) = self.delay_between_units_ms {
            pacing.delay_between_units = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_attempts {
            pacing.backoff.max_attempts = attempts;
        }
        if let Some(ms) = self.initial_backoff_ms {
            pacing.backoff.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(group) = self.group_by_unit {
            pacing.group_by_unit = group;
        }
        pacing
    }

    /// `api_{topic}_{MM_YYYY}`, lowercased topic id.
    pub fn file_stem(&self, month: MonthKey) -> String {
        format!("api_{}_{}", self.id.to_lowercase(), month.dir_name())
    }

    pub fn dataset_file_name(&self, month: MonthKey, format: TableFormat) -> String {
        format!("{}.{}", self.file_stem(month), format.extension())
    }

    /// If `file_name` is a dataset of this topic, the month stamped in its
    /// name and its format.
    ///
    /// The prefix must be followed by exactly `MM_YYYY`, so `api_x_` never
    /// claims `api_x_extra_03_2024`.
    pub fn match_dataset_file(&self, file_name: &str) -> Option<(MonthKey, TableFormat)> {
        let path = Path::new(file_name);
        let format = TableFormat::from_path(path)?;
        let stem = path.file_stem()?.to_str()?.to_lowercase();
        let prefix = format!("api_{}_", self.id.to_lowercase());
        let month: MonthKey = stem.strip_prefix(&prefix)?.parse().ok()?;
        Some((month, format))
    }

    /// Declared key columns absent from a dataset header.
    pub fn missing_key_columns(&self, columns: &[String]) -> Vec<String> {
        self.key_columns
            .iter()
            .filter(|k| find_ci(columns, k).is_none())
            .cloned()
            .collect()
    }

    /// Resolves the dedup key against a dataset header, case-insensitively.
    ///
    /// The full declared key wins. Otherwise the `{unidade, competencia}`
    /// pair is used when present. A partial declared key is only accepted
    /// when it keeps a column beyond those tag columns, since every extracted
    /// row carries them and a key of `unidade` alone collapses history.
    pub fn resolve_key_columns(&self, columns: &[String]) -> KeyResolution {
        let declared: Vec<String> = self
            .key_columns
            .iter()
            .filter_map(|k| find_ci(columns, k).cloned())
            .collect();
        if !declared.is_empty() && declared.len() == self.key_columns.len() {
            return KeyResolution::Declared(declared);
        }

        let fallback: Vec<String> = FALLBACK_KEY_COLUMNS
            .iter()
            .filter_map(|k| find_ci(columns, k).cloned())
            .collect();
        if fallback.len() == FALLBACK_KEY_COLUMNS.len() {
            return KeyResolution::Fallback(fallback);
        }

        let beyond_tags = declared
            .iter()
            .any(|c| !FALLBACK_KEY_COLUMNS.iter().any(|t| c.eq_ignore_ascii_case(t)));
        if beyond_tags {
            KeyResolution::Declared(declared)
        } else {
            KeyResolution::Unresolved
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicCatalog {
    pub topics: Vec<TopicConfig>,
}

impl TopicCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_yaml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for (idx, topic) in self.topics.iter().enumerate() {
            if topic.id.trim().is_empty() {
                return Err(CatalogError::EmptyId(idx + 1));
            }
            if !seen.insert(topic.id.to_lowercase()) {
                return Err(CatalogError::DuplicateId(topic.id.clone()));
            }
            if !topic.payload.is_object() {
                return Err(CatalogError::PayloadNotObject(topic.id.clone()));
            }
            if topic.url_env.trim().is_empty() {
                return Err(CatalogError::EmptyUrlEnv(topic.id.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &TopicConfig> {
        self.topics.iter().filter(|t| t.enabled)
    }

    pub fn get(&self, id: &str) -> Result<&TopicConfig, CatalogError> {
        self.topics
            .iter()
            .find(|t| t.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| CatalogError::UnknownTopic(id.to_string()))
    }
}
