//! Core domain model for CREP: units, competencies, month keys and outcomes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "crep-core";

/// Organizational unit as listed in the external roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid period {0:?}, expected MM/YYYY")]
    Period(String),
    #[error("invalid month key {0:?}, expected MM_YYYY")]
    MonthKey(String),
    #[error("unknown competency status {0:?}")]
    Status(String),
}

/// Calendar month of an accounting cycle, rendered canonically as `MM/YYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(month: u32, year: i32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

/// Strict parse: only the canonical `MM/YYYY` form is accepted, so that a
/// parsed period always renders back to the exact input text.
impl FromStr for Period {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::Period(s.to_string());
        let (mm, yyyy) = s.split_once('/').ok_or_else(err)?;
        if mm.len() != 2
            || yyyy.len() != 4
            || !mm.bytes().all(|b| b.is_ascii_digit())
            || !yyyy.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let month: u32 = mm.parse().map_err(|_| err())?;
        let year: i32 = yyyy.parse().map_err(|_| err())?;
        Period::new(month, year).ok_or_else(err)
    }
}

const MONTH_ABBREVIATIONS: [(&str, u32); 19] = [
    ("jan", 1),
    ("fev", 2),
    ("feb", 2),
    ("mar", 3),
    ("abr", 4),
    ("apr", 4),
    ("mai", 5),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("ago", 8),
    ("aug", 8),
    ("set", 9),
    ("sep", 9),
    ("out", 10),
    ("oct", 10),
    ("nov", 11),
    ("dez", 12),
    ("dec", 12),
];

fn month_from_token(token: &str) -> Option<u32> {
    if token.bytes().all(|b| b.is_ascii_digit()) {
        return match token.len() {
            1 | 2 => token.parse().ok().filter(|m| (1..=12).contains(m)),
            _ => None,
        };
    }
    let prefix: String = token
        .trim_end_matches('.')
        .to_lowercase()
        .chars()
        .take(3)
        .collect();
    MONTH_ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| *abbr == prefix)
        .map(|(_, month)| *month)
}

fn year_from_token(token: &str) -> Option<i32> {
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match token.len() {
        4 => token.parse().ok(),
        2 => token.parse::<i32>().ok().map(|y| 2000 + y),
        _ => None,
    }
}

impl Period {
    /// Accepts the period spellings seen in upstream payloads: `MM/YYYY`,
    /// `M/YYYY`, `MM/YY`, `MM_YYYY`, `YYYY-MM[-DD...]` and month
    /// abbreviations in Portuguese or English (`fev/24`, `set./2024`).
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw
            .trim()
            .split(['/', '_', '-', ' '])
            .filter(|p| !p.is_empty())
            .collect();
        match parts.as_slice() {
            [year, month, ..] if year.len() == 4 && year.bytes().all(|b| b.is_ascii_digit()) => {
                let month: &str = month;
                let month = month.get(..2).unwrap_or(month);
                Period::new(month_from_token(month)?, year_from_token(year)?)
            }
            [month, year] => Period::new(month_from_token(month)?, year_from_token(year)?),
            _ => None,
        }
    }
}

/// Canonical `MM/YYYY` text for a loosely formatted period, if recognisable.
pub fn normalize_period(raw: &str) -> Option<String> {
    Period::parse_lenient(raw).map(|p| p.to_string())
}

/// Identifies one month directory (`MM_YYYY`) of the snapshot tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(month: u32, year: i32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// The reporting month a run on `today` targets: the month before it.
    pub fn preceding(today: NaiveDate) -> Self {
        Self {
            year: today.year(),
            month: today.month(),
        }
        .previous()
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn dir_name(&self) -> String {
        format!("{:02}_{:04}", self.month, self.year)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

impl FromStr for MonthKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::MonthKey(s.to_string());
        let (mm, yyyy) = s.split_once('_').ok_or_else(err)?;
        if mm.len() != 2 || yyyy.len() != 4 {
            return Err(err());
        }
        let month: u32 = mm.parse().map_err(|_| err())?;
        let year: i32 = yyyy.parse().map_err(|_| err())?;
        MonthKey::new(month, year).ok_or_else(err)
    }
}

/// Lifecycle state of a competency as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompetencyStatus {
    Open,
    Closed,
    Reopened,
    /// A label outside the three known states. Only tolerated in the
    /// current month's snapshot.
    Unrecognized,
}

impl CompetencyStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Extraction eligibility: anything that is neither open nor reopened.
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::Open | Self::Reopened)
    }

    /// Like `FromStr`, but maps unknown labels to `Unrecognized`.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or(Self::Unrecognized)
    }
}

impl FromStr for CompetencyStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABERTA" | "OPEN" => Ok(Self::Open),
            "FECHADA" | "CLOSED" => Ok(Self::Closed),
            "REABERTA" | "REOPENED" => Ok(Self::Reopened),
            _ => Err(ParseError::Status(s.to_string())),
        }
    }
}

/// One unit's reporting period together with its observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competency {
    pub unit: Unit,
    pub period: Period,
    pub status: CompetencyStatus,
}

impl Competency {
    pub fn key(&self) -> String {
        competency_key(&self.unit.name, &self.period.to_string())
    }
}

/// Composite business key of a competency: `unit name + "_" + period`.
///
/// Both parts are used verbatim; no trimming or case folding happens here.
pub fn competency_key(unit_name: &str, period: &str) -> String {
    format!("{unit_name}_{period}")
}

/// Classification of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    Timeout,
    NoData,
    Unavailable,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::NoData => "no_data",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single (topic, unit, period) extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub topic: String,
    pub unit: String,
    pub period: String,
    pub status: OutcomeStatus,
    pub records: usize,
    pub duration: Duration,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn new(topic: &str, unit: &str, period: &str, status: OutcomeStatus) -> Self {
        Self {
            topic: topic.to_string(),
            unit: unit.to_string(),
            period: period.to_string(),
            status,
            records: 0,
            duration: Duration::ZERO,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_records(mut self, records: usize) -> Self {
        self.records = records;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_round_trips_only_canonical_text() {
        let p: Period = "03/2024".parse().unwrap();
        assert_eq!(p.to_string(), "03/2024");
        assert!("3/2024".parse::<Period>().is_err());
        assert!("13/2024".parse::<Period>().is_err());
        assert!(" 03/2024".parse::<Period>().is_err());
    }

    #[test]
    fn month_key_previous_wraps_year() {
        let jan = MonthKey::new(1, 2025).unwrap();
        assert_eq!(jan.previous(), MonthKey::new(12, 2024).unwrap());
        assert_eq!(jan.previous().dir_name(), "12_2024");
        let today = NaiveDate::from_ymd_opt(2024, 4, 10).unwrap();
        assert_eq!(MonthKey::preceding(today).dir_name(), "03_2024");
        assert_eq!("11_2024".parse::<MonthKey>().unwrap(), MonthKey::new(11, 2024).unwrap());
    }

    #[test]
    fn status_aliases_parse() {
        assert_eq!("FECHADA".parse::<CompetencyStatus>().unwrap(), CompetencyStatus::Closed);
        assert_eq!("reaberta".parse::<CompetencyStatus>().unwrap(), CompetencyStatus::Reopened);
        assert_eq!(" Open ".parse::<CompetencyStatus>().unwrap(), CompetencyStatus::Open);
        assert!("EM_ANALISE".parse::<CompetencyStatus>().is_err());
        assert_eq!(CompetencyStatus::parse_lenient("EM_ANALISE"), CompetencyStatus::Unrecognized);
        assert!(CompetencyStatus::Unrecognized.is_eligible());
        assert!(!CompetencyStatus::Reopened.is_eligible());
        assert!(!CompetencyStatus::Open.is_eligible());
        assert!("PENDENTE".parse::<CompetencyStatus>().is_err());
    }

    #[test]
    fn competency_key_is_verbatim() {
        assert_eq!(competency_key("Hospital A", "03/2024"), "Hospital A_03/2024");
        assert_ne!(competency_key("Hospital A ", "03/2024"), competency_key("Hospital A", "03/2024"));
    }

    #[test]
    fn lenient_period_spellings_normalize() {
        for (raw, expected) in [
            ("03/2024", "03/2024"),
            ("3/2024", "03/2024"),
            ("03/24", "03/2024"),
            ("2024-03", "03/2024"),
            ("2024-03-01T00:00:00", "03/2024"),
            ("03_2024", "03/2024"),
            ("mar/2024", "03/2024"),
            ("FEV/24", "02/2024"),
            ("set./2024", "09/2024"),
            ("Dec 2023", "12/2023"),
        ] {
            assert_eq!(normalize_period(raw).as_deref(), Some(expected), "{raw}");
        }
        assert_eq!(normalize_period("2024"), None);
        assert_eq!(normalize_period("xyz/2024"), None);
        assert_eq!(normalize_period("13/2024"), None);
    }
}
