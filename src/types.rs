use geo::MultiPolygon;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One cell of the input table.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Missing,
}

impl Value {
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Missing => true,
            Value::Text(s) => s.trim().is_empty(),
            Value::Number(n) => n.is_nan(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) if !n.is_nan() => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| !n.is_nan()),
            _ => None,
        }
    }

    /// Text form used for identifiers and labels. Integral numbers print
    /// without a fractional part.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s.clone()),
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Value::Number(n) => Some(n.to_string()),
            Value::Missing => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => number_to_json(*n),
            Value::Missing => serde_json::Value::Null,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        if s.trim().is_empty() {
            Value::Missing
        } else {
            Value::Text(s.to_string())
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

pub fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_nan() {
        serde_json::Value::Null
    } else if n.fract() == 0.0 && n.abs() < 9.0e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// A flat table: header names plus rows of cells in header order.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row, padding short rows with `Missing`.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Missing);
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, col: usize) -> &Value {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Value::Missing)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The five nested geographies, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Zip,
    County,
    Chapter,
    Region,
    Division,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Zip,
        Level::County,
        Level::Chapter,
        Level::Region,
        Level::Division,
    ];

    /// Label used in level-suffixed column names, e.g. `Drives (Division)`.
    pub fn label(&self) -> &'static str {
        match self {
            Level::Zip => "Zip",
            Level::County => "County",
            Level::Chapter => "Chapter",
            Level::Region => "Region",
            Level::Division => "Division",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Level::Zip => "zip",
            Level::County => "county",
            Level::Chapter => "chapter",
            Level::Region => "region",
            Level::Division => "division",
        }
    }

    pub fn file_stem(&self) -> &'static str {
        match self {
            Level::Zip => "zip_codes",
            Level::County => "counties",
            Level::Chapter => "chapters",
            Level::Region => "regions",
            Level::Division => "divisions",
        }
    }

    /// True when `self` nests inside `other` (or is the same level).
    pub fn within(&self, other: Level) -> bool {
        *self <= other
    }

    pub fn from_label(s: &str) -> Option<Level> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "zip" | "zips" | "zip code" | "zip codes" | "zip_codes" | "zcta" => Some(Level::Zip),
            "county" | "counties" => Some(Level::County),
            "chapter" | "chapters" => Some(Level::Chapter),
            "region" | "regions" => Some(Level::Region),
            "division" | "divisions" => Some(Level::Division),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::from_label(s).ok_or_else(|| format!("unknown level '{}'", s))
    }
}

/// How a measure column collapses across the rows of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    #[default]
    Sum,
    First,
    Mean,
    Min,
    Max,
}

impl FromStr for Reduction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Reduction::Sum),
            "first" => Ok(Reduction::First),
            "mean" => Ok(Reduction::Mean),
            "min" => Ok(Reduction::Min),
            "max" => Ok(Reduction::Max),
            other => Err(format!("unknown reduction '{}'", other)),
        }
    }
}

/// One output record per group key.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedGroup {
    pub key: String,
    /// Property name the key is exported under (`FIPS`, `Chapter`, ...).
    pub key_column: String,
    /// Carried labels and reduced measures, in output order.
    pub properties: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct OutputFeature {
    pub group: AggregatedGroup,
    pub geometry: MultiPolygon<f64>,
}

/// Per-level outcome handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct LevelReport {
    pub level: Level,
    pub groups_produced: usize,
    pub rows_skipped: usize,
    pub join_misses: usize,
    pub features_written: usize,
    pub assignment_conflicts: usize,
    pub divergent_labels: usize,
    pub used_precomputed: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub output_bytes: u64,
}

impl LevelReport {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            groups_produced: 0,
            rows_skipped: 0,
            join_misses: 0,
            features_written: 0,
            assignment_conflicts: 0,
            divergent_labels: 0,
            used_precomputed: Vec::new(),
            output_path: None,
            output_bytes: 0,
        }
    }
}
