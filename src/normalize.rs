//! Header detection, identifier canonicalisation and measure classification.

use crate::errors::PipelineError;
use crate::types::{Level, Table, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Semantic columns recognised by header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Zip,
    Fips,
    County,
    State,
    Chapter,
    ChapterCode,
    Region,
    RegionCode,
    Division,
    DivisionCode,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Zip,
        Field::Fips,
        Field::County,
        Field::State,
        Field::Chapter,
        Field::ChapterCode,
        Field::Region,
        Field::RegionCode,
        Field::Division,
        Field::DivisionCode,
    ];

    /// Name the column is exported under.
    pub fn canonical(&self) -> &'static str {
        match self {
            Field::Zip => "Zip",
            Field::Fips => "FIPS",
            Field::County => "County",
            Field::State => "State",
            Field::Chapter => "Chapter",
            Field::ChapterCode => "ECODE",
            Field::Region => "Region",
            Field::RegionCode => "RCODE",
            Field::Division => "Division",
            Field::DivisionCode => "DCODE",
        }
    }

    /// Accepted header variants after [`normalize_header`], in priority order.
    pub fn patterns(&self) -> &'static [&'static str] {
        match self {
            Field::Zip => &["zip", "zip code", "zipcode", "zcta", "zcta5", "postal code", "postalcode"],
            Field::Fips => &["fips", "fips code", "fipscode", "geoid", "county fips", "countyfips"],
            Field::County => &["county", "county name", "countyname", "xcounty"],
            Field::State => &["state", "state name", "statename", "st", "state code", "statecode"],
            Field::Chapter => &["chapter", "chapter name", "chaptername"],
            Field::ChapterCode => &["ecode", "e code", "chapter code", "chaptercode"],
            Field::Region => &["region", "region name", "regionname"],
            Field::RegionCode => &["rcode", "r code", "region code", "regioncode"],
            Field::Division => &["division", "division name", "divisionname"],
            Field::DivisionCode => &["dcode", "d code", "division code", "divisioncode"],
        }
    }

    /// The level whose granularity this column describes.
    pub fn level(&self) -> Level {
        match self {
            Field::Zip => Level::Zip,
            Field::Fips | Field::County | Field::State => Level::County,
            Field::Chapter | Field::ChapterCode => Level::Chapter,
            Field::Region | Field::RegionCode => Level::Region,
            Field::Division | Field::DivisionCode => Level::Division,
        }
    }

    /// Fixed-width numeric identifiers.
    fn width(&self) -> Option<usize> {
        match self {
            Field::Zip | Field::Fips => Some(5),
            _ => None,
        }
    }

    /// Fields whose values can serve as a group key.
    fn is_key(&self) -> bool {
        !matches!(self, Field::County | Field::State)
    }
}

/// Key column candidates per level, preferred first.
pub fn key_candidates(level: Level) -> &'static [Field] {
    match level {
        Level::Zip => &[Field::Zip],
        Level::County => &[Field::Fips],
        Level::Chapter => &[Field::ChapterCode, Field::Chapter],
        Level::Region => &[Field::RegionCode, Field::Region],
        Level::Division => &[Field::DivisionCode, Field::Division],
    }
}

/// Name label of an organisational level, tried when its boundaries are
/// keyed by name but the group key is a code.
pub fn name_field(level: Level) -> Option<Field> {
    match level {
        Level::Chapter => Some(Field::Chapter),
        Level::Region => Some(Field::Region),
        Level::Division => Some(Field::Division),
        Level::Zip | Level::County => None,
    }
}

/// Lowercases, trims and folds `_`/`-` to spaces.
pub fn normalize_header(name: &str) -> String {
    name.trim().to_lowercase().replace(['_', '-'], " ")
}

/// Maps each recognised field to the index of the header that matched it.
pub fn detect_columns(headers: &[String]) -> IndexMap<Field, usize> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let mut detected = IndexMap::new();
    let mut taken = vec![false; headers.len()];

    for field in Field::ALL {
        'patterns: for pattern in field.patterns() {
            for (idx, name) in normalized.iter().enumerate() {
                if !taken[idx] && name == pattern {
                    detected.insert(field, idx);
                    taken[idx] = true;
                    break 'patterns;
                }
            }
        }
    }

    detected
}

/// Canonical zero-padded form of a numeric identifier, or `None` when the
/// value cannot be coerced. Idempotent.
pub fn normalize_numeric_id(raw: &str, width: usize) -> Option<String> {
    let s = raw.trim();
    let s = s.strip_suffix(".0").unwrap_or(s);
    if s.is_empty() || s.len() > width || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{:0>width$}", s, width = width))
}

pub fn normalize_zip(raw: &str) -> Option<String> {
    let s = raw.trim();
    // ZIP+4 keeps the five-digit prefix.
    let s = match s.split_once('-') {
        Some((head, tail)) if tail.len() == 4 && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => s,
    };
    normalize_numeric_id(s, 5)
}

pub fn normalize_fips(raw: &str) -> Option<String> {
    normalize_numeric_id(raw, 5)
}

/// Organisational codes and names are kept as given, trimmed.
pub fn normalize_code(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

pub fn normalize_value(field: Field, value: &Value) -> Option<String> {
    let text = value.as_text()?;
    match field.width() {
        Some(_) if field == Field::Zip => normalize_zip(&text),
        Some(width) => normalize_numeric_id(&text, width),
        None => normalize_code(&text),
    }
}

/// Semantic class of a non-identifier column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasureKind {
    /// All-digit header such as `2023`. Summed.
    Year,
    /// Header containing `Total`. Already aggregated upstream, never re-summed.
    /// `scope` is the coarsest level the total remains meaningful at.
    Total { scope: Level },
    /// Any other numeric column, reduced by the configured default.
    Generic,
    /// `Base (Level)`: a value precomputed for `level`.
    Precomputed { base: String, level: Level },
    /// Non-numeric column without a recognised header; only carried at ZIP.
    Text,
}

#[derive(Debug, Clone)]
pub struct MeasureColumn {
    pub index: usize,
    pub name: String,
    pub kind: MeasureKind,
}

/// Splits `Drives (Division)` into (`Drives`, Division).
pub fn split_level_suffix(name: &str) -> Option<(String, Level)> {
    let trimmed = name.trim();
    let inner = trimmed.strip_suffix(')')?;
    let open = inner.rfind(" (")?;
    let level = Level::from_label(&inner[open + 2..])?;
    let base = inner[..open].trim();
    if base.is_empty() {
        return None;
    }
    Some((base.to_string(), level))
}

fn total_scope(name: &str) -> Level {
    [Level::Division, Level::Region, Level::Chapter]
        .into_iter()
        .find(|level| name.contains(level.label()))
        .unwrap_or(Level::County)
}

/// Classifies a header by name alone.
pub fn classify_measure(name: &str) -> MeasureKind {
    if let Some((base, level)) = split_level_suffix(name) {
        return MeasureKind::Precomputed { base, level };
    }
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
        return MeasureKind::Year;
    }
    if name.contains("Total") {
        return MeasureKind::Total {
            scope: total_scope(name),
        };
    }
    MeasureKind::Generic
}

/// The base table with every identifier column canonicalised once.
/// Shared read-only by all levels of a run.
#[derive(Debug, Clone)]
pub struct NormalizedTable {
    pub table: Table,
    pub fields: IndexMap<Field, usize>,
    keys: HashMap<Field, Vec<Option<String>>>,
    invalid: HashMap<Field, usize>,
    pub measures: Vec<MeasureColumn>,
}

impl NormalizedTable {
    pub fn new(table: Table) -> Result<Self, PipelineError> {
        if table.is_empty() {
            return Err(PipelineError::EmptyInput);
        }

        let fields = detect_columns(&table.columns);
        let mut keys = HashMap::new();
        let mut invalid = HashMap::new();

        for (&field, &col) in &fields {
            if !field.is_key() {
                continue;
            }
            let values: Vec<Option<String>> = table
                .rows
                .iter()
                .map(|row| row.get(col).and_then(|v| normalize_value(field, v)))
                .collect();
            let bad = values.iter().filter(|v| v.is_none()).count();
            if bad > 0 {
                tracing::debug!(field = field.canonical(), invalid = bad, "unusable identifier values");
            }
            invalid.insert(field, bad);
            keys.insert(field, values);
        }

        let identifier_cols: Vec<usize> = fields.values().copied().collect();
        let measures = table
            .columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| !identifier_cols.contains(idx))
            .map(|(index, name)| {
                let mut kind = classify_measure(name);
                if kind == MeasureKind::Generic && !column_is_numeric(&table, index) {
                    kind = MeasureKind::Text;
                }
                MeasureColumn {
                    index,
                    name: name.clone(),
                    kind,
                }
            })
            .collect();

        Ok(Self {
            table,
            fields,
            keys,
            invalid,
            measures,
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn has(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    /// Field providing the group key for `level`.
    pub fn key_field(&self, level: Level) -> Result<Field, PipelineError> {
        let candidates = key_candidates(level);
        candidates
            .iter()
            .copied()
            .find(|f| self.has(*f))
            .ok_or_else(|| PipelineError::MissingIdentifierColumn {
                level,
                column: candidates[0].canonical(),
                expected: candidates
                    .iter()
                    .flat_map(|f| f.patterns().iter().copied())
                    .collect(),
            })
    }

    /// Normalized identifier for one row, `None` when absent or unusable.
    pub fn key(&self, field: Field, row: usize) -> Option<&str> {
        self.keys
            .get(&field)
            .and_then(|values| values.get(row))
            .and_then(|v| v.as_deref())
    }

    /// Number of rows whose `field` value failed normalization.
    pub fn invalid_count(&self, field: Field) -> usize {
        self.invalid.get(&field).copied().unwrap_or(0)
    }

    /// Group key of `row` at `level`. A row only counts at a level when every
    /// identifier at that level and finer is usable.
    pub fn group_key(&self, level: Level, row: usize) -> Option<&str> {
        for finer in Level::ALL.iter().filter(|l| **l < level) {
            if let Some(field) = key_candidates(*finer).iter().find(|f| self.has(**f)) {
                self.key(*field, row)?;
            }
        }
        let field = key_candidates(level).iter().find(|f| self.has(**f))?;
        self.key(*field, row)
    }

    pub fn value(&self, row: usize, col: usize) -> &Value {
        self.table.cell(row, col)
    }
}

fn column_is_numeric(table: &Table, col: usize) -> bool {
    let mut seen = false;
    for row in &table.rows {
        let v = row.get(col).unwrap_or(&Value::Missing);
        if v.is_missing() {
            continue;
        }
        if v.as_f64().is_none() {
            return false;
        }
        seen = true;
    }
    seen
}
