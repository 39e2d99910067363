//! Group-by-and-reduce of the normalized table at one level.

use crate::config::AggregationConfig;
use crate::errors::PipelineError;
use crate::normalize::{Field, MeasureKind, NormalizedTable};
use crate::types::{AggregatedGroup, Level, Reduction, Value};
use indexmap::IndexMap;
use tracing::{debug, warn};

/// Output of [`aggregate`] for one level.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub groups: Vec<AggregatedGroup>,
    /// Rows without a usable key at this level or a finer one.
    pub rows_skipped: usize,
    /// (group, label column) pairs whose rows disagreed; the first value was kept.
    pub divergent_labels: usize,
    /// Level-suffixed columns used in place of re-reducing their base measure.
    pub used_precomputed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    /// A recognised identifier or label column.
    Field(Field),
    /// Any other column, by index.
    Column(usize),
}

#[derive(Debug, Clone)]
struct Planned {
    output: String,
    source: Source,
    reduction: Reduction,
    is_label: bool,
}

/// Decides which columns a level carries and how each one reduces.
fn plan_columns(
    table: &NormalizedTable,
    level: Level,
    key_field: Field,
    config: &AggregationConfig,
) -> (Vec<Planned>, Vec<String>) {
    let mut plan: Vec<Planned> = Vec::new();

    for &field in table.fields.keys() {
        if field == key_field {
            continue;
        }
        if level == Level::Zip || level.within(field.level()) {
            plan.push(Planned {
                output: field.canonical().to_string(),
                source: Source::Field(field),
                reduction: Reduction::First,
                is_label: true,
            });
        }
    }

    let reduction_for = |name: &str, default: Reduction| {
        config.overrides.get(name).copied().unwrap_or(default)
    };

    let mut precomputed: Vec<(String, usize, String)> = Vec::new();
    for measure in &table.measures {
        let reduction = match &measure.kind {
            MeasureKind::Year => reduction_for(&measure.name, Reduction::Sum),
            MeasureKind::Generic => reduction_for(&measure.name, config.default_reduction),
            // Already aggregated upstream; summing would double count.
            MeasureKind::Total { scope } if level == Level::Zip || level.within(*scope) => {
                Reduction::First
            }
            MeasureKind::Total { .. } => continue,
            MeasureKind::Precomputed { base, level: own } if *own == level => {
                precomputed.push((base.clone(), measure.index, measure.name.clone()));
                continue;
            }
            MeasureKind::Precomputed { level: own, .. } if level < *own => Reduction::First,
            MeasureKind::Precomputed { .. } => continue,
            MeasureKind::Text if level == Level::Zip => Reduction::First,
            MeasureKind::Text => continue,
        };
        plan.push(Planned {
            output: measure.name.clone(),
            source: Source::Column(measure.index),
            reduction,
            is_label: false,
        });
    }

    let mut used = Vec::new();
    for (base, index, name) in precomputed {
        let replacement = Planned {
            output: base.clone(),
            source: Source::Column(index),
            reduction: Reduction::First,
            is_label: false,
        };
        match plan.iter_mut().find(|p| !p.is_label && p.output == base) {
            Some(existing) => *existing = replacement,
            None => plan.push(replacement),
        }
        used.push(name);
    }

    (plan, used)
}

#[derive(Debug, Clone)]
enum Acc {
    First { value: Option<Value>, divergent: bool },
    Sum(f64),
    Mean { total: f64, count: usize },
    Min(Option<f64>),
    Max(Option<f64>),
}

impl Acc {
    fn new(reduction: Reduction) -> Self {
        match reduction {
            Reduction::First => Acc::First {
                value: None,
                divergent: false,
            },
            Reduction::Sum => Acc::Sum(0.0),
            Reduction::Mean => Acc::Mean { total: 0.0, count: 0 },
            Reduction::Min => Acc::Min(None),
            Reduction::Max => Acc::Max(None),
        }
    }

    fn push(&mut self, value: Value) {
        if value.is_missing() {
            return;
        }
        match self {
            Acc::First { value: slot, divergent } => {
                if let Some(first) = slot.as_ref() {
                    if first.as_text() != value.as_text() {
                        *divergent = true;
                    }
                } else {
                    *slot = Some(value);
                }
            }
            Acc::Sum(total) => *total += value.as_f64().unwrap_or(0.0),
            Acc::Mean { total, count } => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            Acc::Min(current) => {
                if let Some(n) = value.as_f64() {
                    *current = Some(current.map_or(n, |c| c.min(n)));
                }
            }
            Acc::Max(current) => {
                if let Some(n) = value.as_f64() {
                    *current = Some(current.map_or(n, |c| c.max(n)));
                }
            }
        }
    }

    fn finish(self) -> (Value, bool) {
        match self {
            Acc::First { value, divergent } => (value.unwrap_or(Value::Missing), divergent),
            Acc::Sum(total) => (Value::Number(total), false),
            Acc::Mean { count: 0, .. } => (Value::Missing, false),
            Acc::Mean { total, count } => (Value::Number(total / count as f64), false),
            Acc::Min(v) | Acc::Max(v) => (v.map_or(Value::Missing, Value::Number), false),
        }
    }
}

fn cell(table: &NormalizedTable, source: Source, row: usize) -> Value {
    match source {
        Source::Field(field) => match table.key(field, row) {
            Some(key) => Value::Text(key.to_string()),
            None => table
                .fields
                .get(&field)
                .map(|&col| table.value(row, col).clone())
                .unwrap_or(Value::Missing),
        },
        Source::Column(col) => table.value(row, col).clone(),
    }
}

/// Reduces all rows sharing a group key at `level` into one record each.
///
/// Groups come out in order of first appearance. A level-suffixed column such
/// as `Drives (Division)` is used as-is for `Drives` at that level instead of
/// summing the base column.
pub fn aggregate(
    table: &NormalizedTable,
    level: Level,
    config: &AggregationConfig,
) -> Result<Aggregation, PipelineError> {
    let key_field = table.key_field(level)?;
    let (plan, used_precomputed) = plan_columns(table, level, key_field, config);

    let mut groups: IndexMap<String, Vec<Acc>> = IndexMap::new();
    let mut rows_skipped = 0;

    for row in 0..table.len() {
        let Some(key) = table.group_key(level, row) else {
            rows_skipped += 1;
            continue;
        };
        let accs = groups
            .entry(key.to_string())
            .or_insert_with(|| plan.iter().map(|p| Acc::new(p.reduction)).collect());
        for (acc, planned) in accs.iter_mut().zip(&plan) {
            acc.push(cell(table, planned.source, row));
        }
    }

    let key_column = key_field.canonical().to_string();
    let mut divergent_labels = 0;
    let groups: Vec<AggregatedGroup> = groups
        .into_iter()
        .map(|(key, accs)| {
            let mut properties = IndexMap::with_capacity(plan.len() + 1);
            properties.insert(key_column.clone(), Value::Text(key.clone()));
            for (acc, planned) in accs.into_iter().zip(&plan) {
                let (value, divergent) = acc.finish();
                if divergent && planned.is_label {
                    divergent_labels += 1;
                }
                properties.insert(planned.output.clone(), value);
            }
            AggregatedGroup {
                key,
                key_column: key_column.clone(),
                properties,
            }
        })
        .collect();

    if divergent_labels > 0 {
        warn!(%level, divergent_labels, "groups with inconsistent labels; kept first occurrence");
    }
    if rows_skipped > 0 {
        debug!(%level, rows_skipped, "rows without a usable key");
    }

    Ok(Aggregation {
        groups,
        rows_skipped,
        divergent_labels,
        used_precomputed,
    })
}
