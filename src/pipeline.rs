//! Runs aggregate, resolve, dissolve and export for each requested level.

use crate::aggregate::aggregate;
use crate::boundary::{Boundary, BoundaryCache, BoundaryProvider};
use crate::config::AppConfig;
use crate::data;
use crate::dissolve::{assign_counties, dissolve, GroupAssignment};
use crate::errors::PipelineError;
use crate::export::{self, WriteOptions};
use crate::normalize::{name_field, normalize_code, Field, NormalizedTable};
use crate::types::{AggregatedGroup, Level, LevelReport};
use anyhow::Result;
use geo::MultiPolygon;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};

/// `<dir>/<dataset>_<level file stem>.geojson`
pub fn output_path(dir: &Path, dataset: &str, level: Level) -> PathBuf {
    dir.join(format!("{}_{}.geojson", dataset, level.file_stem()))
}

fn owned(resolved: HashMap<String, Boundary>) -> HashMap<String, MultiPolygon<f64>> {
    resolved
        .into_iter()
        .map(|(key, geometry)| (key, geometry.as_ref().clone()))
        .collect()
}

/// Geometry per group key for `level`. ZIP and county keys are resolved
/// directly. Organisational groups are resolved directly where a source has
/// them, by code or by name, and otherwise dissolved from their counties.
fn geometries_for(
    table: &NormalizedTable,
    level: Level,
    groups: &[AggregatedGroup],
    provider: &BoundaryProvider,
    report: &mut LevelReport,
) -> Result<HashMap<String, MultiPolygon<f64>>, PipelineError> {
    let keys = groups.iter().map(|g| g.key.as_str());
    if matches!(level, Level::Zip | Level::County) {
        return Ok(owned(provider.resolve_many(level, keys)));
    }

    let mut geometries = HashMap::new();
    if provider.supports(level) {
        geometries = owned(provider.resolve_many(level, keys));
        resolve_by_name(level, groups, provider, &mut geometries);
    }

    let remaining: HashSet<&str> = groups
        .iter()
        .map(|g| g.key.as_str())
        .filter(|k| !geometries.contains_key(*k))
        .collect();
    if remaining.is_empty() {
        return Ok(geometries);
    }
    if !table.has(Field::Fips) {
        warn!(%level, groups = remaining.len(), "no FIPS column to dissolve counties from");
        return Ok(geometries);
    }

    let assignment = assign_counties(table, level)?;
    report.assignment_conflicts = assignment.conflicts;

    let pending = GroupAssignment::from_pairs(assignment.members().filter_map(|county| {
        let group = assignment.group_of(county)?;
        remaining.contains(group).then_some((county, group))
    }));
    let counties = provider.resolve_many(Level::County, pending.members());
    let dissolved = dissolve(&counties, &pending);
    info!(%level, direct = geometries.len(), dissolved = dissolved.len(), "built group geometry");

    geometries.extend(dissolved);
    Ok(geometries)
}

/// Groups keyed by code (`ECODE`, ...) that no source knew by code are looked
/// up again by their carried name label.
fn resolve_by_name(
    level: Level,
    groups: &[AggregatedGroup],
    provider: &BoundaryProvider,
    geometries: &mut HashMap<String, MultiPolygon<f64>>,
) {
    let Some(label) = name_field(level) else {
        return;
    };
    let mut by_name: HashMap<String, Vec<&str>> = HashMap::new();
    for group in groups {
        if group.key_column == label.canonical() || geometries.contains_key(&group.key) {
            continue;
        }
        let name = group
            .properties
            .get(label.canonical())
            .and_then(|v| v.as_text())
            .and_then(|v| normalize_code(&v));
        if let Some(name) = name {
            by_name.entry(name).or_default().push(group.key.as_str());
        }
    }
    if by_name.is_empty() {
        return;
    }

    let resolved = provider.resolve_many(level, by_name.keys().map(String::as_str));
    let mut found = 0;
    for (name, geometry) in resolved {
        for key in by_name.get(&name).into_iter().flatten() {
            geometries.insert(key.to_string(), geometry.as_ref().clone());
            found += 1;
        }
    }
    debug!(%level, tried = by_name.len(), found, "resolved groups by name");
}

/// Aggregates, resolves and writes one level.
pub fn run_level(
    table: &NormalizedTable,
    level: Level,
    config: &AppConfig,
    provider: &BoundaryProvider,
) -> Result<LevelReport, PipelineError> {
    let aggregation = aggregate(table, level, &config.aggregation)?;

    let mut report = LevelReport::new(level);
    report.groups_produced = aggregation.groups.len();
    report.rows_skipped = aggregation.rows_skipped;
    report.divergent_labels = aggregation.divergent_labels;
    report.used_precomputed = aggregation.used_precomputed;

    let geometries = geometries_for(table, level, &aggregation.groups, provider, &mut report)?;
    let (features, join_misses) = export::join(&aggregation.groups, &geometries);
    report.join_misses = join_misses;

    let path = output_path(&config.output.dir, &config.input.dataset, level);
    let options = WriteOptions {
        max_bytes: config.output.max_bytes,
        pretty: config.output.pretty,
    };
    let written = export::write_level(level, &features, config.simplify.tolerance(level), &options, &path)?;

    report.features_written = written.features;
    report.output_bytes = written.bytes;
    report.output_path = Some(path);

    info!(
        %level,
        groups = report.groups_produced,
        skipped = report.rows_skipped,
        join_misses = report.join_misses,
        features = report.features_written,
        "level complete"
    );
    Ok(report)
}

/// Runs every requested level in parallel against the same table and cache.
/// A failing level does not stop the others.
pub fn run(
    table: &NormalizedTable,
    levels: &[Level],
    config: &AppConfig,
    provider: &BoundaryProvider,
) -> Vec<(Level, Result<LevelReport, PipelineError>)> {
    let mut unique: Vec<Level> = Vec::with_capacity(levels.len());
    for level in levels {
        if !unique.contains(level) {
            unique.push(*level);
        }
    }

    unique
        .par_iter()
        .map(|&level| {
            let span = info_span!("level", %level);
            let _entered = span.enter();
            let result = run_level(table, level, config, provider);
            if let Err(e) = &result {
                warn!(%level, "level failed: {}", e);
            }
            (level, result)
        })
        .collect()
}

/// Per-level result in a form the CLI and HTTP API can print or return.
#[derive(Debug, Serialize)]
pub struct LevelOutcome {
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<LevelReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<(Level, Result<LevelReport, PipelineError>)> for LevelOutcome {
    fn from((level, result): (Level, Result<LevelReport, PipelineError>)) -> Self {
        match result {
            Ok(report) => Self {
                level,
                report: Some(report),
                error: None,
            },
            Err(e) => Self {
                level,
                report: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Loads `input`, builds the configured boundary chain and runs `levels`.
/// Fails only when the file cannot be read or has no rows.
pub fn process_file(input: &Path, levels: &[Level], config: &AppConfig) -> Result<Vec<LevelOutcome>> {
    let table = data::load_table(input)?;
    let table = NormalizedTable::new(table)?;
    info!(rows = table.len(), columns = table.table.columns.len(), "normalized input");

    let cache = BoundaryCache::new();
    let provider = BoundaryProvider::from_config(&config.boundaries, &cache);
    let outcomes = run(&table, levels, config, &provider)
        .into_iter()
        .map(LevelOutcome::from)
        .collect();

    for level in levels {
        if let Some(source) = cache.winner(*level) {
            info!(%level, source, "boundaries resolved first from");
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::MemorySource;
    use crate::config::SimplifyConfig;
    use crate::types::{Table, Value};
    use geo::polygon;

    fn square(x: f64, y: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x, y: y),
            (x: x + 1.0, y: y),
            (x: x + 1.0, y: y + 1.0),
            (x: x, y: y + 1.0),
            (x: x, y: y),
        ]])
    }

    fn table(rows: &[[&str; 3]]) -> NormalizedTable {
        let mut table = Table::new(vec!["FIPS".into(), "Chapter".into(), "2023".into()]);
        for [fips, chapter, n] in rows {
            table.push_row(vec![
                Value::from(*fips),
                Value::from(*chapter),
                Value::Number(n.parse().unwrap()),
            ]);
        }
        NormalizedTable::new(table).unwrap()
    }

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.output.dir = dir.to_path_buf();
        config.simplify = SimplifyConfig::exact();
        config
    }

    #[test]
    fn output_names_follow_level() {
        assert_eq!(
            output_path(Path::new("out"), "biomed", Level::Zip),
            PathBuf::from("out/biomed_zip_codes.geojson")
        );
        assert_eq!(
            output_path(Path::new("out"), "drives", Level::Division),
            PathBuf::from("out/drives_divisions.geojson")
        );
    }

    #[test]
    fn direct_chapter_geometry_wins_over_dissolve() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BoundaryCache::new();
        let source = MemorySource::new("memory")
            .with(Level::Chapter, "NYC", square(10.0, 10.0))
            .with(Level::County, "36061", square(0.0, 0.0))
            .with(Level::County, "36047", square(1.0, 0.0));
        let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);
        let table = table(&[["36061", "NYC", "5"], ["36047", "LI", "3"]]);

        let report = run_level(&table, Level::Chapter, &config(dir.path()), &provider).unwrap();
        assert_eq!(report.features_written, 2);
        assert_eq!(report.join_misses, 0);
        // Only LI needed its counties.
        assert!(cache.get(Level::County, "36061").is_none());
        assert!(cache.get(Level::County, "36047").is_some());
    }

    #[test]
    fn coded_chapters_fall_back_to_name_keyed_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BoundaryCache::new();
        let source = MemorySource::new("chapters").with(Level::Chapter, "Greater NY", square(10.0, 10.0));
        let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);

        let mut raw = Table::new(vec!["FIPS".into(), "Chapter".into(), "ECODE".into(), "2023".into()]);
        raw.push_row(vec![
            Value::from("36061"),
            Value::from("Greater NY"),
            Value::from("05R12"),
            Value::Number(4.0),
        ]);
        let table = NormalizedTable::new(raw).unwrap();

        let report = run_level(&table, Level::Chapter, &config(dir.path()), &provider).unwrap();
        assert_eq!(report.features_written, 1);
        assert_eq!(report.join_misses, 0);
        assert!(cache.get(Level::County, "36061").is_none());
    }

    #[test]
    fn failing_levels_do_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BoundaryCache::new();
        let source = MemorySource::new("memory").with(Level::County, "36061", square(0.0, 0.0));
        let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);
        let table = table(&[["36061", "NYC", "5"]]);

        let results = run(
            &table,
            &[Level::County, Level::Division, Level::County],
            &config(dir.path()),
            &provider,
        );
        assert_eq!(results.len(), 2);
        let (_, county) = results.iter().find(|(l, _)| *l == Level::County).unwrap();
        assert_eq!(county.as_ref().unwrap().features_written, 1);
        let (_, division) = results.iter().find(|(l, _)| *l == Level::Division).unwrap();
        assert!(matches!(division, Err(PipelineError::MissingIdentifierColumn { .. })));
    }
}
