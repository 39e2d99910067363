use biomed_geojson::aggregate::aggregate;
use biomed_geojson::boundary::{BoundaryCache, BoundaryProvider, MemorySource};
use biomed_geojson::config::{AggregationConfig, AppConfig, SimplifyConfig};
use biomed_geojson::data::read_table;
use biomed_geojson::normalize::NormalizedTable;
use biomed_geojson::pipeline::{output_path, run, run_level};
use biomed_geojson::types::Value;
use biomed_geojson::{Level, PipelineError};
use geo::{polygon, Area, MultiPolygon};
use geojson::FeatureCollection;
use std::fs;
use std::path::Path;

fn square(x: f64, y: f64) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![polygon![
        (x: x, y: y),
        (x: x + 1.0, y: y),
        (x: x + 1.0, y: y + 1.0),
        (x: x, y: y + 1.0),
        (x: x, y: y),
    ]])
}

fn table(csv: &str) -> NormalizedTable {
    NormalizedTable::new(read_table(csv.as_bytes()).unwrap()).unwrap()
}

fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.output.dir = dir.to_path_buf();
    config.simplify = SimplifyConfig::exact();
    config
}

fn read_output(dir: &Path, level: Level) -> FeatureCollection {
    let text = fs::read_to_string(output_path(dir, "biomed", level)).unwrap();
    text.parse::<geojson::GeoJson>().unwrap().try_into().unwrap()
}

fn area_of(collection: &FeatureCollection, key: &str) -> f64 {
    let feature = collection
        .features
        .iter()
        .find(|f| matches!(&f.id, Some(geojson::feature::Id::String(id)) if id == key))
        .unwrap();
    let value = feature.geometry.as_ref().unwrap().value.clone();
    geo::Geometry::<f64>::try_from(value).unwrap().unsigned_area()
}

const NYC: &str = "\
ZIP,FIPS,Chapter,Region,Division,2023
10001,36061,NYC,NY,Atlantic,5
10002,36061,NYC,NY,Atlantic,3
";

#[test]
fn single_county_sums_years_and_keeps_its_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BoundaryCache::new();
    let source = MemorySource::new("memory").with(Level::County, "36061", square(-74.0, 40.0));
    let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);

    let report = run_level(&table(NYC), Level::County, &config(dir.path()), &provider).unwrap();
    assert_eq!(report.groups_produced, 1);
    assert_eq!(report.features_written, 1);
    assert_eq!(report.join_misses, 0);

    let collection = read_output(dir.path(), Level::County);
    assert_eq!(collection.features.len(), 1);
    let feature = &collection.features[0];
    let props = feature.properties.as_ref().unwrap();
    assert_eq!(props["FIPS"], serde_json::json!("36061"));
    assert_eq!(props["2023"].as_f64(), Some(8.0));
    assert_eq!(props["Chapter"], serde_json::json!("NYC"));
    assert_eq!(
        feature.geometry.as_ref().unwrap().value,
        geojson::Value::from(&square(-74.0, 40.0).0[0])
    );
}

#[test]
fn unresolvable_group_is_one_join_miss() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BoundaryCache::new();
    let source = MemorySource::new("memory").with(Level::County, "36061", square(-74.0, 40.0));
    let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);
    let csv = format!("{}11201,36047,Brooklyn,NY,Atlantic,4\n", NYC);

    let report = run_level(&table(&csv), Level::County, &config(dir.path()), &provider).unwrap();
    assert_eq!(report.groups_produced, 2);
    assert_eq!(report.join_misses, 1);
    assert_eq!(report.features_written, 1);

    let collection = read_output(dir.path(), Level::County);
    let keys: Vec<&serde_json::Value> = collection
        .features
        .iter()
        .map(|f| &f.properties.as_ref().unwrap()["FIPS"])
        .collect();
    assert_eq!(keys, vec![&serde_json::json!("36061")]);
}

#[test]
fn zip_totals_add_up_to_their_division() {
    let csv = "\
Zip,FIPS,Chapter,Region,Division,Drives,2022
10001,36061,NYC,NY,Atlantic,2,1
10002,36061,NYC,NY,Atlantic,3,1
11201,36047,LI,NY,Atlantic,4,0
19103,42101,Philly,PA,Atlantic,5,2
60601,17031,Chicago,IL,Central,7,9
";
    let table = table(csv);
    let config = AggregationConfig::default();
    let zips = aggregate(&table, Level::Zip, &config).unwrap();
    let divisions = aggregate(&table, Level::Division, &config).unwrap();

    let atlantic_zip_sum: f64 = zips
        .groups
        .iter()
        .filter(|g| g.properties["Division"] == Value::Text("Atlantic".into()))
        .map(|g| g.properties["Drives"].as_f64().unwrap())
        .sum();
    let atlantic = divisions.groups.iter().find(|g| g.key == "Atlantic").unwrap();
    assert_eq!(atlantic.properties["Drives"].as_f64(), Some(atlantic_zip_sum));
    assert_eq!(atlantic_zip_sum, 14.0);
    assert!(divisions.used_precomputed.is_empty());
}

#[test]
fn level_suffixed_column_beats_resumming() {
    let csv = "\
Zip,FIPS,Chapter,Region,Division,Drives,Drives (Division)
10001,36061,NYC,NY,Atlantic,2,100
10002,36061,NYC,NY,Atlantic,3,100
";
    let table = table(csv);
    let config = AggregationConfig::default();

    let division = aggregate(&table, Level::Division, &config).unwrap();
    assert_eq!(division.groups[0].properties["Drives"].as_f64(), Some(100.0));
    assert_eq!(division.used_precomputed, vec!["Drives (Division)".to_string()]);

    let county = aggregate(&table, Level::County, &config).unwrap();
    assert_eq!(county.groups[0].properties["Drives"].as_f64(), Some(5.0));
}

#[test]
fn counties_fit_inside_their_dissolved_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BoundaryCache::new();
    let source = MemorySource::new("memory")
        .with(Level::County, "36061", square(0.0, 0.0))
        .with(Level::County, "36047", square(1.0, 0.0))
        .with(Level::County, "36103", square(4.0, 4.0));
    let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);
    let csv = "\
FIPS,Chapter,2023
36061,Greater New York,5
36047,Greater New York,3
36103,Greater New York,1
";

    let results = run(
        &table(csv),
        &[Level::County, Level::Chapter],
        &config(dir.path()),
        &provider,
    );
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let counties = read_output(dir.path(), Level::County);
    let chapters = read_output(dir.path(), Level::Chapter);
    let chapter_area = area_of(&chapters, "Greater New York");
    assert!((chapter_area - 3.0).abs() < 1e-9);
    for fips in ["36061", "36047", "36103"] {
        assert!(area_of(&counties, fips) <= chapter_area + 1e-9);
    }

    let chapter = &chapters.features[0];
    assert!(matches!(
        chapter.geometry.as_ref().map(|g| &g.value),
        Some(geojson::Value::MultiPolygon(parts)) if parts.len() == 2
    ));
    assert_eq!(chapter.properties.as_ref().unwrap()["2023"].as_f64(), Some(9.0));
}

#[test]
fn missing_identifier_column_fails_only_its_level() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BoundaryCache::new();
    let source = MemorySource::new("memory").with(Level::Zip, "10001", square(0.0, 0.0));
    let provider = BoundaryProvider::new(vec![Box::new(source)], &cache);

    let results = run(
        &table("Zip,2023\n10001,4\n"),
        &[Level::Zip, Level::Region],
        &config(dir.path()),
        &provider,
    );
    for (level, result) in results {
        match level {
            Level::Zip => assert_eq!(result.unwrap().features_written, 1),
            Level::Region => match result {
                Err(PipelineError::MissingIdentifierColumn { expected, .. }) => {
                    assert!(expected.contains(&"rcode"));
                    assert!(expected.contains(&"region"));
                }
                other => panic!("expected a missing column error, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }
}

#[test]
fn rows_with_bad_identifiers_are_skipped_and_counted() {
    let csv = "\
Zip,FIPS,Chapter,2023
10001,36061,NYC,5
,36061,NYC,7
10002,bogus,NYC,3
";
    let table = table(csv);
    let config = AggregationConfig::default();

    let county = aggregate(&table, Level::County, &config).unwrap();
    assert_eq!(county.rows_skipped, 2);
    assert_eq!(county.groups[0].properties["2023"].as_f64(), Some(5.0));

    let zip = aggregate(&table, Level::Zip, &config).unwrap();
    assert_eq!(zip.rows_skipped, 1);
    assert_eq!(zip.groups.len(), 2);
}
