//! Simplification, the group-to-geometry join and GeoJSON output.

use crate::errors::PipelineError;
use crate::types::{AggregatedGroup, Level, OutputFeature};
use geo::{Intersects, MultiPolygon, Polygon, SimplifyVwPreserve};
use geojson::{Feature, FeatureCollection, Geometry};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Times the tolerance is doubled when an output exceeds its size budget.
const MAX_WIDENINGS: usize = 4;
/// Starting tolerance when a level configured none but must shrink.
const MIN_BUDGET_TOLERANCE: f64 = 0.0001;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A sibling of `path` no other writer in this process will pick.
fn temp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("geojson.{}.{}.tmp", std::process::id(), n))
}

/// A level's features ready to write, plus the groups that had no geometry.
#[derive(Debug)]
pub struct Exported {
    pub collection: FeatureCollection,
    pub join_misses: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub max_bytes: Option<u64>,
    pub pretty: bool,
}

/// What ended up on disk for one level.
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    pub features: usize,
    pub bytes: u64,
    /// Tolerance of the written file, wider than requested if the budget forced it.
    pub tolerance: f64,
}

/// Topology-preserving Visvalingam simplification. `tolerance` is a distance
/// in degrees; zero leaves the geometry untouched. Rings that collapse are
/// dropped, and if nothing survives the input is returned as-is.
///
/// Parts are simplified one at a time, so two disjoint parts can grow into
/// each other. Any pair that would overlap keeps its original rings.
pub fn simplify(geometry: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
    if tolerance <= 0.0 {
        return geometry.clone();
    }
    let area = tolerance * tolerance;
    let mut parts: Vec<(&Polygon<f64>, Polygon<f64>)> = geometry
        .0
        .iter()
        .map(|original| (original, original.simplify_vw_preserve(&area)))
        .filter(|(_, simplified)| simplified.exterior().0.len() >= 4)
        .collect();
    if parts.is_empty() {
        return geometry.clone();
    }

    // Restoring a part can make it collide with another simplified one.
    let mut restored = vec![false; parts.len()];
    loop {
        let mut changed = false;
        for i in 0..parts.len() {
            for j in (i + 1)..parts.len() {
                if restored[i] && restored[j] {
                    continue;
                }
                let (a, b) = (&parts[i], &parts[j]);
                if a.1.intersects(&b.1) && !a.0.intersects(b.0) {
                    for k in [i, j] {
                        if !restored[k] {
                            parts[k].1 = parts[k].0.clone();
                            restored[k] = true;
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    MultiPolygon::new(parts.into_iter().map(|(_, simplified)| simplified).collect())
}

/// Inner join of groups to geometries by group key. Groups without geometry
/// are counted, not emitted.
pub fn join(
    groups: &[AggregatedGroup],
    geometries: &HashMap<String, MultiPolygon<f64>>,
) -> (Vec<OutputFeature>, usize) {
    let mut misses = 0;
    let features = groups
        .iter()
        .filter_map(|group| match geometries.get(&group.key) {
            Some(geometry) if !geometry.0.is_empty() => Some(OutputFeature {
                group: group.clone(),
                geometry: geometry.clone(),
            }),
            _ => {
                misses += 1;
                None
            }
        })
        .collect();
    (features, misses)
}

fn to_feature(feature: &OutputFeature, tolerance: f64) -> Feature {
    let geometry = simplify(&feature.geometry, tolerance);
    let value = match geometry.0.as_slice() {
        [single] => geojson::Value::from(single),
        _ => geojson::Value::from(&geometry),
    };
    let properties = feature
        .group
        .properties
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: Some(geojson::feature::Id::String(feature.group.key.clone())),
        properties: Some(properties),
        foreign_members: None,
    }
}

pub fn to_collection(features: &[OutputFeature], tolerance: f64) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: features.par_iter().map(|f| to_feature(f, tolerance)).collect(),
        foreign_members: None,
    }
}

/// Builds the FeatureCollection for one level.
pub fn export(
    level: Level,
    groups: &[AggregatedGroup],
    geometries: &HashMap<String, MultiPolygon<f64>>,
    tolerance: f64,
) -> Exported {
    let (features, join_misses) = join(groups, geometries);
    if join_misses > 0 {
        info!(%level, join_misses, "groups without geometry left out");
    }
    Exported {
        collection: to_collection(&features, tolerance),
        join_misses,
    }
}

fn serialize(collection: &FeatureCollection, pretty: bool) -> Result<Vec<u8>, PipelineError> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(collection)?
    } else {
        serde_json::to_vec(collection)?
    };
    Ok(bytes)
}

/// Writes `features` to `path`, widening the tolerance while the file is
/// over `options.max_bytes`. The last attempt is written regardless.
pub fn write_level(
    level: Level,
    features: &[OutputFeature],
    tolerance: f64,
    options: &WriteOptions,
    path: &Path,
) -> Result<Written, PipelineError> {
    let mut tolerance = tolerance;
    let mut bytes = serialize(&to_collection(features, tolerance), options.pretty)?;

    if let Some(limit) = options.max_bytes {
        let mut widenings = 0;
        while bytes.len() as u64 > limit && widenings < MAX_WIDENINGS {
            tolerance = if tolerance > 0.0 {
                tolerance * 2.0
            } else {
                MIN_BUDGET_TOLERANCE
            };
            widenings += 1;
            debug!(%level, size = bytes.len(), tolerance, "over size budget; simplifying further");
            bytes = serialize(&to_collection(features, tolerance), options.pretty)?;
        }
        if bytes.len() as u64 > limit {
            warn!(%level, size = bytes.len(), limit, "still over size budget; writing anyway");
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;

    info!(%level, features = features.len(), size = bytes.len(), "wrote {:?}", path);
    Ok(Written {
        features: features.len(),
        bytes: bytes.len() as u64,
        tolerance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use geo::{polygon, Coord, LineString};
    use indexmap::IndexMap;

    fn square(x: f64, y: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x, y: y),
            (x: x + 1.0, y: y),
            (x: x + 1.0, y: y + 1.0),
            (x: x, y: y + 1.0),
            (x: x, y: y),
        ]])
    }

    /// A 720-vertex circle of radius one degree.
    fn circle() -> MultiPolygon<f64> {
        let mut ring: Vec<Coord<f64>> = (0..720)
            .map(|i| {
                let t = (i as f64).to_radians() / 2.0;
                Coord { x: t.cos(), y: t.sin() }
            })
            .collect();
        ring.push(ring[0]);
        MultiPolygon::new(vec![Polygon::new(LineString::new(ring), vec![])])
    }

    fn group(key: &str, total: f64) -> AggregatedGroup {
        let mut properties = IndexMap::new();
        properties.insert("FIPS".to_string(), Value::Text(key.to_string()));
        properties.insert("2023".to_string(), Value::Number(total));
        AggregatedGroup {
            key: key.to_string(),
            key_column: "FIPS".to_string(),
            properties,
        }
    }

    #[test]
    fn groups_without_geometry_are_counted_not_emitted() {
        let groups = vec![group("36061", 8.0), group("99999", 1.0)];
        let geometries = HashMap::from([("36061".to_string(), square(0.0, 0.0))]);
        let exported = export(Level::County, &groups, &geometries, 0.0);

        assert_eq!(exported.join_misses, 1);
        assert_eq!(exported.collection.features.len(), 1);
        let feature = &exported.collection.features[0];
        let props = feature.properties.as_ref().unwrap();
        assert_eq!(props["FIPS"], serde_json::json!("36061"));
        assert_eq!(props["2023"], serde_json::json!(8));
    }

    #[test]
    fn single_part_geometry_is_written_as_polygon() {
        let geometries = HashMap::from([
            ("A".to_string(), square(0.0, 0.0)),
            ("B".to_string(), {
                let mut mp = square(0.0, 0.0);
                mp.0.extend(square(5.0, 5.0).0);
                mp
            }),
        ]);
        let exported = export(Level::Chapter, &[group("A", 1.0), group("B", 1.0)], &geometries, 0.0);
        let kinds: Vec<&str> = exported
            .collection
            .features
            .iter()
            .map(|f| match f.geometry.as_ref().map(|g| &g.value) {
                Some(geojson::Value::Polygon(_)) => "Polygon",
                Some(geojson::Value::MultiPolygon(_)) => "MultiPolygon",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["Polygon", "MultiPolygon"]);
    }

    #[test]
    fn simplification_reduces_vertices() {
        let original = circle();
        let simplified = simplify(&original, 0.05);
        assert!(simplified.0[0].exterior().0.len() < original.0[0].exterior().0.len());
        assert!(simplified.0[0].exterior().0.len() >= 4);
        assert_eq!(simplify(&original, 0.0), original);
    }

    #[test]
    fn simplified_parts_do_not_grow_into_each_other() {
        // A U-shaped part with a small island sitting in its notch.
        let u_shape = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 6.0, y: 10.0),
            (x: 6.0, y: 2.0),
            (x: 4.0, y: 2.0),
            (x: 4.0, y: 10.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ];
        let island = polygon![
            (x: 4.5, y: 5.0),
            (x: 5.5, y: 5.0),
            (x: 5.5, y: 6.0),
            (x: 4.5, y: 6.0),
            (x: 4.5, y: 5.0),
        ];
        assert!(!u_shape.intersects(&island));

        let simplified = simplify(&MultiPolygon::new(vec![u_shape, island]), 3.5);
        assert!(!simplified.0.is_empty());
        for (i, a) in simplified.0.iter().enumerate() {
            for b in &simplified.0[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn concurrent_writers_use_distinct_temp_files() {
        let path = Path::new("out/biomed_counties.geojson");
        let a = temp_path(path);
        let b = temp_path(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.to_string_lossy().ends_with(".tmp"));
    }

    #[test]
    fn size_budget_widens_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("biomed_counties.geojson");
        let features = vec![OutputFeature {
            group: group("36061", 8.0),
            geometry: circle(),
        }];

        let unbounded = write_level(Level::County, &features, 0.0005, &WriteOptions::default(), &path).unwrap();
        let bounded = write_level(
            Level::County,
            &features,
            0.0005,
            &WriteOptions {
                max_bytes: Some(unbounded.bytes / 4),
                pretty: false,
            },
            &path,
        )
        .unwrap();

        assert!(bounded.tolerance > 0.0005);
        assert!(bounded.bytes < unbounded.bytes);
        let written: FeatureCollection = fs::read_to_string(&path).unwrap().parse::<geojson::GeoJson>()
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(written.features.len(), 1);
    }
}
