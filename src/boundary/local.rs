use super::{BoundaryLayer, BoundarySource, KeySpec};
use crate::errors::BoundaryError;
use crate::reproject::Crs;
use crate::types::Level;
use geo::MultiPolygon;
use geojson::GeoJson;
use shapefile::dbase::FieldValue;
use shapefile::{Reader, Shape};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Property holding the key in persisted cache files.
pub(crate) const STORE_KEY: &str = "key";

/// Whole layers parsed once per source and reused for later lookups.
#[derive(Debug, Default)]
pub(crate) struct LayerMemo {
    layers: Mutex<HashMap<Level, Arc<BoundaryLayer>>>,
}

impl LayerMemo {
    pub(crate) fn get_or_load(
        &self,
        level: Level,
        load: impl FnOnce() -> Result<BoundaryLayer, BoundaryError>,
    ) -> Result<Arc<BoundaryLayer>, BoundaryError> {
        let mut layers = self.layers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(layer) = layers.get(&level) {
            return Ok(layer.clone());
        }
        let layer = Arc::new(load()?);
        layers.insert(level, layer.clone());
        Ok(layer)
    }
}

/// Boundaries previously persisted by the provider, one GeoJSON file per level.
pub struct LocalStoreSource {
    dir: PathBuf,
    memo: LayerMemo,
}

impl LocalStoreSource {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            memo: LayerMemo::default(),
        }
    }

    pub fn path_for(dir: &Path, level: Level) -> PathBuf {
        dir.join(format!("{}.geojson", level.slug()))
    }
}

impl BoundarySource for LocalStoreSource {
    fn name(&self) -> &str {
        "local-store"
    }

    fn supports(&self, level: Level) -> bool {
        Self::path_for(&self.dir, level).exists()
    }

    fn fetch(&self, level: Level, keys: &BTreeSet<String>) -> Result<BoundaryLayer, BoundaryError> {
        let spec = KeySpec::column(STORE_KEY);
        let layer = self.memo.get_or_load(level, || {
            let path = Self::path_for(&self.dir, level);
            let file = File::open(&path)?;
            read_geojson_layer(BufReader::new(file), &spec)
        })?;
        Ok(spec.select(&layer, keys))
    }
}

/// A boundary shapefile on disk, e.g. a chapter layer keyed by chapter name.
pub struct ShapefileSource {
    level: Level,
    path: PathBuf,
    key: KeySpec,
    memo: LayerMemo,
}

impl ShapefileSource {
    pub fn new(level: Level, path: PathBuf, key: KeySpec) -> Self {
        Self {
            level,
            path,
            key,
            memo: LayerMemo::default(),
        }
    }
}

impl BoundarySource for ShapefileSource {
    fn name(&self) -> &str {
        "local-shapefile"
    }

    fn supports(&self, level: Level) -> bool {
        level == self.level && self.path.exists()
    }

    fn fetch(&self, level: Level, keys: &BTreeSet<String>) -> Result<BoundaryLayer, BoundaryError> {
        if level != self.level {
            return Err(BoundaryError::Unsupported {
                source_name: self.name().to_string(),
                level,
            });
        }
        let layer = self
            .memo
            .get_or_load(level, || read_shapefile_layer(&self.path, &self.key))?;
        Ok(self.key.select(&layer, keys))
    }
}

/// Reads every polygon feature of a shapefile, keyed per `key` and
/// reprojected to longitude/latitude from the sibling `.prj`.
pub fn read_shapefile_layer(path: &Path, key: &KeySpec) -> Result<BoundaryLayer, BoundaryError> {
    let crs = match fs::read_to_string(path.with_extension("prj")) {
        Ok(wkt) => Crs::from_wkt(&wkt).ok_or_else(|| {
            BoundaryError::Shapefile(format!("unsupported projection in {:?}", path))
        })?,
        Err(_) => {
            warn!("no .prj next to {:?}; assuming geographic coordinates", path);
            Crs::Geographic
        }
    };

    let mut reader = Reader::from_path(path)
        .map_err(|e| BoundaryError::Shapefile(format!("failed to open {:?}: {}", path, e)))?;

    let mut layer = BoundaryLayer::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.map_err(|e| BoundaryError::Shapefile(e.to_string()))?;

        let Some(id) = key.extract(|column| record.get(column).and_then(field_text)) else {
            continue;
        };

        let geometry: MultiPolygon<f64> = match shape {
            Shape::Polygon(polygon) => polygon.try_into().map_err(|e| {
                BoundaryError::Shapefile(format!("Failed to convert polygon: {:?}", e))
            })?,
            Shape::PolygonM(polygon) => polygon.try_into().map_err(|e| {
                BoundaryError::Shapefile(format!("Failed to convert polygonM: {:?}", e))
            })?,
            Shape::PolygonZ(polygon) => polygon.try_into().map_err(|e| {
                BoundaryError::Shapefile(format!("Failed to convert polygonZ: {:?}", e))
            })?,
            _ => continue,
        };

        merge_into(&mut layer, id, crs.to_lon_lat(geometry));
    }

    debug!(features = layer.len(), "read shapefile {:?}", path);
    Ok(layer)
}

/// Reads a GeoJSON FeatureCollection of polygons keyed by a property.
/// RFC 7946 input is already longitude/latitude; a legacy `crs` member
/// naming Web Mercator is projected back.
pub fn read_geojson_layer<R: Read>(reader: R, key: &KeySpec) -> Result<BoundaryLayer, BoundaryError> {
    let geojson = GeoJson::from_reader(reader).map_err(|e| BoundaryError::GeoJson(e.to_string()))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(BoundaryError::GeoJson("expected a FeatureCollection".to_string())),
    };

    let crs = match legacy_crs_name(&collection) {
        Some(name) => Crs::from_crs_name(name)
            .ok_or_else(|| BoundaryError::GeoJson(format!("unsupported crs '{}'", name)))?,
        None => Crs::Geographic,
    };

    let mut layer = BoundaryLayer::new();
    for feature in collection.features {
        let id = feature.properties.as_ref().and_then(|props| {
            key.extract(|column| match props.get(column) {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
        });
        let Some(id) = id else {
            continue;
        };

        let geometry = match feature.geometry {
            Some(geom) => {
                let converted: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| BoundaryError::GeoJson(format!("Failed to convert geometry: {:?}", e)))?;
                match converted {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => continue,
                }
            }
            None => continue,
        };

        merge_into(&mut layer, id, crs.to_lon_lat(geometry));
    }

    Ok(layer)
}

fn legacy_crs_name(collection: &geojson::FeatureCollection) -> Option<&str> {
    collection
        .foreign_members
        .as_ref()?
        .get("crs")?
        .pointer("/properties/name")?
        .as_str()
}

/// Several records with one key (island parts split across rows) become
/// one multi-part boundary.
fn merge_into(layer: &mut BoundaryLayer, id: String, geometry: MultiPolygon<f64>) {
    layer.entry(id).or_insert_with(|| MultiPolygon::new(Vec::new())).0.extend(geometry.0);
}

fn field_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Character(Some(s)) => Some(s.clone()),
        FieldValue::Numeric(Some(n)) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        FieldValue::Numeric(Some(n)) => Some(n.to_string()),
        FieldValue::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}
