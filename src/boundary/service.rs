use super::local::read_geojson_layer;
use super::{BoundaryLayer, BoundarySource, KeySpec};
use crate::errors::BoundaryError;
use crate::types::Level;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Keys per `IN (...)` clause.
const QUERY_BATCH: usize = 100;

/// One layer of a feature service and the attribute its features are keyed by.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceLayer {
    pub layer: String,
    pub key: KeySpec,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FeatureServiceConfig {
    pub url: String,
    /// Level name (`zip`, `county`, ...) to layer.
    #[serde(default)]
    pub layers: BTreeMap<String, ServiceLayer>,
}

/// An ArcGIS-style REST feature service queried per layer, returning GeoJSON
/// in longitude/latitude.
pub struct FeatureServiceSource {
    name: String,
    url: String,
    layers: HashMap<Level, ServiceLayer>,
    client: reqwest::blocking::Client,
}

impl FeatureServiceSource {
    pub fn new(name: &str, config: FeatureServiceConfig, client: reqwest::blocking::Client) -> Self {
        let mut layers = HashMap::new();
        for (label, layer) in config.layers {
            match Level::from_label(&label) {
                Some(level) => {
                    layers.insert(level, layer);
                }
                None => warn!(source = name, "ignoring layer for unknown level '{}'", label),
            }
        }
        Self {
            name: name.to_string(),
            url: config.url,
            layers,
            client,
        }
    }

    fn query_url(&self, layer: &ServiceLayer, keys: &[&String]) -> Result<reqwest::Url, BoundaryError> {
        let field = layer
            .key
            .primary()
            .ok_or_else(|| BoundaryError::GeoJson(format!("layer {} has no key field", layer.layer)))?;
        let endpoint = format!(
            "{}/{}/query",
            self.url.trim_end_matches('/'),
            layer.layer
        );
        let params = [
            ("where", where_in(field, keys)),
            ("outFields", field.to_string()),
            ("returnGeometry", "true".to_string()),
            ("outSR", "4326".to_string()),
            ("f", "geojson".to_string()),
        ];
        reqwest::Url::parse_with_params(&endpoint, &params).map_err(|e| BoundaryError::Transport {
            url: endpoint.clone(),
            reason: e.to_string(),
        })
    }

    fn query(&self, layer: &ServiceLayer, keys: &[&String]) -> Result<BoundaryLayer, BoundaryError> {
        let url = self.query_url(layer, keys)?;
        let transport = |reason: String| BoundaryError::Transport {
            url: url.to_string(),
            reason,
        };
        let bytes = self
            .client
            .get(url.clone())
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(|e| transport(e.to_string()))?;
        read_geojson_layer(bytes.as_ref(), &layer.key)
    }
}

impl BoundarySource for FeatureServiceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, level: Level) -> bool {
        self.layers.contains_key(&level)
    }

    fn fetch(&self, level: Level, keys: &BTreeSet<String>) -> Result<BoundaryLayer, BoundaryError> {
        let layer = self.layers.get(&level).ok_or_else(|| BoundaryError::Unsupported {
            source_name: self.name.clone(),
            level,
        })?;

        let keys: Vec<&String> = keys.iter().collect();
        let mut merged = BoundaryLayer::new();
        for batch in keys.chunks(QUERY_BATCH) {
            let found = self.query(layer, batch)?;
            debug!(source = %self.name, %level, requested = batch.len(), found = found.len(), "queried feature service");
            merged.extend(found);
        }

        let requested: BTreeSet<String> = keys.into_iter().cloned().collect();
        Ok(layer.key.select(&merged, &requested))
    }

    fn is_remote(&self) -> bool {
        true
    }
}

fn where_in(field: &str, keys: &[&String]) -> String {
    let quoted: Vec<String> = keys
        .iter()
        .map(|k| format!("'{}'", k.replace('\'', "''")))
        .collect();
    format!("{} IN ({})", field, quoted.join(","))
}
