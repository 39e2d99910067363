//! Boundary geometry resolution through an ordered chain of sources.

mod census;
mod local;
mod service;

pub use census::CensusArchiveSource;
pub use local::{read_geojson_layer, read_shapefile_layer, LocalStoreSource, ShapefileSource};
pub use service::{FeatureServiceConfig, FeatureServiceSource, ServiceLayer};

use crate::config::{BoundaryConfig, RetryPolicy};
use crate::errors::BoundaryError;
use crate::normalize::normalize_numeric_id;
use crate::types::Level;
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type Boundary = Arc<MultiPolygon<f64>>;
pub type BoundaryLayer = HashMap<String, MultiPolygon<f64>>;

/// One place boundaries can come from.
pub trait BoundarySource: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, level: Level) -> bool;

    /// Boundaries for whichever of `keys` this source knows. Keys it lacks are
    /// simply absent from the result.
    fn fetch(&self, level: Level, keys: &BTreeSet<String>) -> Result<BoundaryLayer, BoundaryError>;

    /// Remote sources are retried and their results persisted locally.
    fn is_remote(&self) -> bool {
        false
    }
}

/// How a boundary file's attributes turn into a key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct KeySpec {
    /// Column lists tried in order; the columns of the first list that is
    /// fully present are concatenated.
    pub candidates: Vec<Vec<String>>,
    #[serde(default)]
    pub pad: Option<usize>,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl KeySpec {
    pub fn column(name: &str) -> Self {
        Self {
            candidates: vec![vec![name.to_string()]],
            pad: None,
            case_insensitive: false,
        }
    }

    pub fn padded(mut self, width: usize) -> Self {
        self.pad = Some(width);
        self
    }

    pub fn or_concat(mut self, columns: &[&str]) -> Self {
        self.candidates
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn or_column(self, name: &str) -> Self {
        self.or_concat(&[name])
    }

    pub fn ignoring_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// First column name, used when a key must be queried by field.
    pub fn primary(&self) -> Option<&str> {
        self.candidates.first()?.first().map(String::as_str)
    }

    pub fn extract(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        for columns in &self.candidates {
            let parts: Option<Vec<String>> = columns.iter().map(|c| lookup(c)).collect();
            if let Some(parts) = parts {
                return self.canonical(&parts.concat());
            }
        }
        None
    }

    /// The comparable form of a key from either side of the join.
    pub fn canonical(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let key = match self.pad {
            Some(width) => normalize_numeric_id(trimmed, width)?,
            None if trimmed.is_empty() => return None,
            None => trimmed.to_string(),
        };
        Some(if self.case_insensitive {
            key.to_uppercase()
        } else {
            key
        })
    }

    /// Restricts `layer` to the requested keys, re-keyed by the caller's spelling.
    pub fn select(&self, layer: &BoundaryLayer, keys: &BTreeSet<String>) -> BoundaryLayer {
        keys.iter()
            .filter_map(|key| {
                let canonical = self.canonical(key)?;
                layer.get(&canonical).map(|g| (key.clone(), g.clone()))
            })
            .collect()
    }
}

/// Boundaries resolved during one run. Passed explicitly to every provider so
/// concurrent levels share downloads.
#[derive(Debug, Default)]
pub struct BoundaryCache {
    layers: RwLock<HashMap<Level, HashMap<String, Boundary>>>,
    misses: RwLock<HashMap<Level, HashSet<String>>>,
    winners: RwLock<HashMap<Level, String>>,
    level_locks: Mutex<HashMap<Level, Arc<Mutex<()>>>>,
}

impl BoundaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, level: Level, key: &str) -> Option<Boundary> {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        layers.get(&level)?.get(key).cloned()
    }

    fn insert(&self, level: Level, key: String, geometry: MultiPolygon<f64>) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        // First result wins if two fetches raced.
        layers
            .entry(level)
            .or_default()
            .entry(key)
            .or_insert_with(|| Arc::new(geometry));
    }

    fn is_known_missing(&self, level: Level, key: &str) -> bool {
        let misses = self.misses.read().unwrap_or_else(|e| e.into_inner());
        misses.get(&level).is_some_and(|m| m.contains(key))
    }

    fn mark_missing(&self, level: Level, key: String) {
        let mut misses = self.misses.write().unwrap_or_else(|e| e.into_inner());
        misses.entry(level).or_default().insert(key);
    }

    fn record_winner(&self, level: Level, source: &str) {
        let mut winners = self.winners.write().unwrap_or_else(|e| e.into_inner());
        winners.entry(level).or_insert_with(|| source.to_string());
    }

    /// Name of the first source that produced boundaries for `level`.
    pub fn winner(&self, level: Level) -> Option<String> {
        let winners = self.winners.read().unwrap_or_else(|e| e.into_inner());
        winners.get(&level).cloned()
    }

    pub fn len(&self, level: Level) -> usize {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        layers.get(&level).map_or(0, HashMap::len)
    }

    fn snapshot(&self, level: Level) -> Vec<(String, Boundary)> {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(String, Boundary)> = layers
            .get(&level)
            .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn level_lock(&self, level: Level) -> Arc<Mutex<()>> {
        let mut locks = self.level_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(level).or_default().clone()
    }
}

pub struct BoundaryProvider<'a> {
    sources: Vec<Box<dyn BoundarySource>>,
    cache: &'a BoundaryCache,
    retry: RetryPolicy,
    store: Option<PathBuf>,
}

impl<'a> BoundaryProvider<'a> {
    pub fn new(sources: Vec<Box<dyn BoundarySource>>, cache: &'a BoundaryCache) -> Self {
        Self {
            sources,
            cache,
            retry: RetryPolicy::default(),
            store: None,
        }
    }

    /// Builds the standard chain: persisted cache, local shapefiles, census
    /// archives, organisation service, public fallback service.
    pub fn from_config(config: &BoundaryConfig, cache: &'a BoundaryCache) -> Self {
        let client = http_client(config.timeout_secs);
        let mut sources: Vec<Box<dyn BoundarySource>> =
            vec![Box::new(LocalStoreSource::new(config.cache_dir.clone()))];

        for shp in &config.local_shapefiles {
            sources.push(Box::new(ShapefileSource::new(
                shp.level,
                shp.path.clone(),
                shp.key.clone(),
            )));
        }

        sources.push(Box::new(CensusArchiveSource::new(
            config.census_levels(),
            config.cache_dir.join("downloads"),
            client.clone(),
        )));

        if let Some(service) = &config.organization {
            sources.push(Box::new(FeatureServiceSource::new(
                "organization",
                service.clone(),
                client.clone(),
            )));
        }
        if let Some(service) = &config.fallback {
            sources.push(Box::new(FeatureServiceSource::new(
                "fallback",
                service.clone(),
                client,
            )));
        }

        let store = config.persist.then(|| config.cache_dir.clone());
        Self::new(sources, cache)
            .with_retry(config.retry.clone())
            .with_store(store)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Directory remote results are written to for reuse by later runs.
    pub fn with_store(mut self, store: Option<PathBuf>) -> Self {
        self.store = store;
        self
    }

    pub fn supports(&self, level: Level) -> bool {
        self.sources.iter().any(|s| s.supports(level))
    }

    pub fn cache(&self) -> &BoundaryCache {
        self.cache
    }

    pub fn resolve(&self, level: Level, key: &str) -> Option<Boundary> {
        self.resolve_many(level, std::iter::once(key)).remove(key)
    }

    /// Resolves every key it can; keys absent from the result are unresolved
    /// after the whole chain was tried.
    /// Sources serving `level`, with the one that first produced boundaries
    /// for it this run tried ahead of the rest.
    fn chain_for(&self, level: Level) -> Vec<&dyn BoundarySource> {
        let mut chain: Vec<&dyn BoundarySource> = self
            .sources
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| s.supports(level))
            .collect();
        if let Some(winner) = self.cache.winner(level) {
            if let Some(at) = chain.iter().position(|s| s.name() == winner) {
                let source = chain.remove(at);
                chain.insert(0, source);
            }
        }
        chain
    }

    pub fn resolve_many<'k>(
        &self,
        level: Level,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> HashMap<String, Boundary> {
        let wanted: BTreeSet<String> = keys.into_iter().map(str::to_string).collect();

        let lock = self.cache.level_lock(level);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut pending: BTreeSet<String> = wanted
            .iter()
            .filter(|k| self.cache.get(level, k).is_none() && !self.cache.is_known_missing(level, k))
            .cloned()
            .collect();

        let mut fetched_remote = false;
        for source in self.chain_for(level) {
            if pending.is_empty() {
                break;
            }
            let layer = match self.fetch_with_retry(source, level, &pending) {
                Ok(layer) => layer,
                Err(e) => {
                    warn!(source = source.name(), %level, "boundary source failed: {}", e);
                    continue;
                }
            };

            let mut found = 0;
            for (key, geometry) in layer {
                if pending.remove(&key) {
                    self.cache.insert(level, key, geometry);
                    found += 1;
                }
            }
            if found > 0 {
                debug!(source = source.name(), %level, found, "resolved boundaries");
                self.cache.record_winner(level, source.name());
                fetched_remote |= source.is_remote();
            }
        }

        if !pending.is_empty() {
            info!(%level, unresolved = pending.len(), "boundaries not found in any source");
        }
        for key in pending {
            self.cache.mark_missing(level, key);
        }

        if fetched_remote {
            if let Err(e) = self.persist(level) {
                warn!(%level, "could not persist boundary cache: {}", e);
            }
        }

        wanted
            .into_iter()
            .filter_map(|k| self.cache.get(level, &k).map(|g| (k, g)))
            .collect()
    }

    fn fetch_with_retry(
        &self,
        source: &dyn BoundarySource,
        level: Level,
        keys: &BTreeSet<String>,
    ) -> Result<BoundaryLayer, BoundaryError> {
        let attempts = if source.is_remote() {
            self.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match source.fetch(level, keys) {
                Ok(layer) => return Ok(layer),
                Err(BoundaryError::Unsupported { .. }) if attempt == 1 => {
                    return Ok(BoundaryLayer::new())
                }
                Err(e) if attempt < attempts => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(source = source.name(), attempt, ?backoff, "retrying after: {}", e);
                    std::thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn persist(&self, level: Level) -> Result<(), BoundaryError> {
        let Some(dir) = &self.store else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let path = LocalStoreSource::path_for(dir, level);

        // Earlier runs may have stored keys this run never asked for.
        let mut merged: BTreeMap<String, MultiPolygon<f64>> = if path.exists() {
            let file = fs::File::open(&path)?;
            read_geojson_layer(std::io::BufReader::new(file), &KeySpec::column(local::STORE_KEY))?
                .into_iter()
                .collect()
        } else {
            BTreeMap::new()
        };
        for (key, geometry) in self.cache.snapshot(level) {
            merged.entry(key).or_insert_with(|| geometry.as_ref().clone());
        }

        let features = merged
            .into_iter()
            .map(|(key, geometry)| {
                let mut properties = serde_json::Map::new();
                properties.insert(local::STORE_KEY.to_string(), serde_json::Value::String(key));
                geojson::Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(geojson::Value::from(&geometry))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();
        let collection = geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        };
        let tmp = path.with_extension("geojson.tmp");
        let bytes = serde_json::to_vec(&collection).map_err(|e| BoundaryError::GeoJson(e.to_string()))?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!(?path, "persisted boundary cache");
        Ok(())
    }
}

/// Boundaries held in memory. Used for tests and for callers that already
/// have geometry at hand.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    name: String,
    layers: HashMap<Level, BoundaryLayer>,
    remote: bool,
}

impl MemorySource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with(mut self, level: Level, key: &str, geometry: MultiPolygon<f64>) -> Self {
        self.layers
            .entry(level)
            .or_default()
            .insert(key.to_string(), geometry);
        self
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }
}

impl BoundarySource for MemorySource {
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
        Ok(keys
            .iter()
            .filter_map(|k| layer.get(k).map(|g| (k.clone(), g.clone())))
            .collect())
    }

    fn is_remote(&self) -> bool {
        self.remote
    }
}

pub fn http_client(timeout_secs: u64) -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("biomed-geojson/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new())
}
