use super::local::{read_shapefile_layer, LayerMemo};
use super::{BoundaryLayer, BoundarySource};
use crate::config::CensusLevelConfig;
use crate::errors::BoundaryError;
use crate::types::Level;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// National cartographic boundary archives (zipped shapefiles), one list of
/// vintage URLs per level tried in order.
pub struct CensusArchiveSource {
    levels: HashMap<Level, CensusLevelConfig>,
    work_dir: PathBuf,
    client: reqwest::blocking::Client,
    memo: LayerMemo,
}

impl CensusArchiveSource {
    pub fn new(
        levels: HashMap<Level, CensusLevelConfig>,
        work_dir: PathBuf,
        client: reqwest::blocking::Client,
    ) -> Self {
        Self {
            levels,
            work_dir,
            client,
            memo: LayerMemo::default(),
        }
    }

    fn download_layer(&self, level: Level, config: &CensusLevelConfig) -> Result<BoundaryLayer, BoundaryError> {
        let mut last_err = BoundaryError::Archive(format!("no archive URLs configured for {}", level));
        for url in &config.urls {
            info!(%level, "downloading {}", url);
            let result = self
                .download(url)
                .and_then(|bytes| extract_shapefile(&bytes, &self.work_dir.join(level.slug())))
                .and_then(|shp| read_shapefile_layer(&shp, &config.key));
            match result {
                Ok(layer) if !layer.is_empty() => {
                    info!(%level, features = layer.len(), "loaded boundaries from {}", url);
                    return Ok(layer);
                }
                Ok(_) => {
                    warn!(%level, "no keyed features in {}", url);
                    last_err = BoundaryError::Archive(format!("no keyed features in {}", url));
                }
                Err(e) => {
                    warn!(%level, "failed: {}", e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, BoundaryError> {
        let transport = |reason: String| BoundaryError::Transport {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport(e.to_string()))?;
        let bytes = response.bytes().map_err(|e| transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl BoundarySource for CensusArchiveSource {
    fn name(&self) -> &str {
        "census"
    }

    fn supports(&self, level: Level) -> bool {
        self.levels.get(&level).is_some_and(|c| !c.urls.is_empty())
    }

    fn fetch(&self, level: Level, keys: &BTreeSet<String>) -> Result<BoundaryLayer, BoundaryError> {
        let config = self.levels.get(&level).ok_or_else(|| BoundaryError::Unsupported {
            source_name: self.name().to_string(),
            level,
        })?;
        let layer = self
            .memo
            .get_or_load(level, || self.download_layer(level, config))?;
        Ok(config.key.select(&layer, keys))
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Unpacks a zipped shapefile into `dir` and returns the `.shp` path.
pub(crate) fn extract_shapefile(bytes: &[u8], dir: &Path) -> Result<PathBuf, BoundaryError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| BoundaryError::Archive(e.to_string()))?;

    let shp_name = archive
        .file_names()
        .find(|n| n.to_ascii_lowercase().ends_with(".shp"))
        .map(str::to_string)
        .ok_or_else(|| BoundaryError::Archive("no .shp file in archive".to_string()))?;

    fs::create_dir_all(dir)?;
    archive
        .extract(dir)
        .map_err(|e| BoundaryError::Archive(e.to_string()))?;
    Ok(dir.join(shp_name))
}
