use crate::boundary::{FeatureServiceConfig, KeySpec, ServiceLayer};
use crate::types::{Level, Reduction};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub aggregation: AggregationConfig,
    pub simplify: SimplifyConfig,
    pub boundaries: BoundaryConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InputConfig {
    pub data_csv: Option<PathBuf>,
    /// Prefix for output file names.
    pub dataset: String,
    /// Levels produced when none are requested explicitly.
    pub levels: Vec<Level>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            data_csv: None,
            dataset: "biomed".to_string(),
            levels: Level::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub pretty: bool,
    /// Upper bound on a single output file; tolerances widen until it fits.
    pub max_bytes: Option<u64>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("geojson_output"),
            pretty: false,
            max_bytes: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AggregationConfig {
    /// Reduction for generic numeric columns.
    pub default_reduction: Reduction,
    /// Column name to reduction for year and generic columns. Totals always
    /// keep their first value.
    pub overrides: HashMap<String, Reduction>,
}

impl AggregationConfig {
    /// Per-run overrides replace configured ones column by column.
    pub fn apply_overrides(&mut self, extra: impl IntoIterator<Item = (String, Reduction)>) {
        self.overrides.extend(extra);
    }
}

/// Parses a `COLUMN=rule` override as given on the command line.
pub fn parse_override(s: &str) -> Result<(String, Reduction), String> {
    let (column, rule) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected COLUMN=RULE, got '{}'", s))?;
    let column = column.trim();
    if column.is_empty() {
        return Err(format!("missing column name in '{}'", s));
    }
    Ok((column.to_string(), rule.parse()?))
}

/// Per-level simplification tolerance in degrees.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimplifyConfig {
    pub zip: f64,
    pub county: f64,
    pub chapter: f64,
    pub region: f64,
    pub division: f64,
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self {
            zip: 0.0005,
            county: 0.0005,
            chapter: 0.001,
            region: 0.005,
            division: 0.005,
        }
    }
}

impl SimplifyConfig {
    pub fn tolerance(&self, level: Level) -> f64 {
        match level {
            Level::Zip => self.zip,
            Level::County => self.county,
            Level::Chapter => self.chapter,
            Level::Region => self.region,
            Level::Division => self.division,
        }
    }

    /// No simplification at any level.
    pub fn exact() -> Self {
        Self {
            zip: 0.0,
            county: 0.0,
            chapter: 0.0,
            region: 0.0,
            division: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure, doubling each time.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(10) as u32;
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << exp))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CensusLevelConfig {
    pub urls: Vec<String>,
    pub key: KeySpec,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LocalShapefileConfig {
    pub level: Level,
    pub path: PathBuf,
    pub key: KeySpec,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BoundaryConfig {
    pub cache_dir: PathBuf,
    /// Write boundaries fetched remotely to `cache_dir` for later runs.
    pub persist: bool,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Level name to archive URLs and key columns.
    pub census: BTreeMap<String, CensusLevelConfig>,
    pub local_shapefiles: Vec<LocalShapefileConfig>,
    pub organization: Option<FeatureServiceConfig>,
    pub fallback: Option<FeatureServiceConfig>,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        let mut census = BTreeMap::new();
        census.insert(
            "county".to_string(),
            CensusLevelConfig {
                urls: vec![
                    "https://www2.census.gov/geo/tiger/GENZ2023/shp/cb_2023_us_county_500k.zip".to_string(),
                    "https://www2.census.gov/geo/tiger/GENZ2022/shp/cb_2022_us_county_500k.zip".to_string(),
                ],
                key: KeySpec::column("GEOID")
                    .padded(5)
                    .or_concat(&["STATEFP", "COUNTYFP"]),
            },
        );
        census.insert(
            "zip".to_string(),
            CensusLevelConfig {
                urls: vec![
                    "https://www2.census.gov/geo/tiger/GENZ2020/shp/cb_2020_us_zcta520_500k.zip".to_string(),
                    "https://www2.census.gov/geo/tiger/GENZ2019/shp/cb_2019_us_zcta510_500k.zip".to_string(),
                    "https://www2.census.gov/geo/tiger/GENZ2018/shp/cb_2018_us_zcta510_500k.zip".to_string(),
                ],
                key: KeySpec::column("ZCTA5CE20")
                    .padded(5)
                    .or_column("ZCTA5CE10")
                    .or_column("ZCTA5")
                    .or_column("GEOID20")
                    .or_column("GEOID10")
                    .or_column("GEOID")
                    .or_column("ZCTA5CE00"),
            },
        );

        let mut zip_layers = BTreeMap::new();
        zip_layers.insert(
            "zip".to_string(),
            ServiceLayer {
                layer: "0".to_string(),
                key: KeySpec::column("ZCTA5CE10").padded(5).or_column("ZIP_CODE"),
            },
        );

        Self {
            cache_dir: PathBuf::from(".boundary_cache"),
            persist: true,
            timeout_secs: 60,
            retry: RetryPolicy::default(),
            census,
            local_shapefiles: Vec::new(),
            organization: None,
            fallback: Some(FeatureServiceConfig {
                url: "https://services.arcgis.com/P3ePLMYs2RVChkJx/arcgis/rest/services/USA_ZIP_Code_Areas/FeatureServer".to_string(),
                layers: zip_layers,
            }),
        }
    }
}

impl BoundaryConfig {
    pub fn census_levels(&self) -> HashMap<Level, CensusLevelConfig> {
        self.census
            .iter()
            .filter_map(|(label, cfg)| Level::from_label(label).map(|level| (level, cfg.clone())))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            upload_dir: PathBuf::from("uploads"),
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Reads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("no config at {:?}; using defaults", path);
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_a_valid_config() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.input.dataset, "biomed");
        assert_eq!(config.input.levels.len(), 5);
        assert_eq!(config.aggregation.default_reduction, Reduction::Sum);
        assert!(config.boundaries.census_levels().contains_key(&Level::County));
    }

    #[test]
    fn parses_sections_and_overrides() {
        let config: AppConfig = toml::from_str(
            r#"
            [input]
            dataset = "drives"
            levels = ["county", "division"]

            [aggregation]
            default_reduction = "sum"
            overrides = { "Donors" = "max" }

            [simplify]
            division = 0.02

            [boundaries]
            cache_dir = "/tmp/boundaries"
            retry = { max_attempts = 2, base_backoff_ms = 10 }

            [[boundaries.local_shapefiles]]
            level = "chapter"
            path = "chapters.shp"
            key = { candidates = [["CHAPTER"], ["NAME"]], case_insensitive = true }

            [boundaries.organization]
            url = "https://example.org/FeatureServer"
            layers = { chapter = { layer = "2", key = { candidates = [["ECODE"]] } } }
            "#,
        )
        .unwrap();

        assert_eq!(config.input.levels, vec![Level::County, Level::Division]);
        assert_eq!(config.aggregation.overrides["Donors"], Reduction::Max);
        assert_eq!(config.simplify.tolerance(Level::Division), 0.02);
        assert_eq!(config.simplify.tolerance(Level::Zip), 0.0005);
        assert_eq!(config.boundaries.retry.max_attempts, 2);
        assert_eq!(config.boundaries.local_shapefiles[0].level, Level::Chapter);
        assert!(config.boundaries.local_shapefiles[0].key.case_insensitive);
        assert!(config.boundaries.organization.is_some());
    }

    #[test]
    fn run_overrides_replace_configured_rules() {
        let mut aggregation = AggregationConfig::default();
        aggregation.overrides.insert("Donors".to_string(), Reduction::Max);
        aggregation.overrides.insert("Drives".to_string(), Reduction::Sum);

        let extra = ["Donors=mean", "Units = FIRST"]
            .iter()
            .map(|s| parse_override(s).unwrap());
        aggregation.apply_overrides(extra);

        assert_eq!(aggregation.overrides["Donors"], Reduction::Mean);
        assert_eq!(aggregation.overrides["Units"], Reduction::First);
        assert_eq!(aggregation.overrides["Drives"], Reduction::Sum);
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        assert!(parse_override("Donors").is_err());
        assert!(parse_override("=max").is_err());
        assert!(parse_override("Donors=median").is_err());
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 100,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
    }
}
