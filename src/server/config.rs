//! Dataset configuration
//!
//! Named datasets are declared in a JSON file:
//!
//! ```json
//! {
//!   "datasets": [
//!     { "name": "norway", "options": { "cog": "./norway.tif", "minZoom": 5 } }
//!   ]
//! }
//! ```
//!
//! The option keys are the same as the dynamic endpoint's query
//! parameters; `zoomGridSizes`/`zoomMaxErrors` may be given either as
//! JSON objects or as strings holding JSON objects.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::core::error::{Error, Result};
use crate::server::queries::TileQuery;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    datasets: Vec<ConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    name: String,
    #[serde(default)]
    options: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct DatasetConfig {
    datasets: HashMap<String, TileQuery>,
}

impl DatasetConfig {
    /// Load the config file. A missing file yields an empty config (the
    /// server still serves the dynamic endpoint); a malformed one is a
    /// startup error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "dataset config not found, no named datasets");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(raw)
            .map_err(|e| Error::Internal(format!("invalid dataset config: {}", e)))?;
        let mut datasets = HashMap::new();
        for entry in file.datasets {
            if entry.name.is_empty() {
                return Err(Error::Internal("dataset with empty name".into()));
            }
            let query = parse_options(entry.options)
                .map_err(|e| Error::Internal(format!("dataset '{}': {}", entry.name, e)))?;
            datasets.insert(entry.name, query);
        }
        Ok(Self { datasets })
    }

    pub fn get(&self, name: &str) -> Option<&TileQuery> {
        self.datasets.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.datasets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// Options in the config file may spell the zoom tables as objects;
/// query deserialization expects strings, so stringify them first.
fn parse_options(mut options: serde_json::Value) -> std::result::Result<TileQuery, String> {
    if let Some(map) = options.as_object_mut() {
        for key in ["zoomGridSizes", "zoomMaxErrors"] {
            if let Some(value) = map.get(key) {
                if value.is_object() {
                    let stringified = serde_json::Value::String(value.to_string());
                    map.insert(key.to_string(), stringified);
                }
            }
        }
    }
    serde_json::from_value(options).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = DatasetConfig::parse(
            r#"{
                "datasets": [
                    {
                        "name": "norway",
                        "options": {
                            "cog": "./norway.tif",
                            "minZoom": 5,
                            "maxZoom": 16,
                            "meshingMethod": "martini",
                            "zoomMaxErrors": {"15": 2.5},
                            "noData": -9999
                        }
                    },
                    { "name": "bare", "options": { "cog": "./bare.tif" } }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.len(), 2);
        assert_eq!(config.names(), vec!["bare", "norway"]);
        let norway = config.get("norway").unwrap();
        assert_eq!(norway.min_zoom, Some(5));
        assert_eq!(norway.no_data, Some(-9999.0));
        let options = norway.resolve().unwrap();
        assert_eq!(options.tables.zoom_max_errors.get(&15), Some(&2.5));
        assert!(config.get("sweden").is_none());
    }

    #[test]
    fn test_zoom_table_as_string_also_accepted() {
        let config = DatasetConfig::parse(
            r#"{"datasets": [{"name": "a", "options": {
                "cog": "a.tif", "zoomGridSizes": "{\"12\": 18}"
            }}]}"#,
        )
        .unwrap();
        let options = config.get("a").unwrap().resolve().unwrap();
        assert_eq!(options.tables.zoom_grid_sizes.get(&12), Some(&18));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        assert!(DatasetConfig::parse("{").is_err());
        assert!(DatasetConfig::parse(r#"{"datasets": [{"options": {}}]}"#).is_err());
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let config = DatasetConfig::load(Path::new("/nonexistent/datasets.json")).unwrap();
        assert!(config.is_empty());
    }
}
