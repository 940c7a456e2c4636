//! Query parameters for the tile endpoints
//!
//! The dynamic endpoints take the full parameter set on every request;
//! the named-dataset endpoints get the same structure from the dataset
//! config file with query parameters ignored. `TileQuery` is the raw
//! deserialized form, `TileOptions` the validated one the factory takes.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::core::cog::Resampling;
use crate::core::error::{Error, Result};
use crate::core::meshing::{DetailTables, MeshingMethod};

/// Raw query parameters of `/tiles/dynamic/...` (and dataset options in
/// the config file, which use the same keys)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TileQuery {
    pub cog: Option<String>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub no_data: Option<f32>,
    pub resampling_method: Option<String>,
    pub meshing_method: Option<String>,
    pub skip_cache: Option<bool>,
    pub default_grid_size: Option<u32>,
    /// JSON object mapping zoom to grid size, e.g. `{"17": 30}`
    pub zoom_grid_sizes: Option<String>,
    pub default_max_error: Option<f32>,
    /// JSON object mapping zoom to max error in meters
    pub zoom_max_errors: Option<String>,
    /// Extension override, `-`-separated (normally negotiated from the
    /// Accept header)
    pub extensions: Option<String>,
}

/// Validated request options
#[derive(Debug, Clone)]
pub struct TileOptions {
    pub cog: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub resampling: Resampling,
    pub method: MeshingMethod,
    pub no_data: f32,
    pub skip_cache: bool,
    pub tables: DetailTables,
    pub extensions: Option<String>,
}

impl TileQuery {
    pub fn resolve(&self) -> Result<TileOptions> {
        let cog = self
            .cog
            .clone()
            .ok_or_else(|| Error::BadRequest("missing required parameter 'cog'".into()))?;
        let resampling = match self.resampling_method.as_deref() {
            Some(name) => Resampling::from_name(name)?,
            None => Resampling::None,
        };
        let method = match self.meshing_method.as_deref() {
            Some(name) => MeshingMethod::from_name(name)?,
            None => MeshingMethod::Grid,
        };

        let defaults = DetailTables::default();
        // An explicit default disables the built-in per-zoom table, so a
        // caller pinning the grid size gets it at every zoom
        let zoom_grid_sizes = match &self.zoom_grid_sizes {
            Some(json) => parse_zoom_table::<u32>(json, "zoomGridSizes")?,
            None if self.default_grid_size.is_some() => BTreeMap::new(),
            None => defaults.zoom_grid_sizes.clone(),
        };
        let zoom_max_errors = match &self.zoom_max_errors {
            Some(json) => parse_zoom_table::<f32>(json, "zoomMaxErrors")?,
            None if self.default_max_error.is_some() => BTreeMap::new(),
            None => defaults.zoom_max_errors.clone(),
        };

        Ok(TileOptions {
            cog,
            min_zoom: self.min_zoom.unwrap_or(1),
            max_zoom: self.max_zoom.unwrap_or(18),
            resampling,
            method,
            no_data: self.no_data.unwrap_or(0.0),
            skip_cache: self.skip_cache.unwrap_or(false),
            tables: DetailTables {
                default_grid_size: self.default_grid_size.unwrap_or(defaults.default_grid_size),
                zoom_grid_sizes,
                default_max_error: self.default_max_error.unwrap_or(defaults.default_max_error),
                zoom_max_errors,
            },
            extensions: self.extensions.clone(),
        })
    }
}

fn parse_zoom_table<T: serde::de::DeserializeOwned>(
    json: &str,
    name: &str,
) -> Result<BTreeMap<u8, T>> {
    let raw: BTreeMap<String, T> = serde_json::from_str(json)
        .map_err(|e| Error::BadRequest(format!("invalid {} JSON: {}", name, e)))?;
    let mut table = BTreeMap::new();
    for (zoom, value) in raw {
        let z: u8 = zoom
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid zoom '{}' in {}", zoom, name)))?;
        table.insert(z, value);
    }
    Ok(table)
}

/// Whether the octvertexnormals extension is enabled, from the Accept
/// header (`extensions=octvertexnormals` on a media type) or the
/// `extensions` query/config override (`-`-separated list).
pub fn octvertexnormals_enabled(accept: Option<&str>, overrides: Option<&str>) -> bool {
    if let Some(overrides) = overrides {
        if overrides.split('-').any(|e| e == "octvertexnormals") {
            return true;
        }
    }
    if let Some(accept) = accept {
        for content_type in accept.split(',') {
            for part in content_type.split(';') {
                if let Some(exts) = part.trim().strip_prefix("extensions=") {
                    if exts.split('-').any(|e| e == "octvertexnormals") {
                        return true;
                    }
                }
            }
        }
    }
    false
}
