//! layer.json generation
//!
//! Cesium bootstraps a terrain layer from a `layer.json` document that
//! lists the tile URL template, the enabled extensions and the available
//! tile ranges per zoom. Ranges are computed from the dataset's
//! geographic envelope; the dataset envelope itself is exposed in a
//! `cogBounds` extension so viewers can zoom to the data.

use serde_json::{json, Value};

use crate::core::tms::{GeoBounds, TileMatrixSet};
use crate::server::queries::TileOptions;

pub fn layer_json(
    tms: TileMatrixSet,
    cog_bounds: &GeoBounds,
    options: &TileOptions,
    dynamic: bool,
) -> Value {
    let tile_url = if dynamic {
        format!("{{z}}/{{x}}/{{y}}.terrain?v={{version}}&cog={}", options.cog)
    } else {
        "{z}/{x}/{y}.terrain?v={version}".to_string()
    };

    // Cesium always expects the full matrix at zoom 0 regardless of the
    // dataset envelope, so that level is emitted unclipped
    let mut available = vec![vec![json!({
        "startX": 0, "startY": 0, "endX": 1, "endY": 0
    })]];
    for z in 1..=options.max_zoom {
        let (start_x, start_y, end_x, end_y) = cesium_index_bounds(tms, cog_bounds, z);
        available.push(vec![json!({
            "startX": start_x, "startY": start_y, "endX": end_x, "endY": end_y
        })]);
    }

    json!({
        "tilejson": "2.1.0",
        "name": "CTOD",
        "description": "Cesium Terrain on Demand",
        "version": "1.1.0",
        "format": "quantized-mesh-1.0",
        "attribution": "",
        "schema": "tms",
        "extensions": ["octvertexnormals"],
        "tiles": [tile_url],
        "projection": "EPSG:4326",
        "bounds": [-180.0, -90.0, 180.0, 90.0],
        "cogBounds": [cog_bounds.west, cog_bounds.south, cog_bounds.east, cog_bounds.north],
        "available": available,
        "minzoom": 0,
        "maxzoom": options.max_zoom,
    })
}

/// Tile index range covering a geographic envelope at one zoom, in
/// Cesium's south-origin row numbering
fn cesium_index_bounds(
    tms: TileMatrixSet,
    bounds: &GeoBounds,
    z: u8,
) -> (u32, u32, u32, u32) {
    let eps = 1e-11;
    let west = bounds.west.max(-180.0);
    let south = bounds.south.max(-90.0);
    let east = bounds.east.min(180.0);
    let north = bounds.north.min(90.0);

    let (nw_x, nw_y) = tms.tile_for_lon_lat(west + eps, north - eps, z);
    let (se_x, se_y) = tms.tile_for_lon_lat(east - eps, south + eps, z);

    let min_x = nw_x.min(se_x);
    let max_x = nw_x.max(se_x);
    let min_y = nw_y.min(se_y);
    let max_y = nw_y.max(se_y);

    let (_, rows) = tms.matrix_size(z);
    (min_x, rows - 1 - max_y, max_x, rows - 1 - min_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::queries::TileQuery;

    fn options(max_zoom: u8) -> TileOptions {
        TileQuery {
            cog: Some("./test.tif".into()),
            max_zoom: Some(max_zoom),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    fn norway() -> GeoBounds {
        GeoBounds {
            west: 4.6,
            south: 57.9,
            east: 31.1,
            north: 71.2,
        }
    }

    #[test]
    fn test_layer_json_shape() {
        let doc = layer_json(TileMatrixSet::Wgs1984Quad, &norway(), &options(12), true);
        assert_eq!(doc["format"], "quantized-mesh-1.0");
        assert_eq!(doc["extensions"][0], "octvertexnormals");
        assert_eq!(doc["available"].as_array().unwrap().len(), 13);
        assert!(doc["tiles"][0]
            .as_str()
            .unwrap()
            .contains("cog=./test.tif"));
        let cog_bounds = doc["cogBounds"].as_array().unwrap();
        assert_eq!(cog_bounds[0], 4.6);
    }

    #[test]
    fn test_dataset_url_has_no_cog_param() {
        let doc = layer_json(TileMatrixSet::Wgs1984Quad, &norway(), &options(12), false);
        assert_eq!(doc["tiles"][0], "{z}/{x}/{y}.terrain?v={version}");
    }

    #[test]
    fn test_zoom_zero_is_always_full_matrix() {
        let doc = layer_json(TileMatrixSet::Wgs1984Quad, &norway(), &options(5), true);
        let zero = &doc["available"][0][0];
        assert_eq!(zero["startX"], 0);
        assert_eq!(zero["endX"], 1);
    }

    #[test]
    fn test_available_clips_to_dataset() {
        // Norway sits in the eastern hemisphere north of the equator, so
        // at z=1 (4x2 matrix) only column 2, Cesium row 1 is available
        let (sx, sy, ex, ey) = cesium_index_bounds(TileMatrixSet::Wgs1984Quad, &norway(), 1);
        assert_eq!((sx, ex), (2, 2));
        assert_eq!((sy, ey), (1, 1));
    }

    #[test]
    fn test_cesium_rows_are_south_origin() {
        // A dataset hugging the south pole must map to Cesium row 0
        let antarctic = GeoBounds {
            west: -10.0,
            south: -89.0,
            east: 10.0,
            north: -80.0,
        };
        let (_, sy, _, ey) = cesium_index_bounds(TileMatrixSet::Wgs1984Quad, &antarctic, 2);
        assert_eq!(sy, 0);
        assert!(ey <= 1);
    }
}
