//! Tile matrix set model
//!
//! Maps (z, x, y) tile indices to geographic bounds for the two tile
//! matrix sets Cesium clients use: the geographic WGS1984Quad (two root
//! tiles) and WebMercatorQuad (one root tile). The math must agree
//! bit-exactly with the client's tiling, so bounds are derived from the
//! matrix extents with plain IEEE arithmetic and no trigonometry on the
//! geographic set.

use std::f64::consts::PI;
use std::fmt;

use crate::core::error::{Error, Result};

/// Semi-major axis of the WGS84 ellipsoid in meters
pub const WGS84_A: f64 = 6378137.0;

/// Semi-minor axis of the WGS84 ellipsoid in meters
pub const WGS84_B: f64 = 6356752.3142451793;

/// Extent of the Web Mercator square in meters from the origin
const MERCATOR_EXTENT: f64 = 20037508.342789244;

/// Supported tile matrix sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileMatrixSet {
    /// Geographic CRS84 quad: 2x1 tiles at zoom 0, degrees
    Wgs1984Quad,
    /// Web Mercator quad: 1x1 tile at zoom 0, EPSG:3857 meters
    WebMercatorQuad,
}

impl TileMatrixSet {
    /// Look up a TMS by its OGC identifier
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "WGS1984Quad" | "CesiumTerrainQuad" | "EPSG:4326" => Ok(Self::Wgs1984Quad),
            "WebMercatorQuad" | "EPSG:3857" => Ok(Self::WebMercatorQuad),
            other => Err(Error::NoSuchTms(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Wgs1984Quad => "WGS1984Quad",
            Self::WebMercatorQuad => "WebMercatorQuad",
        }
    }

    /// Number of tile columns and rows at a zoom level
    pub fn matrix_size(&self, z: u8) -> (u32, u32) {
        match self {
            Self::Wgs1984Quad => (2u32 << z, 1u32 << z),
            Self::WebMercatorQuad => (1u32 << z, 1u32 << z),
        }
    }

    /// Geographic bounds of a tile in degrees
    pub fn bounds(&self, z: u8, x: u32, y: u32) -> Result<GeoBounds> {
        let (cols, rows) = self.matrix_size(z);
        if x >= cols || y >= rows {
            return Err(Error::TileOutOfRange(format!(
                "{}/{}/{} exceeds {}x{} matrix",
                z, x, y, cols, rows
            )));
        }
        match self {
            Self::Wgs1984Quad => {
                let span = 180.0 / rows as f64;
                Ok(GeoBounds {
                    west: -180.0 + x as f64 * span,
                    south: 90.0 - (y + 1) as f64 * span,
                    east: -180.0 + (x + 1) as f64 * span,
                    north: 90.0 - y as f64 * span,
                })
            }
            Self::WebMercatorQuad => {
                let span = 2.0 * MERCATOR_EXTENT / cols as f64;
                let native = NativeBounds {
                    west: -MERCATOR_EXTENT + x as f64 * span,
                    south: MERCATOR_EXTENT - (y + 1) as f64 * span,
                    east: -MERCATOR_EXTENT + (x + 1) as f64 * span,
                    north: MERCATOR_EXTENT - y as f64 * span,
                };
                Ok(native.to_geographic())
            }
        }
    }

    /// Bounds of a tile in the TMS's native units (degrees or meters)
    pub fn native_bounds(&self, z: u8, x: u32, y: u32) -> Result<NativeBounds> {
        match self {
            Self::Wgs1984Quad => {
                let b = self.bounds(z, x, y)?;
                Ok(NativeBounds {
                    west: b.west,
                    south: b.south,
                    east: b.east,
                    north: b.north,
                })
            }
            Self::WebMercatorQuad => {
                let (cols, rows) = self.matrix_size(z);
                if x >= cols || y >= rows {
                    return Err(Error::TileOutOfRange(format!(
                        "{}/{}/{} exceeds {}x{} matrix",
                        z, x, y, cols, rows
                    )));
                }
                let span = 2.0 * MERCATOR_EXTENT / cols as f64;
                Ok(NativeBounds {
                    west: -MERCATOR_EXTENT + x as f64 * span,
                    south: MERCATOR_EXTENT - (y + 1) as f64 * span,
                    east: -MERCATOR_EXTENT + (x + 1) as f64 * span,
                    north: MERCATOR_EXTENT - y as f64 * span,
                })
            }
        }
    }

    /// Tile containing a geographic point at a zoom level
    pub fn tile_for_lon_lat(&self, lon: f64, lat: f64, z: u8) -> (u32, u32) {
        let (cols, rows) = self.matrix_size(z);
        let (fx, fy) = match self {
            Self::Wgs1984Quad => ((lon + 180.0) / 360.0, (90.0 - lat) / 180.0),
            Self::WebMercatorQuad => {
                let x = lon.to_radians() * WGS84_A;
                let y = WGS84_A * ((PI / 4.0 + lat.to_radians() / 2.0).tan()).ln();
                (
                    (x + MERCATOR_EXTENT) / (2.0 * MERCATOR_EXTENT),
                    (MERCATOR_EXTENT - y) / (2.0 * MERCATOR_EXTENT),
                )
            }
        };
        let x = ((fx * cols as f64) as i64).clamp(0, cols as i64 - 1) as u32;
        let y = ((fy * rows as f64) as i64).clamp(0, rows as i64 - 1) as u32;
        (x, y)
    }

    /// Convert an incoming Cesium tile index, which is flipped on the Y
    /// axis, to the matrix index used internally.
    pub fn tile_index_from_cesium(&self, z: u8, x: u32, y: u32) -> (u32, u32) {
        let (_, rows) = self.matrix_size(z);
        (x, rows - 1 - y)
    }
}

impl fmt::Display for TileMatrixSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Geographic bounds in degrees, west < east, south < north
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBounds {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.west < other.east
            && self.east > other.west
            && self.south < other.north
            && self.north > other.south
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.west && lon <= self.east && lat >= self.south && lat <= self.north
    }
}

/// Bounds in a TMS's native units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl NativeBounds {
    /// Inverse-mercator a native EPSG:3857 box to degrees
    fn to_geographic(&self) -> GeoBounds {
        let lon = |x: f64| (x / WGS84_A).to_degrees();
        let lat = |y: f64| (2.0 * (y / WGS84_A).exp().atan() - PI / 2.0).to_degrees();
        GeoBounds {
            west: lon(self.west),
            south: lat(self.south),
            east: lon(self.east),
            north: lat(self.north),
        }
    }
}

/// A tile address within a tile matrix set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// The eight compass directions from a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// The direction a neighbor sees this tile from
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::NorthEast => Direction::SouthWest,
            Direction::East => Direction::West,
            Direction::SouthEast => Direction::NorthWest,
            Direction::South => Direction::North,
            Direction::SouthWest => Direction::NorthEast,
            Direction::West => Direction::East,
            Direction::NorthWest => Direction::SouthEast,
        }
    }

    /// Tile index offset, with +y pointing south (matrix row order)
    fn offset(&self) -> (i64, i64) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }
}

/// Neighbor tile index in a direction, or None when it falls off the matrix
pub fn neighbor(tms: TileMatrixSet, tile: TileKey, dir: Direction) -> Option<TileKey> {
    let (cols, rows) = tms.matrix_size(tile.z);
    let (dx, dy) = dir.offset();
    let nx = tile.x as i64 + dx;
    let ny = tile.y as i64 + dy;
    if nx < 0 || ny < 0 || nx >= cols as i64 || ny >= rows as i64 {
        return None;
    }
    Some(TileKey::new(tile.z, nx as u32, ny as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgs84_root_tiles() {
        let tms = TileMatrixSet::Wgs1984Quad;
        assert_eq!(tms.matrix_size(0), (2, 1));
        let west = tms.bounds(0, 0, 0).unwrap();
        assert_eq!(west.west, -180.0);
        assert_eq!(west.east, 0.0);
        assert_eq!(west.north, 90.0);
        assert_eq!(west.south, -90.0);
        let east = tms.bounds(0, 1, 0).unwrap();
        assert_eq!(east.west, 0.0);
        assert_eq!(east.east, 180.0);
    }

    #[test]
    fn test_webmercator_root_tile() {
        let tms = TileMatrixSet::WebMercatorQuad;
        assert_eq!(tms.matrix_size(0), (1, 1));
        let b = tms.bounds(0, 0, 0).unwrap();
        assert!((b.west - -180.0).abs() < 1e-9);
        assert!((b.east - 180.0).abs() < 1e-9);
        assert!((b.north - 85.0511287798066).abs() < 1e-6);
    }

    #[test]
    fn test_tile_out_of_range() {
        let tms = TileMatrixSet::Wgs1984Quad;
        assert!(tms.bounds(0, 2, 0).is_err());
        assert!(tms.bounds(3, 0, 8).is_err());
    }

    #[test]
    fn test_cesium_y_flip_roundtrip() {
        let tms = TileMatrixSet::Wgs1984Quad;
        // At z=2 the matrix is 8x4, Cesium row 0 is the southernmost
        let (x, y) = tms.tile_index_from_cesium(2, 3, 0);
        assert_eq!((x, y), (3, 3));
        let (x, y) = tms.tile_index_from_cesium(2, 3, 3);
        assert_eq!((x, y), (3, 0));
    }

    #[test]
    fn test_tile_for_lon_lat_inverts_bounds() {
        let tms = TileMatrixSet::Wgs1984Quad;
        for &(z, x, y) in &[(3u8, 4u32, 2u32), (5, 17, 9), (10, 1023, 400)] {
            let b = tms.bounds(z, x, y).unwrap();
            let lon = (b.west + b.east) / 2.0;
            let lat = (b.south + b.north) / 2.0;
            assert_eq!(tms.tile_for_lon_lat(lon, lat, z), (x, y));
        }
    }

    #[test]
    fn test_neighbors_at_matrix_edges() {
        let tms = TileMatrixSet::Wgs1984Quad;
        let corner = TileKey::new(1, 0, 0);
        assert!(neighbor(tms, corner, Direction::North).is_none());
        assert!(neighbor(tms, corner, Direction::West).is_none());
        assert_eq!(
            neighbor(tms, corner, Direction::SouthEast),
            Some(TileKey::new(1, 1, 1))
        );
        let count = Direction::ALL
            .iter()
            .filter(|d| neighbor(tms, corner, **d).is_some())
            .count();
        assert_eq!(count, 3);
        // Walking back along the opposite direction returns home
        for dir in Direction::ALL {
            if let Some(n) = neighbor(tms, corner, dir) {
                assert_eq!(neighbor(tms, n, dir.opposite()), Some(corner));
            }
        }
    }

    #[test]
    fn test_neighbor_bounds_share_edges() {
        let tms = TileMatrixSet::Wgs1984Quad;
        let t = TileKey::new(4, 7, 5);
        let b = tms.bounds(t.z, t.x, t.y).unwrap();
        let e = neighbor(tms, t, Direction::East).unwrap();
        let eb = tms.bounds(e.z, e.x, e.y).unwrap();
        assert_eq!(b.east, eb.west);
        let n = neighbor(tms, t, Direction::North).unwrap();
        let nb = tms.bounds(n.z, n.x, n.y).unwrap();
        assert_eq!(b.north, nb.south);
    }

    #[test]
    fn test_tile_key_ordering() {
        let a = TileKey::new(2, 1, 1);
        let b = TileKey::new(3, 0, 0);
        let c = TileKey::new(3, 0, 1);
        assert!(a < b && b < c);
    }
}
