//! Processed-window data model
//!
//! An [`ElevationGrid`] is the decoded, resampled elevation raster for one
//! tile-sized window of a COG. Grids are immutable after creation and
//! shared by `Arc` between the window cache, the coalescer and any number
//! of in-flight tile requests. A [`WindowKey`] identifies one processed
//! grid uniquely; it carries every parameter that influences the grid's
//! content so differently-configured requests never alias in the cache.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::core::cog::Resampling;
use crate::core::meshing::{DetailTables, MeshParams};
use crate::core::tms::{GeoBounds, TileKey, TileMatrixSet};

/// Stable hash of a COG path plus its dataset-level options.
///
/// Two datasets with the same path but different NoData replacement or
/// meshing detail must not share cache entries or disk-cache paths, so
/// those options are folded into the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetFingerprint([u8; 32]);

impl DatasetFingerprint {
    pub fn compute(cog: &str, no_data: f32, tables: &DetailTables) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(cog.as_bytes());
        hasher.update(no_data.to_bits().to_le_bytes());
        hasher.update(tables.digest());
        Self(hasher.finalize().into())
    }

    /// Lowercase hex, used as the top directory of the disk cache
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for DatasetFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First eight bytes are plenty for log lines
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Identifies a processed elevation grid uniquely
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub fingerprint: DatasetFingerprint,
    pub tms: TileMatrixSet,
    pub tile: TileKey,
    pub resampling: Resampling,
    /// NoData replacement value, stored as bits so the key stays `Eq`
    no_data_bits: u32,
    pub params: MeshParams,
}

impl WindowKey {
    pub fn new(
        fingerprint: DatasetFingerprint,
        tms: TileMatrixSet,
        tile: TileKey,
        resampling: Resampling,
        no_data: f32,
        params: MeshParams,
    ) -> Self {
        Self {
            fingerprint,
            tms,
            tile,
            resampling,
            no_data_bits: no_data.to_bits(),
            params,
        }
    }

    pub fn no_data(&self) -> f32 {
        f32::from_bits(self.no_data_bits)
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.fingerprint, self.tms, self.tile)
    }
}

/// A dense elevation raster covering one tile window.
///
/// Row 0 is the northern edge; heights are meters in the vertical datum of
/// the source. NoData cells have already been replaced with the configured
/// constant, and `nodata_mask` records which ones were.
#[derive(Debug, Clone)]
pub struct ElevationGrid {
    pub width: usize,
    pub height: usize,
    pub heights: Vec<f32>,
    pub bounds: GeoBounds,
    pub resampling: Resampling,
    pub nodata_mask: Vec<bool>,
    /// Set when the window lies fully outside the dataset footprint;
    /// such grids carry no samples and render as empty tiles.
    pub out_of_bounds: bool,
}

impl ElevationGrid {
    pub fn new(
        width: usize,
        height: usize,
        heights: Vec<f32>,
        bounds: GeoBounds,
        resampling: Resampling,
        nodata_mask: Vec<bool>,
    ) -> Self {
        debug_assert_eq!(heights.len(), width * height);
        debug_assert_eq!(nodata_mask.len(), width * height);
        Self {
            width,
            height,
            heights,
            bounds,
            resampling,
            nodata_mask,
            out_of_bounds: false,
        }
    }

    /// A zero-sample grid marking a window outside the dataset
    pub fn empty(bounds: GeoBounds, resampling: Resampling) -> Self {
        Self {
            width: 0,
            height: 0,
            heights: Vec::new(),
            bounds,
            resampling,
            nodata_mask: Vec::new(),
            out_of_bounds: true,
        }
    }

    /// Height at a grid cell, row 0 = north
    #[inline]
    pub fn at(&self, col: usize, row: usize) -> f32 {
        self.heights[row * self.width + col]
    }

    /// Bilinear sample at fractional grid coordinates, clamped to the
    /// raster; (0, 0) is the north-west cell center.
    pub fn sample(&self, col: f64, row: f64) -> f32 {
        let max_c = (self.width - 1) as f64;
        let max_r = (self.height - 1) as f64;
        let c = col.clamp(0.0, max_c);
        let r = row.clamp(0.0, max_r);
        let c0 = c.floor() as usize;
        let r0 = r.floor() as usize;
        let c1 = (c0 + 1).min(self.width - 1);
        let r1 = (r0 + 1).min(self.height - 1);
        let fc = (c - c0 as f64) as f32;
        let fr = (r - r0 as f64) as f32;
        let top = self.at(c0, r0) * (1.0 - fc) + self.at(c1, r0) * fc;
        let bot = self.at(c0, r1) * (1.0 - fc) + self.at(c1, r1) * fc;
        top * (1.0 - fr) + bot * fr
    }

    /// Approximate heap footprint, used for LRU byte accounting
    pub fn size_bytes(&self) -> usize {
        self.heights.len() * std::mem::size_of::<f32>() + self.nodata_mask.len()
    }
}
