//! Terrain core
//!
//! Everything between the HTTP surface and the COG bytes: tile matrix
//! math, windowed raster reads, the processed-window cache and request
//! coalescer, the terrain factory, mesh producers, edge stitching, the
//! quantized-mesh encoder and the on-disk tile cache.

pub mod cache;
pub mod coalescer;
pub mod cog;
pub mod disk_cache;
pub mod error;
pub mod factory;
pub mod meshing;
pub mod qmesh;
pub mod stitch;
pub mod tms;
pub mod window;
pub mod workers;

pub use error::{Error, Result};
