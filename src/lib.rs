//! # Cesium Terrain On Demand
//!
//! CTOD serves Cesium quantized-mesh terrain tiles generated on the fly
//! from a Cloud Optimized GeoTIFF, instead of pre-baking a full tile
//! pyramid. A request for one tile reads the COG window under the tile
//! plus its eight neighbors (deduplicated across concurrent requests),
//! meshes them, stitches the shared edges so heights and normals agree
//! across tiles, encodes the result as quantized-mesh 1.0 with the
//! octvertexnormals extension and optionally caches it on disk.
//!
//! The [`core`] module holds the terrain pipeline; [`server`] is the
//! axum HTTP surface on top of it.

pub mod core;
pub mod server;

pub use crate::core::cog::{CogDataset, CogInfo, DatasetPool, Resampling, WindowSource};
pub use crate::core::error::{Error, Result};
pub use crate::core::factory::{FactoryConfig, TerrainFactory, TileArtifact, TileRequest};
pub use crate::core::meshing::{DetailTables, MeshingMethod};
pub use crate::core::tms::{GeoBounds, TileKey, TileMatrixSet};
pub use crate::core::window::ElevationGrid;
