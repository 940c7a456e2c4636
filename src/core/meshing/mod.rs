//! Mesh producers
//!
//! Turns an elevation grid into a triangulated mesh. Three producers are
//! selectable by name: a structured grid, a Martini right-triangulated
//! irregular network and a Delatin-style greedy Delaunay refinement. All
//! three emit the same [`Mesh`] type; dispatch is a tagged variant over
//! [`MeshingMethod`] rather than dynamic plug-ins.

mod delatin;
mod grid;
mod martini;
pub mod normals;

use std::collections::BTreeMap;

use crate::core::error::{Error, Result};
use crate::core::tms::GeoBounds;
use crate::core::window::ElevationGrid;

/// Meshing algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshingMethod {
    Grid,
    Martini,
    Delatin,
}

impl MeshingMethod {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "grid" | "default" => Ok(Self::Grid),
            "martini" => Ok(Self::Martini),
            "delatin" => Ok(Self::Delatin),
            other => Err(Error::BadRequest(format!(
                "unknown meshing method '{}', expected grid, martini or delatin",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::Martini => "martini",
            Self::Delatin => "delatin",
        }
    }

    /// Window size the producer wants from the COG reader. Martini
    /// operates on `(2^k + 1)` samples per side.
    pub fn window_size(&self) -> usize {
        match self {
            Self::Grid | Self::Delatin => 256,
            Self::Martini => 257,
        }
    }
}

/// Per-zoom detail configuration, as supplied by query parameters or the
/// dataset config. The grid producer reads grid sizes; Martini and Delatin
/// read max errors.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailTables {
    pub default_grid_size: u32,
    pub zoom_grid_sizes: BTreeMap<u8, u32>,
    pub default_max_error: f32,
    pub zoom_max_errors: BTreeMap<u8, f32>,
}

impl Default for DetailTables {
    fn default() -> Self {
        let zoom_grid_sizes = [
            (15u8, 25u32),
            (16, 25),
            (17, 30),
            (18, 35),
            (19, 35),
            (20, 35),
            (21, 35),
            (22, 35),
        ]
        .into_iter()
        .collect();
        let zoom_max_errors = [
            (15u8, 8.0f32),
            (16, 5.0),
            (17, 3.0),
            (18, 2.0),
            (19, 1.0),
            (20, 0.5),
            (21, 0.3),
            (22, 0.1),
        ]
        .into_iter()
        .collect();
        Self {
            default_grid_size: 20,
            zoom_grid_sizes,
            default_max_error: 4.0,
            zoom_max_errors,
        }
    }
}

impl DetailTables {
    /// Resolve the detail knob for one zoom level
    pub fn resolve(&self, method: MeshingMethod, z: u8) -> MeshDetail {
        match method {
            MeshingMethod::Grid => {
                let n = self.zoom_grid_sizes.get(&z).copied().unwrap_or(self.default_grid_size);
                // A grid denser than the window itself adds nothing
                MeshDetail::GridSize(n.min(255))
            }
            MeshingMethod::Martini | MeshingMethod::Delatin => {
                let e = self
                    .zoom_max_errors
                    .get(&z)
                    .copied()
                    .unwrap_or(self.default_max_error);
                MeshDetail::max_error(e)
            }
        }
    }

    /// Canonical bytes for dataset fingerprinting
    pub fn digest(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.default_grid_size.to_le_bytes());
        for (z, n) in &self.zoom_grid_sizes {
            out.push(*z);
            out.extend_from_slice(&n.to_le_bytes());
        }
        out.extend_from_slice(&self.default_max_error.to_bits().to_le_bytes());
        for (z, e) in &self.zoom_max_errors {
            out.push(*z);
            out.extend_from_slice(&e.to_bits().to_le_bytes());
        }
        out
    }
}

/// Resolved detail for one window: either a grid edge count or a maximum
/// triangulation error in meters (stored as bits to stay hashable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshDetail {
    GridSize(u32),
    MaxError(u32),
}

impl MeshDetail {
    pub fn max_error(meters: f32) -> Self {
        Self::MaxError(meters.to_bits())
    }

    pub fn max_error_meters(&self) -> f32 {
        match self {
            Self::GridSize(_) => 0.0,
            Self::MaxError(bits) => f32::from_bits(*bits),
        }
    }
}

/// Meshing method plus its resolved detail, part of the window key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshParams {
    pub method: MeshingMethod,
    pub detail: MeshDetail,
}

impl MeshParams {
    pub fn new(method: MeshingMethod, detail: MeshDetail) -> Self {
        Self { method, detail }
    }

    pub fn with_defaults(method: MeshingMethod) -> Self {
        let tables = DetailTables::default();
        Self {
            method,
            detail: match method {
                MeshingMethod::Grid => MeshDetail::GridSize(tables.default_grid_size),
                _ => MeshDetail::max_error(tables.default_max_error),
            },
        }
    }
}

/// The four tile edges, used for boundary vertex bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    West,
    South,
    East,
    North,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::West, Side::South, Side::East, Side::North];
}

/// A boundary vertex of a mesh: its parameter along the edge in [0, 1]
/// and its index into the vertex arrays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeVertex {
    pub param: f64,
    pub index: u32,
}

/// A triangulated tile mesh in normalized tile coordinates.
///
/// Positions are `(u, v, h)` with `u` growing east and `v` growing north,
/// both in [0, 1] across the tile; `h` is meters. Normals are unit vectors
/// in the ECEF frame and are empty when the client did not ask for the
/// octvertexnormals extension.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub positions: Vec<[f64; 3]>,
    pub triangles: Vec<[u32; 3]>,
    pub normals: Vec<[f32; 3]>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Ordered boundary vertex list for one edge. Corner vertices appear
    /// in both adjacent edges' lists.
    pub fn edge(&self, side: Side) -> Vec<EdgeVertex> {
        let mut out = Vec::new();
        for (i, p) in self.positions.iter().enumerate() {
            let on_edge = match side {
                Side::West => p[0] == 0.0,
                Side::East => p[0] == 1.0,
                Side::South => p[1] == 0.0,
                Side::North => p[1] == 1.0,
            };
            if on_edge {
                let param = match side {
                    Side::West | Side::East => p[1],
                    Side::South | Side::North => p[0],
                };
                out.push(EdgeVertex {
                    param,
                    index: i as u32,
                });
            }
        }
        out.sort_by(|a, b| a.param.total_cmp(&b.param));
        out
    }
}

/// Mesh an elevation window with the selected producer.
///
/// `with_normals` controls whether per-vertex normals are computed; they
/// are derived from area-weighted face normals in ECEF and renormalized.
pub fn produce(grid: &ElevationGrid, params: &MeshParams, with_normals: bool) -> Result<Mesh> {
    if grid.out_of_bounds || grid.width < 2 || grid.height < 2 {
        return Err(Error::MeshingFailed(format!(
            "window of {}x{} samples cannot be meshed",
            grid.width, grid.height
        )));
    }
    let mut mesh = match params.method {
        MeshingMethod::Grid => {
            let n = match params.detail {
                MeshDetail::GridSize(n) => n as usize,
                MeshDetail::MaxError(_) => {
                    return Err(Error::MeshingFailed(
                        "grid meshing requires a grid size, not a max error".into(),
                    ))
                }
            };
            grid::mesh(grid, n)?
        }
        MeshingMethod::Martini => martini::mesh(grid, params.detail.max_error_meters())?,
        MeshingMethod::Delatin => delatin::mesh(grid, params.detail.max_error_meters())?,
    };
    if with_normals {
        mesh.normals = normals::vertex_normals(&mesh.positions, &mesh.triangles, &grid.bounds);
    }
    Ok(mesh)
}

/// The deterministic mesh for a tile outside the dataset: four corner
/// vertices at height zero, two triangles, geodetic surface normals.
pub fn empty_tile_mesh(bounds: &GeoBounds, with_normals: bool) -> Mesh {
    let positions = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [1.0, 1.0, 0.0],
    ];
    let triangles = vec![[0, 1, 2], [2, 1, 3]];
    let normals = if with_normals {
        positions
            .iter()
            .map(|p| {
                let lon = bounds.west + p[0] * bounds.width();
                let lat = bounds.south + p[1] * bounds.height();
                normals::geodetic_surface_normal(lon, lat)
            })
            .collect()
    } else {
        Vec::new()
    };
    Mesh {
        positions,
        triangles,
        normals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cog::Resampling;

    fn bounds() -> GeoBounds {
        GeoBounds {
            west: 10.0,
            south: 50.0,
            east: 10.1,
            north: 50.1,
        }
    }

    fn flat_grid(n: usize) -> ElevationGrid {
        ElevationGrid::new(
            n,
            n,
            vec![100.0; n * n],
            bounds(),
            Resampling::Bilinear,
            vec![false; n * n],
        )
    }

    #[test]
    fn test_detail_tables_resolve() {
        let tables = DetailTables::default();
        assert_eq!(
            tables.resolve(MeshingMethod::Grid, 17),
            MeshDetail::GridSize(30)
        );
        assert_eq!(
            tables.resolve(MeshingMethod::Grid, 3),
            MeshDetail::GridSize(20)
        );
        assert_eq!(
            tables.resolve(MeshingMethod::Martini, 18).max_error_meters(),
            2.0
        );
        assert_eq!(
            tables.resolve(MeshingMethod::Delatin, 3).max_error_meters(),
            4.0
        );
    }

    #[test]
    fn test_method_names_roundtrip() {
        for m in [
            MeshingMethod::Grid,
            MeshingMethod::Martini,
            MeshingMethod::Delatin,
        ] {
            assert_eq!(MeshingMethod::from_name(m.name()).unwrap(), m);
        }
        assert!(MeshingMethod::from_name("voronoi").is_err());
    }

    #[test]
    fn test_empty_tile_mesh_shape() {
        let mesh = empty_tile_mesh(&bounds(), true);
        assert_eq!(mesh.positions.len(), 4);
        assert_eq!(mesh.triangles.len(), 2);
        assert_eq!(mesh.normals.len(), 4);
        for n in &mesh.normals {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            assert!((len - 1.0).abs() < 1e-5);
        }
        for p in &mesh.positions {
            assert_eq!(p[2], 0.0);
        }
    }

    #[test]
    fn test_edge_lists_cover_boundary_once() {
        let mesh = produce(
            &flat_grid(256),
            &MeshParams::new(MeshingMethod::Grid, MeshDetail::GridSize(4)),
            false,
        )
        .unwrap();
        let west = mesh.edge(Side::West);
        let north = mesh.edge(Side::North);
        assert_eq!(west.len(), 5);
        assert_eq!(north.len(), 5);
        // Corners belong to exactly two edge lists
        let nw = west.last().unwrap().index;
        assert_eq!(north.first().unwrap().index, nw);
        // Params are sorted ascending
        for w in west.windows(2) {
            assert!(w[0].param < w[1].param);
        }
    }

    #[test]
    fn test_mesh_rejects_empty_window() {
        let empty = ElevationGrid::empty(bounds(), Resampling::None);
        let params = MeshParams::with_defaults(MeshingMethod::Grid);
        assert!(produce(&empty, &params, false).is_err());
    }
}
