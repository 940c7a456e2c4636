//! Edge stitcher
//!
//! Reconciles a tile mesh with its eight neighbors so that heights and
//! oct-encoded normals agree exactly along shared edges. Boundary
//! vertices are matched by their axis parameter quantized to 1/32768,
//! the quantized-mesh on-wire resolution along an edge:
//!
//! - a parameter present on both sides gets the average height and the
//!   renormalized average normal on both tiles' runs, which are computed
//!   from the same pair of pre-stitch values and therefore agree;
//! - a parameter present only on the neighbor side gets a new self vertex
//!   inserted at that position carrying the neighbor's height and normal,
//!   which is exactly the value the neighbor's own run keeps there;
//! - corners average across all present contributors, the same set in
//!   every participating tile's run.
//!
//! Inserting a boundary vertex splits the single triangle adjacent to
//! that boundary edge in two; interior triangles and interior vertex
//! normals are never touched.

use std::collections::HashMap;

use crate::core::meshing::{normals, Mesh, Side};
use crate::core::tms::{Direction, GeoBounds};

/// Quantization of edge axis parameters
const PARAM_STEPS: f64 = 32768.0;

/// The up-to-eight neighbor meshes of a tile
#[derive(Default)]
pub struct NeighborSet {
    slots: [Option<Mesh>; 8],
}

impl NeighborSet {
    pub fn set(&mut self, dir: Direction, mesh: Mesh) {
        self.slots[slot(dir)] = Some(mesh);
    }

    pub fn get(&self, dir: Direction) -> Option<&Mesh> {
        self.slots[slot(dir)].as_ref()
    }

    pub fn present(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn slot(dir: Direction) -> usize {
    Direction::ALL.iter().position(|d| *d == dir).unwrap()
}

#[inline]
fn bucket(param: f64) -> u32 {
    (param * PARAM_STEPS).round() as u32
}

/// Stitch `mesh` against its neighbors in place.
///
/// `bounds` places the tile on the ellipsoid for the edge-of-world
/// normals contributed along sides without a neighbor.
pub fn stitch(mesh: &mut Mesh, neighbors: &NeighborSet, bounds: &GeoBounds, with_normals: bool) {
    stitch_corners(mesh, neighbors, bounds, with_normals);

    for side in Side::ALL {
        let dir = side_direction(side);
        match neighbors.get(dir) {
            Some(neighbor) => stitch_edge(mesh, neighbor, side, with_normals),
            None => {
                if with_normals {
                    blend_edge_of_world(mesh, side, bounds);
                }
            }
        }
    }
}

/// The neighbor that shares a full edge with this side
fn side_direction(side: Side) -> Direction {
    match side {
        Side::West => Direction::West,
        Side::South => Direction::South,
        Side::East => Direction::East,
        Side::North => Direction::North,
    }
}

/// Corner descriptors: self corner (u, v) and, per contributing
/// neighbor, the corner of that neighbor touching the same point
const CORNERS: [([f64; 2], [(Direction, [f64; 2]); 3]); 4] = [
    (
        [0.0, 1.0],
        [
            (Direction::North, [0.0, 0.0]),
            (Direction::NorthWest, [1.0, 0.0]),
            (Direction::West, [1.0, 1.0]),
        ],
    ),
    (
        [1.0, 1.0],
        [
            (Direction::North, [1.0, 0.0]),
            (Direction::NorthEast, [0.0, 0.0]),
            (Direction::East, [0.0, 1.0]),
        ],
    ),
    (
        [0.0, 0.0],
        [
            (Direction::South, [0.0, 1.0]),
            (Direction::SouthWest, [1.0, 1.0]),
            (Direction::West, [1.0, 0.0]),
        ],
    ),
    (
        [1.0, 0.0],
        [
            (Direction::South, [1.0, 1.0]),
            (Direction::SouthEast, [0.0, 1.0]),
            (Direction::East, [0.0, 0.0]),
        ],
    ),
];

fn find_corner(mesh: &Mesh, corner: [f64; 2]) -> Option<usize> {
    mesh.positions
        .iter()
        .position(|p| p[0] == corner[0] && p[1] == corner[1])
}

fn stitch_corners(mesh: &mut Mesh, neighbors: &NeighborSet, bounds: &GeoBounds, with_normals: bool) {
    for (corner, contributors) in CORNERS {
        let own = match find_corner(mesh, corner) {
            Some(i) => i,
            None => continue,
        };

        let mut height_sum = mesh.positions[own][2];
        let mut height_count = 1.0;
        let mut normal_sum = if with_normals {
            let n = mesh.normals[own];
            [n[0] as f64, n[1] as f64, n[2] as f64]
        } else {
            [0.0; 3]
        };

        for (dir, their_corner) in contributors {
            match neighbors.get(dir).and_then(|m| {
                find_corner(m, their_corner).map(|i| (m.positions[i][2], m.normals.get(i).copied()))
            }) {
                Some((h, n)) => {
                    height_sum += h;
                    height_count += 1.0;
                    if with_normals {
                        if let Some(n) = n {
                            normal_sum[0] += n[0] as f64;
                            normal_sum[1] += n[1] as f64;
                            normal_sum[2] += n[2] as f64;
                        }
                    }
                }
                None => {
                    // Edge of the world: the missing contributor counts
                    // as the ellipsoid surface normal, but adds no height
                    if with_normals {
                        let lon = bounds.west + corner[0] * bounds.width();
                        let lat = bounds.south + corner[1] * bounds.height();
                        let g = normals::geodetic_surface_normal(lon, lat);
                        normal_sum[0] += g[0] as f64;
                        normal_sum[1] += g[1] as f64;
                        normal_sum[2] += g[2] as f64;
                    }
                }
            }
        }

        mesh.positions[own][2] = height_sum / height_count;
        if with_normals {
            mesh.normals[own] = normals::normalize([
                normal_sum[0] as f32,
                normal_sum[1] as f32,
                normal_sum[2] as f32,
            ]);
        }
    }
}

fn stitch_edge(mesh: &mut Mesh, neighbor: &Mesh, side: Side, with_normals: bool) {
    let full = bucket(1.0);
    let their_side = opposite_side(side);

    // Neighbor boundary values keyed by quantized parameter, corners
    // excluded since they were reconciled with their full contributor set
    let mut theirs: HashMap<u32, (f64, Option<[f32; 3]>)> = HashMap::new();
    for v in neighbor.edge(their_side) {
        let b = bucket(v.param);
        if b == 0 || b == full {
            continue;
        }
        theirs.insert(
            b,
            (
                neighbor.positions[v.index as usize][2],
                neighbor.normals.get(v.index as usize).copied(),
            ),
        );
    }

    // Average coincident pairs
    let own_edge = mesh.edge(side);
    let mut own_buckets: Vec<(u32, u32)> = Vec::with_capacity(own_edge.len());
    for v in &own_edge {
        let b = bucket(v.param);
        own_buckets.push((b, v.index));
        if b == 0 || b == full {
            continue;
        }
        if let Some((their_h, their_n)) = theirs.get(&b) {
            let i = v.index as usize;
            mesh.positions[i][2] = (mesh.positions[i][2] + their_h) / 2.0;
            if with_normals {
                if let Some(their_n) = their_n {
                    let own_n = mesh.normals[i];
                    mesh.normals[i] = normals::normalize([
                        (own_n[0] + their_n[0]) / 2.0,
                        (own_n[1] + their_n[1]) / 2.0,
                        (own_n[2] + their_n[2]) / 2.0,
                    ]);
                }
            }
        }
    }

    // Insert self vertices for neighbor-only parameters, walking in
    // parameter order so each insertion sees the updated adjacency
    let mut missing: Vec<u32> = theirs
        .keys()
        .copied()
        .filter(|b| !own_buckets.iter().any(|(ob, _)| ob == b))
        .collect();
    missing.sort_unstable();

    for b in missing {
        let param = b as f64 / PARAM_STEPS;
        let (prev, next) = match bracket(&own_buckets, b) {
            Some(pair) => pair,
            None => continue,
        };
        let (height, normal) = theirs[&b];
        let new_index = insert_boundary_vertex(mesh, side, param, height, normal, prev, next);
        if let Some(new_index) = new_index {
            let pos = own_buckets
                .iter()
                .position(|(ob, _)| *ob > b)
                .unwrap_or(own_buckets.len());
            own_buckets.insert(pos, (b, new_index));
        }
    }
}

/// The adjacent existing boundary vertices around a parameter bucket
fn bracket(own_buckets: &[(u32, u32)], b: u32) -> Option<(u32, u32)> {
    let mut prev: Option<(u32, u32)> = None;
    let mut next: Option<(u32, u32)> = None;
    for &(ob, idx) in own_buckets {
        if ob < b && prev.map_or(true, |(pb, _)| ob > pb) {
            prev = Some((ob, idx));
        }
        if ob > b && next.map_or(true, |(nb, _)| ob < nb) {
            next = Some((ob, idx));
        }
    }
    match (prev, next) {
        (Some((_, a)), Some((_, c))) => Some((a, c)),
        _ => None,
    }
}

fn opposite_side(side: Side) -> Side {
    match side {
        Side::West => Side::East,
        Side::East => Side::West,
        Side::North => Side::South,
        Side::South => Side::North,
    }
}

/// Insert a vertex on a boundary edge and split the adjacent triangle.
/// Returns the new vertex index, or None when no triangle holds the edge.
fn insert_boundary_vertex(
    mesh: &mut Mesh,
    side: Side,
    param: f64,
    height: f64,
    normal: Option<[f32; 3]>,
    a: u32,
    b: u32,
) -> Option<u32> {
    let tri_pos = mesh.triangles.iter().position(|t| {
        (0..3).any(|i| {
            let u = t[i];
            let v = t[(i + 1) % 3];
            (u == a && v == b) || (u == b && v == a)
        })
    })?;

    let (u, v) = match side {
        Side::North => (param, 1.0),
        Side::South => (param, 0.0),
        Side::West => (0.0, param),
        Side::East => (1.0, param),
    };
    let new_index = mesh.positions.len() as u32;
    mesh.positions.push([u, v, height]);
    if !mesh.normals.is_empty() {
        mesh.normals.push(normal.unwrap_or([0.0, 0.0, 1.0]));
    }

    let tri = mesh.triangles[tri_pos];
    let i = (0..3)
        .find(|&i| {
            let x = tri[i];
            let y = tri[(i + 1) % 3];
            (x == a && y == b) || (x == b && y == a)
        })
        .unwrap();
    let (vi, vj, vk) = (tri[i], tri[(i + 1) % 3], tri[(i + 2) % 3]);
    mesh.triangles[tri_pos] = [vi, new_index, vk];
    mesh.triangles.push([new_index, vj, vk]);
    Some(new_index)
}

/// Average edge normals with the geodetic surface normal along a side
/// that has no neighbor
fn blend_edge_of_world(mesh: &mut Mesh, side: Side, bounds: &GeoBounds) {
    if mesh.normals.is_empty() {
        return;
    }
    let full = bucket(1.0);
    for v in mesh.edge(side) {
        let b = bucket(v.param);
        // Corners are handled with their full contributor set
        if b == 0 || b == full {
            continue;
        }
        let i = v.index as usize;
        let p = mesh.positions[i];
        let lon = bounds.west + p[0] * bounds.width();
        let lat = bounds.south + p[1] * bounds.height();
        let g = normals::geodetic_surface_normal(lon, lat);
        let n = mesh.normals[i];
        mesh.normals[i] = normals::normalize([
            (n[0] + g[0]) / 2.0,
            (n[1] + g[1]) / 2.0,
            (n[2] + g[2]) / 2.0,
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cog::Resampling;
    use crate::core::meshing::{produce, MeshDetail, MeshParams, MeshingMethod};
    use crate::core::window::ElevationGrid;

    fn bounds() -> GeoBounds {
        GeoBounds {
            west: 10.0,
            south: 45.0,
            east: 10.1,
            north: 45.1,
        }
    }

    fn uniform_mesh(cells: usize, height: f32, with_normals: bool) -> Mesh {
        let n = 32;
        let grid = ElevationGrid::new(
            n,
            n,
            vec![height; n * n],
            bounds(),
            Resampling::Bilinear,
            vec![false; n * n],
        );
        produce(
            &grid,
            &MeshParams::new(MeshingMethod::Grid, MeshDetail::GridSize(cells as u32)),
            with_normals,
        )
        .unwrap()
    }

    #[test]
    fn test_shared_edge_heights_average() {
        let mut own = uniform_mesh(4, 100.0, false);
        let mut neighbors = NeighborSet::default();
        neighbors.set(Direction::East, uniform_mesh(4, 200.0, false));

        stitch(&mut own, &neighbors, &bounds(), false);

        for (i, p) in own.positions.iter().enumerate() {
            if p[0] == 1.0 {
                assert_eq!(p[2], 150.0, "east vertex {} not averaged", i);
            } else {
                assert_eq!(p[2], 100.0, "interior vertex {} touched", i);
            }
        }
    }

    #[test]
    fn test_stitching_is_symmetric() {
        // Tile A stitched against B must agree with B stitched against A
        // on every shared-edge parameter
        let mut a = uniform_mesh(4, 100.0, true);
        let mut a_neighbors = NeighborSet::default();
        a_neighbors.set(Direction::East, uniform_mesh(4, 200.0, true));
        stitch(&mut a, &a_neighbors, &bounds(), true);

        let mut b = uniform_mesh(4, 200.0, true);
        let mut b_neighbors = NeighborSet::default();
        b_neighbors.set(Direction::West, uniform_mesh(4, 100.0, true));
        stitch(&mut b, &b_neighbors, &bounds(), true);

        let a_edge = a.edge(Side::East);
        let b_edge = b.edge(Side::West);
        assert_eq!(a_edge.len(), b_edge.len());
        for (av, bv) in a_edge.iter().zip(&b_edge) {
            assert_eq!(bucket(av.param), bucket(bv.param));
            let ah = a.positions[av.index as usize][2];
            let bh = b.positions[bv.index as usize][2];
            assert_eq!(ah, bh, "heights differ at param {}", av.param);
        }
    }

    #[test]
    fn test_corner_averages_all_contributors() {
        let mut own = uniform_mesh(2, 0.0, false);
        let mut neighbors = NeighborSet::default();
        neighbors.set(Direction::North, uniform_mesh(2, 40.0, false));
        neighbors.set(Direction::NorthEast, uniform_mesh(2, 80.0, false));
        neighbors.set(Direction::East, uniform_mesh(2, 120.0, false));

        stitch(&mut own, &neighbors, &bounds(), false);

        let ne = own
            .positions
            .iter()
            .find(|p| p[0] == 1.0 && p[1] == 1.0)
            .unwrap();
        // (0 + 40 + 80 + 120) / 4
        assert_eq!(ne[2], 60.0);
    }

    #[test]
    fn test_neighbor_only_vertex_is_inserted() {
        // Self has a 1-cell edge, the eastern neighbor has a 2-cell edge
        // with a midpoint vertex the self tile lacks
        let mut own = uniform_mesh(1, 10.0, false);
        let triangles_before = own.triangles.len();
        let mut neighbors = NeighborSet::default();
        neighbors.set(Direction::East, uniform_mesh(2, 30.0, false));

        stitch(&mut own, &neighbors, &bounds(), false);

        let east = own.edge(Side::East);
        assert_eq!(east.len(), 3, "midpoint vertex not inserted");
        let mid = east.iter().find(|v| bucket(v.param) == bucket(0.5)).unwrap();
        // Inserted vertices carry the neighbor's value verbatim
        assert_eq!(own.positions[mid.index as usize][2], 30.0);
        assert_eq!(own.triangles.len(), triangles_before + 1);

        // The triangulation stays consistent: all indices valid, CCW
        for tri in &own.triangles {
            let a = own.positions[tri[0] as usize];
            let b = own.positions[tri[1] as usize];
            let c = own.positions[tri[2] as usize];
            let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            assert!(cross > 0.0);
        }
    }

    #[test]
    fn test_interior_untouched_by_insertion() {
        let mut own = uniform_mesh(4, 10.0, false);
        let interior_before: Vec<[f64; 3]> = own
            .positions
            .iter()
            .filter(|p| p[0] > 0.0 && p[0] < 1.0 && p[1] > 0.0 && p[1] < 1.0)
            .copied()
            .collect();
        let mut neighbors = NeighborSet::default();
        neighbors.set(Direction::East, uniform_mesh(8, 90.0, false));
        stitch(&mut own, &neighbors, &bounds(), false);

        let interior_after: Vec<[f64; 3]> = own
            .positions
            .iter()
            .filter(|p| p[0] > 0.0 && p[0] < 1.0 && p[1] > 0.0 && p[1] < 1.0)
            .copied()
            .collect();
        assert_eq!(interior_before, interior_after);
    }

    #[test]
    fn test_edge_of_world_blends_geodetic_normal() {
        let mut own = uniform_mesh(2, 0.0, true);
        let west_before: Vec<[f32; 3]> = own
            .edge(Side::West)
            .iter()
            .map(|v| own.normals[v.index as usize])
            .collect();
        let neighbors = NeighborSet::default();
        stitch(&mut own, &neighbors, &bounds(), true);

        for (v, _before) in own.edge(Side::West).iter().zip(&west_before) {
            let n = own.normals[v.index as usize];
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            assert!((len - 1.0).abs() < 1e-4);
        }
    }
}
