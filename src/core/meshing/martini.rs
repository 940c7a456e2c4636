//! Martini mesher
//!
//! Right-triangulated irregular network over a `(2^k + 1)` elevation grid.
//! A bottom-up pass accumulates, for every possible triangle midpoint, the
//! maximum interpolation error of its subtree; the extraction pass then
//! splits triangles until the stored error drops below the threshold.
//! Splitting on the accumulated maximum keeps neighboring triangles
//! compatible, so the triangulation never cracks.

use crate::core::error::{Error, Result};
use crate::core::meshing::Mesh;
use crate::core::window::ElevationGrid;

pub fn mesh(grid: &ElevationGrid, max_error: f32) -> Result<Mesh> {
    let size = grid.width;
    if grid.height != size {
        return Err(Error::MeshingFailed(format!(
            "martini window must be square, got {}x{}",
            grid.width, grid.height
        )));
    }
    let tile = size - 1;
    if tile == 0 || !tile.is_power_of_two() {
        return Err(Error::MeshingFailed(format!(
            "martini window must be 2^k+1 samples per side, got {}",
            size
        )));
    }

    let errors = accumulate_errors(&grid.heights, size);

    let mut emitter = Emitter {
        size,
        max_error,
        errors: &errors,
        terrain: &grid.heights,
        index_of: vec![u32::MAX; size * size],
        positions: Vec::new(),
        triangles: Vec::new(),
    };
    let t = tile as i64;
    emitter.process(0, 0, t, t, t, 0);
    emitter.process(t, t, 0, 0, 0, t);

    let mut mesh = Mesh {
        positions: emitter.positions,
        triangles: emitter.triangles,
        normals: Vec::new(),
    };
    enforce_ccw(&mut mesh);
    Ok(mesh)
}

/// Bottom-up error accumulation over the implicit RTIN hierarchy
fn accumulate_errors(terrain: &[f32], size: usize) -> Vec<f32> {
    let tile = size - 1;
    let num_triangles = tile * tile * 2 - 2;
    let num_parents = num_triangles.saturating_sub(tile * tile);

    // Triangle corner coordinates, recovered by walking the binary id
    let mut coords = vec![0i64; num_triangles * 4];
    for i in 0..num_triangles {
        let mut id = i + 2;
        let (mut ax, mut ay, mut bx, mut by, mut cx, mut cy) = (0i64, 0i64, 0i64, 0i64, 0i64, 0i64);
        if id & 1 == 1 {
            bx = tile as i64;
            by = tile as i64;
            cx = tile as i64;
        } else {
            ax = tile as i64;
            ay = tile as i64;
            cy = tile as i64;
        }
        id >>= 1;
        while id > 1 {
            let mx = (ax + bx) >> 1;
            let my = (ay + by) >> 1;
            if id & 1 == 1 {
                bx = ax;
                by = ay;
                ax = cx;
                ay = cy;
            } else {
                ax = bx;
                ay = by;
                bx = cx;
                by = cy;
            }
            cx = mx;
            cy = my;
            id >>= 1;
        }
        let k = i * 4;
        coords[k] = ax;
        coords[k + 1] = ay;
        coords[k + 2] = bx;
        coords[k + 3] = by;
    }

    let mut errors = vec![0.0f32; size * size];
    for i in (0..num_triangles).rev() {
        let k = i * 4;
        let (ax, ay, bx, by) = (coords[k], coords[k + 1], coords[k + 2], coords[k + 3]);
        let mx = (ax + bx) >> 1;
        let my = (ay + by) >> 1;
        let cx = mx + my - ay;
        let cy = my + ax - mx;

        let a = terrain[(ay as usize) * size + ax as usize];
        let b = terrain[(by as usize) * size + bx as usize];
        let middle = (my as usize) * size + mx as usize;
        let middle_error = ((a + b) / 2.0 - terrain[middle]).abs();
        errors[middle] = errors[middle].max(middle_error);

        if i < num_parents {
            let left = errors[(((ay + cy) >> 1) as usize) * size + ((ax + cx) >> 1) as usize];
            let right = errors[(((by + cy) >> 1) as usize) * size + ((bx + cx) >> 1) as usize];
            errors[middle] = errors[middle].max(left).max(right);
        }
    }
    errors
}

struct Emitter<'a> {
    size: usize,
    max_error: f32,
    errors: &'a [f32],
    terrain: &'a [f32],
    index_of: Vec<u32>,
    positions: Vec<[f64; 3]>,
    triangles: Vec<[u32; 3]>,
}

impl Emitter<'_> {
    fn process(&mut self, ax: i64, ay: i64, bx: i64, by: i64, cx: i64, cy: i64) {
        let mx = (ax + bx) >> 1;
        let my = (ay + by) >> 1;
        let splittable = (ax - cx).abs() + (ay - cy).abs() > 1;
        if splittable && self.errors[(my as usize) * self.size + mx as usize] > self.max_error {
            self.process(cx, cy, ax, ay, mx, my);
            self.process(bx, by, cx, cy, mx, my);
        } else {
            let a = self.vertex(ax, ay);
            let b = self.vertex(bx, by);
            let c = self.vertex(cx, cy);
            self.triangles.push([a, b, c]);
        }
    }

    fn vertex(&mut self, x: i64, y: i64) -> u32 {
        let cell = (y as usize) * self.size + x as usize;
        if self.index_of[cell] == u32::MAX {
            let tile = (self.size - 1) as f64;
            // Raster rows grow south, v grows north
            self.index_of[cell] = self.positions.len() as u32;
            self.positions.push([
                x as f64 / tile,
                1.0 - y as f64 / tile,
                self.terrain[cell] as f64,
            ]);
        }
        self.index_of[cell]
    }
}

/// Flip triangles that came out clockwise in (u, v) space
fn enforce_ccw(mesh: &mut Mesh) {
    for tri in &mut mesh.triangles {
        let a = mesh.positions[tri[0] as usize];
        let b = mesh.positions[tri[1] as usize];
        let c = mesh.positions[tri[2] as usize];
        let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
        if cross < 0.0 {
            tri.swap(1, 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cog::Resampling;
    use crate::core::tms::GeoBounds;

    fn bounds() -> GeoBounds {
        GeoBounds {
            west: 0.0,
            south: 0.0,
            east: 1.0,
            north: 1.0,
        }
    }

    fn grid_from(size: usize, f: impl Fn(usize, usize) -> f32) -> ElevationGrid {
        let mut heights = Vec::with_capacity(size * size);
        for row in 0..size {
            for col in 0..size {
                heights.push(f(col, row));
            }
        }
        ElevationGrid::new(
            size,
            size,
            heights,
            bounds(),
            Resampling::Bilinear,
            vec![false; size * size],
        )
    }

    #[test]
    fn test_rejects_non_power_of_two_grid() {
        let grid = grid_from(256, |_, _| 0.0);
        assert!(mesh(&grid, 1.0).is_err());
        let grid = grid_from(257, |_, _| 0.0);
        assert!(mesh(&grid, 1.0).is_ok());
    }

    #[test]
    fn test_flat_terrain_collapses_to_two_triangles() {
        let grid = grid_from(65, |_, _| 42.0);
        let mesh = mesh(&grid, 0.5).unwrap();
        assert_eq!(mesh.triangles.len(), 2);
        assert_eq!(mesh.positions.len(), 4);
        for p in &mesh.positions {
            assert_eq!(p[2], 42.0);
        }
    }

    #[test]
    fn test_zero_error_reproduces_full_grid() {
        // A strictly convex surface has a positive interpolation error at
        // every midpoint, so a zero threshold forces the full split
        let grid = grid_from(17, |c, r| (c * c + r * r) as f32);
        let mesh = mesh(&grid, 0.0).unwrap();
        assert_eq!(mesh.triangles.len(), 16 * 16 * 2);
        assert_eq!(mesh.positions.len(), 17 * 17);
    }

    #[test]
    fn test_higher_error_means_fewer_triangles() {
        let grid = grid_from(65, |c, r| {
            let x = c as f32 / 64.0;
            let y = r as f32 / 64.0;
            100.0 * ((x * 6.0).sin() + (y * 5.0).cos())
        });
        let fine = mesh(&grid, 0.5).unwrap().triangles.len();
        let coarse = mesh(&grid, 20.0).unwrap().triangles.len();
        assert!(coarse < fine, "coarse {} !< fine {}", coarse, fine);
        assert!(coarse >= 2);
    }

    #[test]
    fn test_triangles_are_ccw_and_nondegenerate() {
        let grid = grid_from(33, |c, r| (c as f32 - r as f32).abs());
        let mesh = mesh(&grid, 0.1).unwrap();
        for tri in &mesh.triangles {
            let a = mesh.positions[tri[0] as usize];
            let b = mesh.positions[tri[1] as usize];
            let c = mesh.positions[tri[2] as usize];
            let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            assert!(cross > 1e-12);
        }
    }

    #[test]
    fn test_corners_always_present() {
        let grid = grid_from(129, |c, r| (c + r) as f32);
        let mesh = mesh(&grid, 50.0).unwrap();
        for corner in [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]] {
            assert!(
                mesh.positions
                    .iter()
                    .any(|p| p[0] == corner[0] && p[1] == corner[1]),
                "missing corner {:?}",
                corner
            );
        }
    }
}
