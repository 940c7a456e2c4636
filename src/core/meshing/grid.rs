//! Structured grid mesher
//!
//! Samples the elevation window on a regular `n x n` lattice and emits the
//! canonical two-triangles-per-quad triangulation with counterclockwise
//! winding. Boundary vertices land exactly on u/v 0 and 1 so adjacent
//! tiles built with the same grid size always share edge parameters.

use crate::core::error::{Error, Result};
use crate::core::meshing::Mesh;
use crate::core::window::ElevationGrid;

pub fn mesh(grid: &ElevationGrid, cells: usize) -> Result<Mesh> {
    if cells == 0 {
        return Err(Error::MeshingFailed("grid size must be at least 1".into()));
    }
    let cells = cells.min(grid.width - 1).min(grid.height - 1);
    let verts_per_side = cells + 1;

    let mut positions = Vec::with_capacity(verts_per_side * verts_per_side);
    for row in 0..verts_per_side {
        // v grows north while raster rows grow south
        let v = row as f64 / cells as f64;
        for col in 0..verts_per_side {
            let u = col as f64 / cells as f64;
            let src_col = u * (grid.width - 1) as f64;
            let src_row = (1.0 - v) * (grid.height - 1) as f64;
            let h = grid.sample(src_col, src_row) as f64;
            positions.push([u, v, h]);
        }
    }

    let mut triangles = Vec::with_capacity(cells * cells * 2);
    for row in 0..cells {
        for col in 0..cells {
            let sw = (row * verts_per_side + col) as u32;
            let se = sw + 1;
            let nw = sw + verts_per_side as u32;
            let ne = nw + 1;
            triangles.push([sw, se, nw]);
            triangles.push([nw, se, ne]);
        }
    }

    Ok(Mesh {
        positions,
        triangles,
        normals: Vec::new(),
    })
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

    fn ramp_grid(n: usize) -> ElevationGrid {
        // Height equals the column index, so a west-east ramp
        let mut heights = Vec::with_capacity(n * n);
        for _row in 0..n {
            for col in 0..n {
                heights.push(col as f32);
            }
        }
        ElevationGrid::new(n, n, heights, bounds(), Resampling::Bilinear, vec![false; n * n])
    }

    #[test]
    fn test_counts() {
        let mesh = mesh(&ramp_grid(256), 20).unwrap();
        assert_eq!(mesh.positions.len(), 21 * 21);
        assert_eq!(mesh.triangles.len(), 20 * 20 * 2);
    }

    #[test]
    fn test_ramp_heights_sampled() {
        let n = 256;
        let mesh = mesh(&ramp_grid(n), 16).unwrap();
        for p in &mesh.positions {
            let expected = p[0] * (n - 1) as f64;
            assert!(
                (p[2] - expected).abs() < 1e-3,
                "u={} h={} expected={}",
                p[0],
                p[2],
                expected
            );
        }
    }

    #[test]
    fn test_winding_is_counterclockwise() {
        let mesh = mesh(&ramp_grid(64), 4).unwrap();
        for tri in &mesh.triangles {
            let a = mesh.positions[tri[0] as usize];
            let b = mesh.positions[tri[1] as usize];
            let c = mesh.positions[tri[2] as usize];
            let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            assert!(cross > 0.0, "clockwise triangle {:?}", tri);
        }
    }

    #[test]
    fn test_grid_size_clamped_to_window() {
        // A 4-sample window cannot host a 300-cell grid
        let mesh = mesh(&ramp_grid(4), 300).unwrap();
        assert_eq!(mesh.positions.len(), 4 * 4);
    }
}
