//! Delatin mesher
//!
//! Greedy Delaunay refinement: starting from two triangles over the
//! window corners, repeatedly insert the grid point with the largest
//! vertical error (Bowyer-Watson cavity insertion) until every triangle
//! approximates its covered cells within the error threshold. Points on
//! the window boundary lie on the convex hull; the degenerate fan edge is
//! skipped there so hull edges split cleanly instead of producing
//! zero-area triangles.

use crate::core::error::{Error, Result};
use crate::core::meshing::Mesh;
use crate::core::window::ElevationGrid;

struct Triangle {
    v: [u32; 3],
    alive: bool,
    /// Grid cell with the largest interpolation error inside this triangle
    candidate: (usize, usize),
    cand_error: f32,
}

struct Delatin<'a> {
    grid: &'a ElevationGrid,
    points: Vec<(f64, f64)>,
    heights: Vec<f64>,
    triangles: Vec<Triangle>,
    is_vertex: Vec<bool>,
}

pub fn mesh(grid: &ElevationGrid, max_error: f32) -> Result<Mesh> {
    if grid.width < 2 || grid.height < 2 {
        return Err(Error::MeshingFailed(format!(
            "delatin window too small: {}x{}",
            grid.width, grid.height
        )));
    }

    let mut d = Delatin {
        grid,
        points: Vec::new(),
        heights: Vec::new(),
        triangles: Vec::new(),
        is_vertex: vec![false; grid.width * grid.height],
    };
    d.init();
    d.refine(max_error.max(0.0));
    Ok(d.into_mesh())
}

impl Delatin<'_> {
    fn init(&mut self) {
        let w = self.grid.width - 1;
        let h = self.grid.height - 1;
        let sw = self.add_point(0, h);
        let se = self.add_point(w, h);
        let nw = self.add_point(0, 0);
        let ne = self.add_point(w, 0);
        self.add_triangle([nw, sw, se]);
        self.add_triangle([nw, se, ne]);
    }

    fn add_point(&mut self, col: usize, row: usize) -> u32 {
        self.is_vertex[row * self.grid.width + col] = true;
        self.points.push((col as f64, row as f64));
        self.heights.push(self.grid.at(col, row) as f64);
        (self.points.len() - 1) as u32
    }

    fn add_triangle(&mut self, mut v: [u32; 3]) {
        // Store counterclockwise in raster coordinates
        if self.signed_area(v) < 0.0 {
            v.swap(1, 2);
        }
        let (candidate, cand_error) = self.scan_candidate(v);
        self.triangles.push(Triangle {
            v,
            alive: true,
            candidate,
            cand_error,
        });
    }

    fn signed_area(&self, v: [u32; 3]) -> f64 {
        let a = self.points[v[0] as usize];
        let b = self.points[v[1] as usize];
        let c = self.points[v[2] as usize];
        (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
    }

    /// Largest-error grid cell strictly interior to the triangle's
    /// coverage (existing vertices have zero error by construction)
    fn scan_candidate(&self, v: [u32; 3]) -> ((usize, usize), f32) {
        let a = self.points[v[0] as usize];
        let b = self.points[v[1] as usize];
        let c = self.points[v[2] as usize];
        let (ha, hb, hc) = (
            self.heights[v[0] as usize],
            self.heights[v[1] as usize],
            self.heights[v[2] as usize],
        );
        let denom = (b.1 - c.1) * (a.0 - c.0) + (c.0 - b.0) * (a.1 - c.1);
        if denom.abs() < 1e-12 {
            return ((0, 0), 0.0);
        }

        let min_col = a.0.min(b.0).min(c.0).ceil() as usize;
        let max_col = a.0.max(b.0).max(c.0).floor() as usize;
        let min_row = a.1.min(b.1).min(c.1).ceil() as usize;
        let max_row = a.1.max(b.1).max(c.1).floor() as usize;

        let mut best = ((0, 0), 0.0f32);
        for row in min_row..=max_row {
            for col in min_col..=max_col {
                if self.is_vertex[row * self.grid.width + col] {
                    continue;
                }
                let px = col as f64;
                let py = row as f64;
                let wa = ((b.1 - c.1) * (px - c.0) + (c.0 - b.0) * (py - c.1)) / denom;
                let wb = ((c.1 - a.1) * (px - c.0) + (a.0 - c.0) * (py - c.1)) / denom;
                let wc = 1.0 - wa - wb;
                let eps = -1e-9;
                if wa < eps || wb < eps || wc < eps {
                    continue;
                }
                let interpolated = wa * ha + wb * hb + wc * hc;
                let err = (interpolated - self.grid.at(col, row) as f64).abs() as f32;
                if err > best.1 {
                    best = ((col, row), err);
                }
            }
        }
        best
    }

    fn refine(&mut self, max_error: f32) {
        let budget = self.grid.width * self.grid.height;
        for _ in 0..budget {
            let worst = self
                .triangles
                .iter()
                .enumerate()
                .filter(|(_, t)| t.alive)
                .max_by(|a, b| a.1.cand_error.total_cmp(&b.1.cand_error));
            let (idx, err, point) = match worst {
                Some((i, t)) => (i, t.cand_error, t.candidate),
                None => break,
            };
            if err <= max_error {
                break;
            }
            if !self.insert(point.0, point.1) {
                // The point was numerically orphaned; rescan so the same
                // triangle cannot be picked again with a stale candidate
                let (candidate, cand_error) = self.scan_candidate(self.triangles[idx].v);
                self.triangles[idx].candidate = candidate;
                self.triangles[idx].cand_error = cand_error;
            }
        }
    }

    /// Bowyer-Watson cavity insertion of one grid point
    fn insert(&mut self, col: usize, row: usize) -> bool {
        let px = col as f64;
        let py = row as f64;

        let mut bad = Vec::new();
        for (i, t) in self.triangles.iter().enumerate() {
            if t.alive && self.in_circumcircle(t.v, px, py) {
                bad.push(i);
            }
        }
        if bad.is_empty() {
            self.is_vertex[row * self.grid.width + col] = true;
            return false;
        }

        // Cavity boundary: edges used by exactly one bad triangle
        let mut edges: Vec<(u32, u32, u32)> = Vec::new();
        for &i in &bad {
            let v = self.triangles[i].v;
            for (a, b) in [(v[0], v[1]), (v[1], v[2]), (v[2], v[0])] {
                let key = (a.min(b), a.max(b));
                if let Some(pos) = edges.iter().position(|e| (e.0, e.1) == key) {
                    edges[pos].2 += 1;
                } else {
                    edges.push((key.0, key.1, 1));
                }
            }
        }
        for &i in &bad {
            self.triangles[i].alive = false;
        }

        let p = self.add_point(col, row);
        for (a, b, count) in edges {
            if count != 1 {
                continue;
            }
            let pa = self.points[a as usize];
            let pb = self.points[b as usize];
            let area = (pa.0 - px) * (pb.1 - py) - (pa.1 - py) * (pb.0 - px);
            // The point sits on this hull edge; the split is covered by
            // the neighboring fan triangles
            if area.abs() < 1e-12 {
                continue;
            }
            self.add_triangle([p, a, b]);
        }
        true
    }

    fn in_circumcircle(&self, v: [u32; 3], px: f64, py: f64) -> bool {
        let a = self.points[v[0] as usize];
        let b = self.points[v[1] as usize];
        let c = self.points[v[2] as usize];
        let ax = a.0 - px;
        let ay = a.1 - py;
        let bx = b.0 - px;
        let by = b.1 - py;
        let cx = c.0 - px;
        let cy = c.1 - py;
        let det = (ax * ax + ay * ay) * (bx * cy - cx * by)
            - (bx * bx + by * by) * (ax * cy - cx * ay)
            + (cx * cx + cy * cy) * (ax * by - bx * ay);
        det > 1e-9
    }

    fn into_mesh(self) -> Mesh {
        let w = (self.grid.width - 1) as f64;
        let h = (self.grid.height - 1) as f64;
        let positions: Vec<[f64; 3]> = self
            .points
            .iter()
            .zip(&self.heights)
            .map(|((x, y), z)| [x / w, 1.0 - y / h, *z])
            .collect();
        let mut triangles = Vec::new();
        for t in &self.triangles {
            if !t.alive {
                continue;
            }
            // Raster CCW becomes CW after the v-flip
            let mut tri = t.v;
            let a = positions[tri[0] as usize];
            let b = positions[tri[1] as usize];
            let c = positions[tri[2] as usize];
            let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            if cross < 0.0 {
                tri.swap(1, 2);
            }
            triangles.push(tri);
        }
        Mesh {
            positions,
            triangles,
            normals: Vec::new(),
        }
    }
}
