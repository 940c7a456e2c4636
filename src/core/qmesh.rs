//! Quantized-mesh encoder
//!
//! Serializes a tile mesh to the quantized-mesh 1.0 terrain format with
//! the octvertexnormals extension: an 88-byte header (tile center, height
//! range, bounding sphere, horizon occlusion point), zig-zag delta encoded
//! 16-bit vertex data, high-water-mark encoded triangle indices, the four
//! edge vertex lists, and oct-encoded per-vertex normals. Output is
//! byte-stable for a given input mesh.

use crate::core::error::{Error, Result};
use crate::core::meshing::{normals::to_ecef, Mesh, Side};
use crate::core::tms::{GeoBounds, WGS84_A, WGS84_B};

/// Quantization range along each tile axis
const QM_MAX: f64 = 32767.0;

/// Extension id of octvertexnormals
const EXT_VERTEX_NORMALS: u8 = 1;

pub fn encode(mesh: &Mesh, bounds: &GeoBounds) -> Result<Vec<u8>> {
    let n = mesh.positions.len();
    if n < 3 || mesh.triangles.is_empty() {
        return Err(Error::EncodingFailed(format!(
            "mesh with {} vertices and {} triangles cannot be encoded",
            n,
            mesh.triangles.len()
        )));
    }
    if n > u32::MAX as usize {
        return Err(Error::EncodingFailed("too many vertices".into()));
    }
    if !mesh.normals.is_empty() && mesh.normals.len() != n {
        return Err(Error::EncodingFailed(format!(
            "{} normals for {} vertices",
            mesh.normals.len(),
            n
        )));
    }

    // High-water-mark index encoding requires vertices numbered by first
    // appearance in the index buffer, so renumber everything up front
    let mut remap = vec![u32::MAX; n];
    let mut order: Vec<u32> = Vec::with_capacity(n);
    for tri in &mesh.triangles {
        for &i in tri {
            if i as usize >= n {
                return Err(Error::EncodingFailed(format!(
                    "triangle references vertex {} of {}",
                    i, n
                )));
            }
            if remap[i as usize] == u32::MAX {
                remap[i as usize] = order.len() as u32;
                order.push(i);
            }
        }
    }
    for (i, slot) in remap.iter_mut().enumerate() {
        if *slot == u32::MAX {
            *slot = order.len() as u32;
            order.push(i as u32);
        }
    }
    let positions: Vec<[f64; 3]> = order.iter().map(|&i| mesh.positions[i as usize]).collect();
    let normals: Vec<[f32; 3]> = order
        .iter()
        .filter_map(|&i| mesh.normals.get(i as usize).copied())
        .collect();
    let triangles: Vec<[u32; 3]> = mesh
        .triangles
        .iter()
        .map(|t| [remap[t[0] as usize], remap[t[1] as usize], remap[t[2] as usize]])
        .collect();

    let mut min_h = f64::INFINITY;
    let mut max_h = f64::NEG_INFINITY;
    for p in &positions {
        min_h = min_h.min(p[2]);
        max_h = max_h.max(p[2]);
    }

    let ecef: Vec<[f64; 3]> = positions
        .iter()
        .map(|p| {
            let lon = bounds.west + p[0] * bounds.width();
            let lat = bounds.south + p[1] * bounds.height();
            to_ecef(lon, lat, p[2])
        })
        .collect();

    // Bounding sphere from the cartesian bounding box
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for p in &ecef {
        for axis in 0..3 {
            lo[axis] = lo[axis].min(p[axis]);
            hi[axis] = hi[axis].max(p[axis]);
        }
    }
    let center = [
        (lo[0] + hi[0]) / 2.0,
        (lo[1] + hi[1]) / 2.0,
        (lo[2] + hi[2]) / 2.0,
    ];
    let radius = ecef
        .iter()
        .map(|p| distance(p, &center))
        .fold(0.0f64, f64::max);
    let occlusion = horizon_occlusion_point(&ecef, &center);

    let mut out = Vec::with_capacity(88 + n * 6 + mesh.triangles.len() * 6);
    for v in center {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&(min_h as f32).to_le_bytes());
    out.extend_from_slice(&(max_h as f32).to_le_bytes());
    for v in center {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&radius.to_le_bytes());
    for v in occlusion {
        out.extend_from_slice(&v.to_le_bytes());
    }

    // Vertex data: quantized u, v, height, zig-zag delta encoded
    let height_span = max_h - min_h;
    let quantize = |value: f64| -> i32 { (value * QM_MAX).round() as i32 };
    let us: Vec<i32> = positions.iter().map(|p| quantize(p[0])).collect();
    let vs: Vec<i32> = positions.iter().map(|p| quantize(p[1])).collect();
    let hs: Vec<i32> = positions
        .iter()
        .map(|p| {
            if height_span <= 0.0 {
                0
            } else {
                quantize((p[2] - min_h) / height_span)
            }
        })
        .collect();

    out.extend_from_slice(&(n as u32).to_le_bytes());
    for series in [&us, &vs, &hs] {
        let mut prev = 0i32;
        for &value in series.iter() {
            let delta = value - prev;
            out.extend_from_slice(&zigzag(delta).to_le_bytes());
            prev = value;
        }
    }

    // Triangle indices, high-water-mark encoded
    let wide = n > 65536;
    if wide {
        // The 32-bit index block must start 4-byte aligned
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    out.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
    let mut highest = 0u32;
    for tri in &triangles {
        for &idx in tri {
            let code = highest - idx;
            push_index(&mut out, code, wide);
            if code == 0 {
                highest += 1;
            }
        }
    }

    // Edge vertex lists: west, south, east, north
    for side in [Side::West, Side::South, Side::East, Side::North] {
        let edge = mesh.edge(side);
        out.extend_from_slice(&(edge.len() as u32).to_le_bytes());
        for v in edge {
            push_index(&mut out, remap[v.index as usize], wide);
        }
    }

    if !normals.is_empty() {
        out.push(EXT_VERTEX_NORMALS);
        out.extend_from_slice(&((n * 2) as u32).to_le_bytes());
        for normal in &normals {
            let (x, y) = oct_encode(*normal);
            out.push(x);
            out.push(y);
        }
    }

    Ok(out)
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

#[inline]
fn zigzag(v: i32) -> u16 {
    let v = v as i16;
    ((v << 1) ^ (v >> 15)) as u16
}

fn push_index(out: &mut Vec<u8>, value: u32, wide: bool) {
    if wide {
        out.extend_from_slice(&value.to_le_bytes());
    } else {
        out.extend_from_slice(&(value as u16).to_le_bytes());
    }
}

/// Horizon occlusion point in ellipsoid-scaled space: the point on the
/// ray through the bounding center from which the whole tile is below
/// the horizon.
fn horizon_occlusion_point(ecef: &[[f64; 3]], center: &[f64; 3]) -> [f64; 3] {
    let scale = [1.0 / WGS84_A, 1.0 / WGS84_A, 1.0 / WGS84_B];
    let sc = [center[0] * scale[0], center[1] * scale[1], center[2] * scale[2]];
    let sc_len = (sc[0] * sc[0] + sc[1] * sc[1] + sc[2] * sc[2]).sqrt();
    if sc_len <= 1e-12 {
        return [0.0, 0.0, 0.0];
    }
    let axis = [sc[0] / sc_len, sc[1] / sc_len, sc[2] / sc_len];

    let mut max_magnitude = 1.0f64;
    for p in ecef {
        let sp = [p[0] * scale[0], p[1] * scale[1], p[2] * scale[2]];
        let magnitude = (sp[0] * sp[0] + sp[1] * sp[1] + sp[2] * sp[2])
            .sqrt()
            .max(1.0);
        let direction = [sp[0] / magnitude, sp[1] / magnitude, sp[2] / magnitude];
        let cos_alpha = direction[0] * axis[0] + direction[1] * axis[1] + direction[2] * axis[2];
        let cross = [
            direction[1] * axis[2] - direction[2] * axis[1],
            direction[2] * axis[0] - direction[0] * axis[2],
            direction[0] * axis[1] - direction[1] * axis[0],
        ];
        let sin_alpha = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
        let cos_beta = 1.0 / magnitude;
        let sin_beta = (magnitude * magnitude - 1.0).max(0.0).sqrt() * cos_beta;
        let denominator = cos_alpha * cos_beta - sin_alpha * sin_beta;
        if denominator > 1e-12 {
            max_magnitude = max_magnitude.max(1.0 / denominator);
        }
    }
    [
        axis[0] * max_magnitude,
        axis[1] * max_magnitude,
        axis[2] * max_magnitude,
    ]
}

/// Octahedral encoding of a unit vector into two bytes
pub fn oct_encode(n: [f32; 3]) -> (u8, u8) {
    let l1 = n[0].abs() + n[1].abs() + n[2].abs();
    let (mut x, mut y) = if l1 <= 1e-12 {
        (0.0f32, 0.0f32)
    } else {
        (n[0] / l1, n[1] / l1)
    };
    if n[2] < 0.0 {
        let (ox, oy) = (x, y);
        x = (1.0 - oy.abs()) * sign_not_zero(ox);
        y = (1.0 - ox.abs()) * sign_not_zero(oy);
    }
    (to_snorm(x), to_snorm(y))
}

/// Inverse of [`oct_encode`], used by tests and by the stitcher when
/// comparing normals at quantized-mesh resolution
pub fn oct_decode(x: u8, y: u8) -> [f32; 3] {
    let fx = from_snorm(x);
    let fy = from_snorm(y);
    let fz = 1.0 - (fx.abs() + fy.abs());
    let mut n = [fx, fy, fz];
    if fz < 0.0 {
        let (ox, oy) = (n[0], n[1]);
        n[0] = (1.0 - oy.abs()) * sign_not_zero(ox);
        n[1] = (1.0 - ox.abs()) * sign_not_zero(oy);
    }
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len <= 1e-12 {
        n
    } else {
        [n[0] / len, n[1] / len, n[2] / len]
    }
}

#[inline]
fn sign_not_zero(v: f32) -> f32 {
    if v < 0.0 {
        -1.0
    } else {
        1.0
    }
}

#[inline]
fn to_snorm(v: f32) -> u8 {
    ((v.clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0).round() as u8
}

#[inline]
fn from_snorm(v: u8) -> f32 {
    (v as f32 / 255.0) * 2.0 - 1.0
}
