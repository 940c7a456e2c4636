//! Vertex normal computation
//!
//! Normals are computed in the ECEF frame on the WGS84 ellipsoid:
//! positions are lifted from tile-normalized (u, v, h) to cartesian,
//! face normals are area-weighted onto their vertices and the sums are
//! renormalized. Degenerate faces contribute nothing.

use crate::core::tms::{GeoBounds, WGS84_A, WGS84_B};

/// Geocentric cartesian coordinates for a geodetic position
pub fn to_ecef(lon_deg: f64, lat_deg: f64, height: f64) -> [f64; 3] {
    let lon = lon_deg.to_radians();
    let lat = lat_deg.to_radians();
    let e2 = 1.0 - (WGS84_B * WGS84_B) / (WGS84_A * WGS84_A);
    let sin_lat = lat.sin();
    let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    [
        (n + height) * lat.cos() * lon.cos(),
        (n + height) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + height) * sin_lat,
    ]
}

/// The outward ellipsoid surface normal at a geodetic position
pub fn geodetic_surface_normal(lon_deg: f64, lat_deg: f64) -> [f32; 3] {
    let lon = lon_deg.to_radians();
    let lat = lat_deg.to_radians();
    let cos_lat = lat.cos();
    [
        (cos_lat * lon.cos()) as f32,
        (cos_lat * lon.sin()) as f32,
        lat.sin() as f32,
    ]
}

/// Per-vertex normals from area-weighted face normals.
///
/// `positions` are tile-normalized (u, v, h); `bounds` places them on the
/// ellipsoid. Faces below the area floor are skipped; vertices that end
/// up with no contributing face fall back to the geodetic normal.
pub fn vertex_normals(
    positions: &[[f64; 3]],
    triangles: &[[u32; 3]],
    bounds: &GeoBounds,
) -> Vec<[f32; 3]> {
    let cartesian: Vec<[f64; 3]> = positions
        .iter()
        .map(|p| {
            let lon = bounds.west + p[0] * bounds.width();
            let lat = bounds.south + p[1] * bounds.height();
            to_ecef(lon, lat, p[2])
        })
        .collect();

    let mut sums = vec![[0.0f64; 3]; positions.len()];
    for tri in triangles {
        let a = cartesian[tri[0] as usize];
        let b = cartesian[tri[1] as usize];
        let c = cartesian[tri[2] as usize];
        let ab = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
        let ac = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
        // Cross product length is twice the face area, so this weights
        // each face normal by area without a separate normalize step
        let face = [
            ab[1] * ac[2] - ab[2] * ac[1],
            ab[2] * ac[0] - ab[0] * ac[2],
            ab[0] * ac[1] - ab[1] * ac[0],
        ];
        let norm = (face[0] * face[0] + face[1] * face[1] + face[2] * face[2]).sqrt();
        if norm <= 1e-8 {
            continue;
        }
        for &i in tri {
            let s = &mut sums[i as usize];
            s[0] += face[0];
            s[1] += face[1];
            s[2] += face[2];
        }
    }

    sums.iter()
        .enumerate()
        .map(|(i, s)| {
            let norm = (s[0] * s[0] + s[1] * s[1] + s[2] * s[2]).sqrt();
            if norm <= 1e-8 {
                let lon = bounds.west + positions[i][0] * bounds.width();
                let lat = bounds.south + positions[i][1] * bounds.height();
                geodetic_surface_normal(lon, lat)
            } else {
                [
                    (s[0] / norm) as f32,
                    (s[1] / norm) as f32,
                    (s[2] / norm) as f32,
                ]
            }
        })
        .collect()
}

/// Renormalize a possibly non-unit vector, leaving zero vectors alone
pub fn normalize(n: [f32; 3]) -> [f32; 3] {
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len <= 1e-8 {
        n
    } else {
        [n[0] / len, n[1] / len, n[2] / len]
    }
}
