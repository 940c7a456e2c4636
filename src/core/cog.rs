//! COG reader facade
//!
//! Reads rectangular windows from a Cloud Optimized GeoTIFF at a target
//! resolution. The byte layer does ranged I/O (file seeks locally, HTTP
//! Range requests remotely), the decode layer picks the overview nearest
//! the requested resolution and caches decoded levels per dataset, and
//! the sampling layer applies one of the fixed resampling kernels while
//! substituting NoData with the caller-supplied constant.
//!
//! Datasets are assumed to be georeferenced in geographic degrees
//! (ModelPixelScale + ModelTiepoint); reprojection is out of scope.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use crate::core::error::{Error, Result};
use crate::core::tms::GeoBounds;
use crate::core::window::ElevationGrid;

/// Default ceiling on source pixels read for a single window
pub const DEFAULT_PIXEL_BUDGET: usize = 16 * 1024 * 1024;

/// Fetch granularity for ranged HTTP reads
const HTTP_CHUNK: u64 = 256 * 1024;

/// Global HTTP client for ranged COG reads, shared across datasets.
/// Only ever used from worker threads, never on the async reactor.
static RANGE_CLIENT: Lazy<reqwest::blocking::Client> = Lazy::new(|| {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("ctod/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to create HTTP client")
});

/// Resampling kernels, matching the fixed set accepted over the API.
/// `None` reads the nearest native overview without kernel filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resampling {
    None,
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Gauss,
    Rms,
}

impl Resampling {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "cubic" => Ok(Self::Cubic),
            "cubic_spline" => Ok(Self::CubicSpline),
            "lanczos" => Ok(Self::Lanczos),
            "average" => Ok(Self::Average),
            "mode" => Ok(Self::Mode),
            "gauss" => Ok(Self::Gauss),
            "rms" => Ok(Self::Rms),
            other => Err(Error::BadRequest(format!(
                "unknown resampling method '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Cubic => "cubic",
            Self::CubicSpline => "cubic_spline",
            Self::Lanczos => "lanczos",
            Self::Average => "average",
            Self::Mode => "mode",
            Self::Gauss => "gauss",
            Self::Rms => "rms",
        }
    }
}

/// Static facts about an opened dataset
#[derive(Debug, Clone)]
pub struct CogInfo {
    /// Native raster size
    pub width: usize,
    pub height: usize,
    /// Geographic envelope in degrees
    pub bounds: GeoBounds,
    /// NoData value declared by the dataset, if any
    pub nodata: Option<f64>,
    /// Raster dimensions per level, index 0 = native
    pub levels: Vec<(usize, usize)>,
}

/// The windowed-read contract the factory consumes. Production reads go
/// through [`CogDataset`]; tests inject synthetic sources.
pub trait WindowSource: Send + Sync {
    fn info(&self) -> &CogInfo;

    /// Read a window into a dense `width x height` grid. Bounds fully
    /// outside the dataset yield an empty-flagged grid, not an error.
    fn read_window(
        &self,
        bounds: &GeoBounds,
        width: usize,
        height: usize,
        resampling: Resampling,
        no_data: f32,
    ) -> Result<ElevationGrid>;
}

/// Where the COG bytes come from
#[derive(Debug, Clone)]
enum RasterSource {
    File(String),
    Http(String),
}

impl RasterSource {
    fn resolve(path: &str) -> Self {
        if path.starts_with("http://") || path.starts_with("https://") {
            Self::Http(path.to_string())
        } else {
            Self::File(path.to_string())
        }
    }

    fn open(&self) -> Result<ByteSource> {
        match self {
            Self::File(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|e| Error::SourceUnavailable(format!("{}: {}", path, e)))?;
                Ok(ByteSource::File(std::io::BufReader::new(file)))
            }
            Self::Http(url) => Ok(ByteSource::Http(HttpRangeReader::open(url)?)),
        }
    }
}

/// Seekable byte access to a COG, local or remote
enum ByteSource {
    File(std::io::BufReader<std::fs::File>),
    Http(HttpRangeReader),
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::File(r) => r.read(buf),
            Self::Http(r) => r.read(buf),
        }
    }
}

impl Seek for ByteSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::File(r) => r.seek(pos),
            Self::Http(r) => r.seek(pos),
        }
    }
}

/// `Read + Seek` over HTTP Range requests, buffered in fixed chunks so
/// the TIFF decoder's small header reads do not each cost a round trip.
struct HttpRangeReader {
    url: String,
    len: u64,
    pos: u64,
    buf: Vec<u8>,
    buf_start: u64,
}

impl HttpRangeReader {
    fn open(url: &str) -> Result<Self> {
        let response = RANGE_CLIENT
            .head(url)
            .send()
            .map_err(|e| Error::SourceUnavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::SourceUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }
        let len = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                Error::SourceUnavailable(format!("{}: missing content-length", url))
            })?;
        Ok(Self {
            url: url.to_string(),
            len,
            pos: 0,
            buf: Vec::new(),
            buf_start: 0,
        })
    }

    fn fill(&mut self) -> std::io::Result<()> {
        let start = self.pos;
        let end = (start + HTTP_CHUNK).min(self.len);
        let response = RANGE_CLIENT
            .get(&self.url)
            .header("Range", format!("bytes={}-{}", start, end - 1))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let bytes = response
            .bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.buf = bytes.to_vec();
        self.buf_start = start;
        Ok(())
    }
}

impl Read for HttpRangeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let in_buf = self.pos >= self.buf_start
            && self.pos < self.buf_start + self.buf.len() as u64;
        if !in_buf {
            self.fill()?;
        }
        let offset = (self.pos - self.buf_start) as usize;
        let available = self.buf.len() - offset;
        let n = available.min(out.len());
        out[..n].copy_from_slice(&self.buf[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpRangeReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.len as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// One decoded overview level
#[derive(Debug)]
struct LevelRaster {
    width: usize,
    height: usize,
    data: Vec<f32>,
    nodata_mask: Vec<bool>,
}

/// An opened Cloud Optimized GeoTIFF.
///
/// Decoded levels are cached inside the dataset so repeated windows at
/// the same zoom reuse the raster; the byte source is reopened per decode
/// because TIFF decoders are not shareable across threads.
#[derive(Debug)]
pub struct CogDataset {
    source: RasterSource,
    info: CogInfo,
    levels: Mutex<HashMap<usize, Arc<LevelRaster>>>,
    unsafe_allowed: bool,
    pixel_budget: usize,
}

impl CogDataset {
    pub fn open(path: &str, unsafe_allowed: bool) -> Result<Self> {
        Self::open_with_budget(path, unsafe_allowed, DEFAULT_PIXEL_BUDGET)
    }

    pub fn open_with_budget(
        path: &str,
        unsafe_allowed: bool,
        pixel_budget: usize,
    ) -> Result<Self> {
        let source = RasterSource::resolve(path);
        let reader = source.open()?;
        let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());

        let (width, height) = decoder.dimensions()?;
        let scale = decoder
            .get_tag_f64_vec(Tag::ModelPixelScaleTag)
            .map_err(|_| {
                Error::SourceUnavailable(format!("{}: missing ModelPixelScale tag", path))
            })?;
        let tiepoint = decoder
            .get_tag_f64_vec(Tag::ModelTiepointTag)
            .map_err(|_| {
                Error::SourceUnavailable(format!("{}: missing ModelTiepoint tag", path))
            })?;
        if scale.len() < 2 || tiepoint.len() < 5 {
            return Err(Error::SourceUnavailable(format!(
                "{}: malformed georeferencing tags",
                path
            )));
        }
        let west = tiepoint[3];
        let north = tiepoint[4];
        let bounds = GeoBounds {
            west,
            south: north - scale[1] * height as f64,
            east: west + scale[0] * width as f64,
            north,
        };
        let nodata = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|s| s.trim().trim_end_matches('\0').parse::<f64>().ok());

        let mut levels = vec![(width as usize, height as usize)];
        while decoder.more_images() {
            decoder.next_image()?;
            let (w, h) = decoder.dimensions()?;
            levels.push((w as usize, h as usize));
        }

        Ok(Self {
            source,
            info: CogInfo {
                width: width as usize,
                height: height as usize,
                bounds,
                nodata,
                levels,
            },
            levels: Mutex::new(HashMap::new()),
            unsafe_allowed,
            pixel_budget,
        })
    }

    /// Pick the overview to read. Normal kernels take the coarsest level
    /// that still meets the target resolution; `none` takes the level
    /// whose native resolution is nearest the target.
    fn choose_level(&self, target_px_deg: f64, resampling: Resampling) -> usize {
        let dataset_width_deg = self.info.bounds.width();
        let px_size = |level: usize| dataset_width_deg / self.info.levels[level].0 as f64;

        if resampling == Resampling::None {
            return (0..self.info.levels.len())
                .min_by(|a, b| {
                    let da = (px_size(*a).ln() - target_px_deg.ln()).abs();
                    let db = (px_size(*b).ln() - target_px_deg.ln()).abs();
                    da.total_cmp(&db)
                })
                .unwrap_or(0);
        }

        let mut chosen = 0;
        for level in 0..self.info.levels.len() {
            if px_size(level) <= target_px_deg * 1.0001 {
                chosen = level;
            } else {
                break;
            }
        }
        chosen
    }

    /// Source pixels a window covers at a level
    fn window_pixels(&self, bounds: &GeoBounds, level: usize) -> usize {
        let (lw, lh) = self.info.levels[level];
        let clipped_w = bounds.width().min(self.info.bounds.width());
        let clipped_h = bounds.height().min(self.info.bounds.height());
        let cols = (clipped_w / self.info.bounds.width() * lw as f64).ceil() as usize;
        let rows = (clipped_h / self.info.bounds.height() * lh as f64).ceil() as usize;
        cols.max(1) * rows.max(1)
    }

    fn level_raster(&self, level: usize) -> Result<Arc<LevelRaster>> {
        if let Some(raster) = self.levels.lock().unwrap().get(&level) {
            return Ok(raster.clone());
        }

        let reader = self.source.open()?;
        let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());
        for _ in 0..level {
            decoder.next_image()?;
        }
        let (w, h) = decoder.dimensions()?;
        let data = match decoder.read_image()? {
            DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::F32(v) => v,
            DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            _ => {
                return Err(Error::SourceUnavailable(format!(
                    "level {} has an unsupported sample format",
                    level
                )))
            }
        };
        let expected = (w as usize) * (h as usize);
        if data.len() != expected {
            return Err(Error::SourceUnavailable(format!(
                "level {} decoded {} samples, expected {} (multi-band DEMs are not supported)",
                level,
                data.len(),
                expected
            )));
        }
        let nodata_mask = match self.info.nodata {
            Some(nd) => data.iter().map(|&v| v as f64 == nd).collect(),
            None => vec![false; data.len()],
        };

        let raster = Arc::new(LevelRaster {
            width: w as usize,
            height: h as usize,
            data,
            nodata_mask,
        });
        self.levels
            .lock()
            .unwrap()
            .insert(level, raster.clone());
        Ok(raster)
    }
}

impl WindowSource for CogDataset {
    fn info(&self) -> &CogInfo {
        &self.info
    }

    fn read_window(
        &self,
        bounds: &GeoBounds,
        width: usize,
        height: usize,
        resampling: Resampling,
        no_data: f32,
    ) -> Result<ElevationGrid> {
        if !bounds.intersects(&self.info.bounds) {
            return Ok(ElevationGrid::empty(*bounds, resampling));
        }

        let target_px_deg = bounds.width() / width as f64;
        let mut level = self.choose_level(target_px_deg, resampling);
        while self.window_pixels(bounds, level) > self.pixel_budget
            && level + 1 < self.info.levels.len()
        {
            level += 1;
        }
        if self.window_pixels(bounds, level) > self.pixel_budget && !self.unsafe_allowed {
            return Err(Error::UnsafeRequest(format!(
                "window needs {} source pixels at the coarsest overview, budget is {}; \
                 generate more overviews or run with --unsafe",
                self.window_pixels(bounds, level),
                self.pixel_budget
            )));
        }

        let raster = self.level_raster(level)?;
        Ok(sample_window(
            &raster,
            &self.info.bounds,
            bounds,
            width,
            height,
            resampling,
            no_data,
        ))
    }
}

/// Pool of opened datasets, one per COG path.
///
/// Opening parses headers (and for remote COGs does a round trip), so
/// datasets are opened once and shared; their decoded-level caches make
/// reuse worthwhile. Tests register synthetic sources under made-up
/// paths and the factory never knows the difference.
pub struct DatasetPool {
    unsafe_allowed: bool,
    pixel_budget: usize,
    entries: Mutex<HashMap<String, Arc<dyn WindowSource>>>,
}

impl DatasetPool {
    pub fn new(unsafe_allowed: bool) -> Self {
        Self::with_budget(unsafe_allowed, DEFAULT_PIXEL_BUDGET)
    }

    pub fn with_budget(unsafe_allowed: bool, pixel_budget: usize) -> Self {
        Self {
            unsafe_allowed,
            pixel_budget,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inject a window source under a path, replacing any previous one
    pub fn register(&self, path: &str, source: Arc<dyn WindowSource>) {
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), source);
    }

    /// Fetch or open the dataset for a path. Blocking; call from a
    /// worker thread, not the reactor.
    pub fn open_blocking(&self, path: &str) -> Result<Arc<dyn WindowSource>> {
        if let Some(source) = self.entries.lock().unwrap().get(path) {
            return Ok(source.clone());
        }
        let opened: Arc<dyn WindowSource> = Arc::new(CogDataset::open_with_budget(
            path,
            self.unsafe_allowed,
            self.pixel_budget,
        )?);
        let mut entries = self.entries.lock().unwrap();
        // Two threads may race to open the same path; first insert wins
        Ok(entries
            .entry(path.to_string())
            .or_insert(opened)
            .clone())
    }
}

/// Resample a window out of a decoded level
fn sample_window(
    raster: &LevelRaster,
    dataset_bounds: &GeoBounds,
    window: &GeoBounds,
    width: usize,
    height: usize,
    resampling: Resampling,
    no_data: f32,
) -> ElevationGrid {
    let px_w = dataset_bounds.width() / raster.width as f64;
    let px_h = dataset_bounds.height() / raster.height as f64;
    let out_px_w = window.width() / width as f64;
    let out_px_h = window.height() / height as f64;

    let mut heights = Vec::with_capacity(width * height);
    let mut mask = Vec::with_capacity(width * height);

    for row in 0..height {
        let lat = window.north - (row as f64 + 0.5) * out_px_h;
        for col in 0..width {
            let lon = window.west + (col as f64 + 0.5) * out_px_w;
            if !dataset_bounds.contains(lon, lat) {
                heights.push(no_data);
                mask.push(true);
                continue;
            }
            let sc = (lon - dataset_bounds.west) / px_w - 0.5;
            let sr = (dataset_bounds.north - lat) / px_h - 0.5;
            let (value, was_nodata) = match resampling {
                Resampling::None | Resampling::Nearest => kernel_nearest(raster, sc, sr, no_data),
                Resampling::Bilinear => kernel_bilinear(raster, sc, sr, no_data),
                Resampling::Cubic => kernel_separable(raster, sc, sr, no_data, 2, catmull_rom),
                Resampling::CubicSpline => kernel_separable(raster, sc, sr, no_data, 2, b_spline),
                Resampling::Lanczos => kernel_separable(raster, sc, sr, no_data, 3, lanczos3),
                Resampling::Gauss => kernel_separable(raster, sc, sr, no_data, 2, gauss),
                Resampling::Average => {
                    kernel_footprint(raster, sc, sr, out_px_w / px_w, out_px_h / px_h, no_data, Footprint::Average)
                }
                Resampling::Rms => {
                    kernel_footprint(raster, sc, sr, out_px_w / px_w, out_px_h / px_h, no_data, Footprint::Rms)
                }
                Resampling::Mode => {
                    kernel_footprint(raster, sc, sr, out_px_w / px_w, out_px_h / px_h, no_data, Footprint::Mode)
                }
            };
            heights.push(value);
            mask.push(was_nodata);
        }
    }

    ElevationGrid::new(width, height, heights, *window, resampling, mask)
}

#[inline]
fn fetch(raster: &LevelRaster, col: i64, row: i64, no_data: f32) -> (f32, bool) {
    let c = col.clamp(0, raster.width as i64 - 1) as usize;
    let r = row.clamp(0, raster.height as i64 - 1) as usize;
    let idx = r * raster.width + c;
    if raster.nodata_mask[idx] {
        (no_data, true)
    } else {
        (raster.data[idx], false)
    }
}

fn kernel_nearest(raster: &LevelRaster, sc: f64, sr: f64, no_data: f32) -> (f32, bool) {
    fetch(raster, sc.round() as i64, sr.round() as i64, no_data)
}

fn kernel_bilinear(raster: &LevelRaster, sc: f64, sr: f64, no_data: f32) -> (f32, bool) {
    let c0 = sc.floor() as i64;
    let r0 = sr.floor() as i64;
    let fc = (sc - c0 as f64) as f32;
    let fr = (sr - r0 as f64) as f32;
    let (v00, _) = fetch(raster, c0, r0, no_data);
    let (v10, _) = fetch(raster, c0 + 1, r0, no_data);
    let (v01, _) = fetch(raster, c0, r0 + 1, no_data);
    let (v11, _) = fetch(raster, c0 + 1, r0 + 1, no_data);
    let top = v00 * (1.0 - fc) + v10 * fc;
    let bot = v01 * (1.0 - fc) + v11 * fc;
    let (_, nearest_nd) = kernel_nearest(raster, sc, sr, no_data);
    (top * (1.0 - fr) + bot * fr, nearest_nd)
}

/// Catmull-Rom cubic
fn catmull_rom(x: f64) -> f64 {
    let x = x.abs();
    if x < 1.0 {
        1.5 * x * x * x - 2.5 * x * x + 1.0
    } else if x < 2.0 {
        -0.5 * x * x * x + 2.5 * x * x - 4.0 * x + 2.0
    } else {
        0.0
    }
}

/// Cubic B-spline
fn b_spline(x: f64) -> f64 {
    let x = x.abs();
    if x < 1.0 {
        (4.0 + x * x * (3.0 * x - 6.0)) / 6.0
    } else if x < 2.0 {
        let t = 2.0 - x;
        t * t * t / 6.0
    } else {
        0.0
    }
}

fn lanczos3(x: f64) -> f64 {
    let x = x.abs();
    if x < 1e-9 {
        1.0
    } else if x < 3.0 {
        let px = std::f64::consts::PI * x;
        3.0 * px.sin() * (px / 3.0).sin() / (px * px)
    } else {
        0.0
    }
}

fn gauss(x: f64) -> f64 {
    (-0.5 * x * x).exp()
}

/// Separable kernel with the given half-width in source pixels
fn kernel_separable(
    raster: &LevelRaster,
    sc: f64,
    sr: f64,
    no_data: f32,
    radius: i64,
    kernel: fn(f64) -> f64,
) -> (f32, bool) {
    let c0 = sc.floor() as i64;
    let r0 = sr.floor() as i64;
    let mut sum = 0.0f64;
    let mut weight = 0.0f64;
    for row in (r0 - radius + 1)..=(r0 + radius) {
        let wy = kernel(sr - row as f64);
        if wy == 0.0 {
            continue;
        }
        for col in (c0 - radius + 1)..=(c0 + radius) {
            let wx = kernel(sc - col as f64);
            if wx == 0.0 {
                continue;
            }
            let (v, _) = fetch(raster, col, row, no_data);
            sum += v as f64 * wx * wy;
            weight += wx * wy;
        }
    }
    let (_, nearest_nd) = kernel_nearest(raster, sc, sr, no_data);
    if weight.abs() < 1e-12 {
        (kernel_nearest(raster, sc, sr, no_data).0, nearest_nd)
    } else {
        ((sum / weight) as f32, nearest_nd)
    }
}

enum Footprint {
    Average,
    Rms,
    Mode,
}

/// Aggregate all source cells under the target pixel's footprint
fn kernel_footprint(
    raster: &LevelRaster,
    sc: f64,
    sr: f64,
    scale_x: f64,
    scale_y: f64,
    no_data: f32,
    op: Footprint,
) -> (f32, bool) {
    let half_w = (scale_x / 2.0).max(0.5);
    let half_h = (scale_y / 2.0).max(0.5);
    let c0 = (sc - half_w).round() as i64;
    let c1 = (sc + half_w).round() as i64;
    let r0 = (sr - half_h).round() as i64;
    let r1 = (sr + half_h).round() as i64;

    let mut values = Vec::new();
    for row in r0..=r1 {
        for col in c0..=c1 {
            values.push(fetch(raster, col, row, no_data).0);
        }
    }
    let (_, nearest_nd) = kernel_nearest(raster, sc, sr, no_data);
    if values.is_empty() {
        return (no_data, nearest_nd);
    }
    let value = match op {
        Footprint::Average => values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64,
        Footprint::Rms => {
            (values.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / values.len() as f64)
                .sqrt()
        }
        Footprint::Mode => {
            let mut counts: HashMap<u32, usize> = HashMap::new();
            for v in &values {
                *counts.entry(v.to_bits()).or_insert(0) += 1;
            }
            let best = counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                .map(|(bits, _)| f32::from_bits(bits))
                .unwrap_or(no_data);
            best as f64
        }
    };
    (value as f32, nearest_nd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> LevelRaster {
        let mut data = Vec::with_capacity(width * height);
        for r in 0..height {
            for c in 0..width {
                data.push(f(c, r));
            }
        }
        LevelRaster {
            width,
            height,
            nodata_mask: vec![false; width * height],
            data,
        }
    }

    fn unit_bounds() -> GeoBounds {
        GeoBounds {
            west: 0.0,
            south: 0.0,
            east: 1.0,
            north: 1.0,
        }
    }

    #[test]
    fn test_resampling_names_roundtrip() {
        for name in [
            "none",
            "nearest",
            "bilinear",
            "cubic",
            "cubic_spline",
            "lanczos",
            "average",
            "mode",
            "gauss",
            "rms",
        ] {
            assert_eq!(Resampling::from_name(name).unwrap().name(), name);
        }
        assert!(Resampling::from_name("sinc").is_err());
    }

    #[test]
    fn test_nearest_identity_window() {
        let src = raster(8, 8, |c, r| (r * 8 + c) as f32);
        let grid = sample_window(
            &src,
            &unit_bounds(),
            &unit_bounds(),
            8,
            8,
            Resampling::Nearest,
            0.0,
        );
        assert_eq!(grid.heights, src.data);
        assert!(grid.nodata_mask.iter().all(|&m| !m));
    }

    #[test]
    fn test_bilinear_constant_field() {
        let src = raster(16, 16, |_, _| 5.0);
        let grid = sample_window(
            &src,
            &unit_bounds(),
            &GeoBounds {
                west: 0.25,
                south: 0.25,
                east: 0.75,
                north: 0.75,
            },
            32,
            32,
            Resampling::Bilinear,
            0.0,
        );
        for h in &grid.heights {
            assert!((h - 5.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_outside_cells_become_nodata() {
        let src = raster(8, 8, |_, _| 1.0);
        // Window hangs half off the western dataset edge
        let grid = sample_window(
            &src,
            &unit_bounds(),
            &GeoBounds {
                west: -0.5,
                south: 0.0,
                east: 0.5,
                north: 1.0,
            },
            8,
            8,
            Resampling::Nearest,
            -9999.0,
        );
        for row in 0..8 {
            for col in 0..4 {
                assert!(grid.nodata_mask[row * 8 + col]);
                assert_eq!(grid.at(col, row), -9999.0);
            }
            for col in 4..8 {
                assert!(!grid.nodata_mask[row * 8 + col]);
                assert_eq!(grid.at(col, row), 1.0);
            }
        }
    }

    #[test]
    fn test_nodata_substitution() {
        let mut src = raster(4, 4, |_, _| 7.0);
        src.data[5] = -32768.0;
        src.nodata_mask[5] = true;
        let grid = sample_window(
            &src,
            &unit_bounds(),
            &unit_bounds(),
            4,
            4,
            Resampling::Nearest,
            0.0,
        );
        assert_eq!(grid.at(1, 1), 0.0);
        assert!(grid.nodata_mask[1 * 4 + 1]);
        assert_eq!(grid.at(0, 0), 7.0);
    }

    #[test]
    fn test_average_downsample() {
        // 4x4 checkerboard of 0 and 10 averaged 2x down gives 5 everywhere
        let src = raster(4, 4, |c, r| if (c + r) % 2 == 0 { 0.0 } else { 10.0 });
        let grid = sample_window(
            &src,
            &unit_bounds(),
            &unit_bounds(),
            2,
            2,
            Resampling::Average,
            0.0,
        );
        for h in &grid.heights {
            assert!((h - 5.0).abs() < 2.0, "got {}", h);
        }
    }

    #[test]
    fn test_mode_majority() {
        let src = raster(4, 4, |c, _| if c < 3 { 2.0 } else { 9.0 });
        let grid = sample_window(
            &src,
            &unit_bounds(),
            &GeoBounds {
                west: 0.0,
                south: 0.0,
                east: 0.75,
                north: 1.0,
            },
            1,
            1,
            Resampling::Mode,
            0.0,
        );
        assert_eq!(grid.at(0, 0), 2.0);
    }

    /// Write a small georeferenced GeoTIFF for facade tests
    fn write_geotiff(path: &std::path::Path, size: u32, f: impl Fn(u32, u32) -> f32) {
        use tiff::encoder::{colortype, TiffEncoder};

        let file = std::fs::File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(std::io::BufWriter::new(file)).unwrap();
        let mut image = encoder
            .new_image::<colortype::Gray32Float>(size, size)
            .unwrap();
        let degrees_per_px = 1.0 / size as f64;
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &[degrees_per_px, degrees_per_px, 0.0][..])
            .unwrap();
        // Anchor the upper-left corner at 10E 46N
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, 10.0, 46.0, 0.0][..])
            .unwrap();
        let mut data = Vec::with_capacity((size * size) as usize);
        for row in 0..size {
            for col in 0..size {
                data.push(f(col, row));
            }
        }
        image.write_data(&data).unwrap();
    }

    #[test]
    fn test_geotiff_open_reads_georeferencing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_geotiff(&path, 64, |c, r| (c + r) as f32);

        let dataset = CogDataset::open(path.to_str().unwrap(), false).unwrap();
        let info = dataset.info();
        assert_eq!(info.width, 64);
        assert_eq!(info.height, 64);
        assert!((info.bounds.west - 10.0).abs() < 1e-9);
        assert!((info.bounds.north - 46.0).abs() < 1e-9);
        assert!((info.bounds.east - 11.0).abs() < 1e-9);
        assert!((info.bounds.south - 45.0).abs() < 1e-9);
        assert_eq!(info.levels.len(), 1);
    }

    #[test]
    fn test_geotiff_window_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_geotiff(&path, 64, |c, _| c as f32);

        let dataset = CogDataset::open(path.to_str().unwrap(), false).unwrap();
        let window = GeoBounds {
            west: 10.25,
            south: 45.25,
            east: 10.75,
            north: 45.75,
        };
        let grid = dataset
            .read_window(&window, 32, 32, Resampling::Bilinear, 0.0)
            .unwrap();
        assert_eq!(grid.width, 32);
        assert!(!grid.out_of_bounds);
        // Columns ramp west to east: the window starts a quarter in
        let west_edge = grid.at(0, 0);
        let east_edge = grid.at(31, 0);
        assert!(west_edge >= 14.0 && west_edge <= 18.0, "got {}", west_edge);
        assert!(east_edge >= 46.0 && east_edge <= 50.0, "got {}", east_edge);

        // Fully outside the footprint flags instead of failing
        let far = GeoBounds {
            west: 100.0,
            south: 0.0,
            east: 101.0,
            north: 1.0,
        };
        let empty = dataset
            .read_window(&far, 8, 8, Resampling::Bilinear, 0.0)
            .unwrap();
        assert!(empty.out_of_bounds);
    }

    #[test]
    fn test_pixel_budget_guards_unsafe_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_geotiff(&path, 64, |_, _| 0.0);
        let window = GeoBounds {
            west: 10.0,
            south: 45.0,
            east: 11.0,
            north: 46.0,
        };

        let guarded =
            CogDataset::open_with_budget(path.to_str().unwrap(), false, 100).unwrap();
        let err = guarded
            .read_window(&window, 256, 256, Resampling::Bilinear, 0.0)
            .unwrap_err();
        assert_eq!(err.kind(), "UnsafeRequest");

        let unguarded =
            CogDataset::open_with_budget(path.to_str().unwrap(), true, 100).unwrap();
        assert!(unguarded
            .read_window(&window, 256, 256, Resampling::Bilinear, 0.0)
            .is_ok());
    }

    #[test]
    fn test_missing_file_is_source_unavailable() {
        let err = CogDataset::open("/nonexistent/missing.tif", false).unwrap_err();
        assert_eq!(err.kind(), "SourceUnavailable");
    }

    #[test]
    fn test_kernels_are_partition_of_unity_near_center() {
        // A constant field must stay constant under every kernel
        let src = raster(16, 16, |_, _| 3.25);
        for resampling in [
            Resampling::Cubic,
            Resampling::CubicSpline,
            Resampling::Lanczos,
            Resampling::Gauss,
        ] {
            let grid = sample_window(
                &src,
                &unit_bounds(),
                &GeoBounds {
                    west: 0.3,
                    south: 0.3,
                    east: 0.7,
                    north: 0.7,
                },
                9,
                9,
                resampling,
                0.0,
            );
            for h in &grid.heights {
                assert!((h - 3.25).abs() < 1e-3, "{:?}: got {}", resampling, h);
            }
        }
    }
}
