//! Terrain factory
//!
//! Orchestrates one tile request end to end: disk-cache probe, the
//! empty-tile fast path, planning the nine COG windows (self plus eight
//! neighbors), fanning the fetches out through the coalescer, meshing
//! every present window on the worker pool, stitching the self mesh
//! against its neighbors, encoding and persisting.
//!
//! Failure policy: anything wrong with the self window is fatal for the
//! request; a failing neighbor is soft and treated as absent; a meshing
//! failure is fatal; a disk-cache write failure is logged and ignored.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::core::cache::{WindowCache, DEFAULT_CACHE_BYTES};
use crate::core::coalescer::Coalescer;
use crate::core::cog::{DatasetPool, Resampling, WindowSource};
use crate::core::disk_cache::TileDiskCache;
use crate::core::error::{Error, Result};
use crate::core::meshing::{self, DetailTables, MeshParams, MeshingMethod};
use crate::core::qmesh;
use crate::core::stitch::{self, NeighborSet};
use crate::core::tms::{neighbor, Direction, GeoBounds, TileKey, TileMatrixSet};
use crate::core::window::{DatasetFingerprint, ElevationGrid, WindowKey};
use crate::core::workers::WorkerPool;

pub const CONTENT_TYPE: &str = "application/vnd.quantized-mesh";
pub const CONTENT_TYPE_NORMALS: &str = "application/vnd.quantized-mesh;extensions=octvertexnormals";

/// Default wall-clock budget for one tile request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything that parameterizes one tile request, resolved from query
/// parameters or a dataset config by the server layer.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub tms: TileMatrixSet,
    /// Internal tile index (already flipped from the Cesium Y axis)
    pub tile: TileKey,
    pub cog: String,
    pub min_zoom: u8,
    pub resampling: Resampling,
    pub no_data: f32,
    pub method: MeshingMethod,
    pub tables: DetailTables,
    pub skip_cache: bool,
    pub with_normals: bool,
}

impl TileRequest {
    pub fn fingerprint(&self) -> DatasetFingerprint {
        DatasetFingerprint::compute(&self.cog, self.no_data, &self.tables)
    }

    fn content_type(&self) -> &'static str {
        if self.with_normals {
            CONTENT_TYPE_NORMALS
        } else {
            CONTENT_TYPE
        }
    }
}

/// A fully-encoded terrain tile ready to serve
#[derive(Debug, Clone)]
pub struct TileArtifact {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub etag: String,
    pub created_at: SystemTime,
}

impl TileArtifact {
    fn new(bytes: Vec<u8>, content_type: &'static str) -> Self {
        let digest = Sha256::digest(&bytes);
        let etag = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            bytes,
            content_type,
            etag,
            created_at: SystemTime::now(),
        }
    }
}

/// Per-request pipeline stage, logged on every transition. Stages run
/// strictly in order and are never re-entered; an error at any stage
/// short-circuits the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Planning,
    Fetching,
    Meshing,
    Stitching,
    Encoding,
    Persisting,
    Done,
}

fn enter(stage: Stage, tile: &TileKey) {
    tracing::debug!(tile = %tile, stage = ?stage, "tile request stage");
}

/// Tunables for the factory; the defaults match a production server
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Byte budget of the in-memory processed-window cache
    pub cache_bytes: usize,
    /// Wall-clock budget per tile request
    pub request_timeout: Duration,
    /// CPU worker threads; zero means one per logical core
    pub worker_threads: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_CACHE_BYTES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            worker_threads: 0,
        }
    }
}

pub struct TerrainFactory {
    datasets: Arc<DatasetPool>,
    coalescer: Arc<Coalescer>,
    workers: Arc<WorkerPool>,
    disk_cache: Option<Arc<TileDiskCache>>,
    /// Admission bound: requests running plus twice the pool size queued
    admission: Arc<Semaphore>,
    timeout: Duration,
}

impl TerrainFactory {
    pub fn new(
        datasets: DatasetPool,
        disk_cache: Option<TileDiskCache>,
        config: FactoryConfig,
    ) -> Result<Self> {
        let workers = if config.worker_threads == 0 {
            WorkerPool::new()?
        } else {
            WorkerPool::with_threads(config.worker_threads)?
        };
        let admission = Arc::new(Semaphore::new(workers.threads() * 3));
        Ok(Self {
            datasets: Arc::new(datasets),
            coalescer: Arc::new(Coalescer::new(Arc::new(WindowCache::new(config.cache_bytes)))),
            workers: Arc::new(workers),
            disk_cache: disk_cache.map(Arc::new),
            admission,
            timeout: config.request_timeout,
        })
    }

    /// Open a dataset off-reactor; used by the layer.json handler too
    pub async fn open_dataset(&self, cog: &str) -> Result<Arc<dyn WindowSource>> {
        let datasets = self.datasets.clone();
        let cog = cog.to_string();
        self.workers
            .run(move || datasets.open_blocking(&cog))
            .await
    }

    /// Produce the encoded terrain tile for a request.
    ///
    /// Rejects with `Overloaded` when more requests are in flight than
    /// the worker pool plus a queue of twice its size can absorb.
    pub async fn get_tile(&self, req: &TileRequest) -> Result<TileArtifact> {
        let _admitted = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Overloaded)?;
        match tokio::time::timeout(self.timeout, self.run(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn run(&self, req: &TileRequest) -> Result<TileArtifact> {
        enter(Stage::Planning, &req.tile);
        let fingerprint = req.fingerprint();

        if !req.skip_cache {
            if let Some(cache) = &self.disk_cache {
                if let Some(bytes) = cache.read(
                    &fingerprint,
                    req.method,
                    req.resampling,
                    req.with_normals,
                    &req.tile,
                ) {
                    tracing::debug!(tile = %req.tile, "disk cache hit");
                    return Ok(TileArtifact::new(bytes, req.content_type()));
                }
            }
        }

        let bounds = req.tms.bounds(req.tile.z, req.tile.x, req.tile.y)?;

        // The root tile is always the deterministic empty tile, and below
        // the configured zoom floor no COG I/O happens at all
        if req.tile.z == 0 || req.tile.z < req.min_zoom {
            return self.finish_empty(req, &fingerprint, bounds).await;
        }

        let source = self.open_dataset(&req.cog).await?;
        if !bounds.intersects(&source.info().bounds) {
            return self.finish_empty(req, &fingerprint, bounds).await;
        }

        // Plan the windows: self first, then every neighbor that exists
        // in the matrix and touches the dataset footprint
        let params = MeshParams::new(req.method, req.tables.resolve(req.method, req.tile.z));
        let mut plan: Vec<(Option<Direction>, TileKey, GeoBounds)> =
            vec![(None, req.tile, bounds)];
        for dir in Direction::ALL {
            if let Some(tile) = neighbor(req.tms, req.tile, dir) {
                let nb = req.tms.bounds(tile.z, tile.x, tile.y)?;
                if nb.intersects(&source.info().bounds) {
                    plan.push((Some(dir), tile, nb));
                }
            }
        }

        enter(Stage::Fetching, &req.tile);
        let window_px = req.method.window_size();
        let fetches = plan.iter().map(|(dir, tile, window_bounds)| {
            let key = WindowKey::new(
                fingerprint,
                req.tms,
                *tile,
                req.resampling,
                req.no_data,
                params,
            );
            let coalescer = self.coalescer.clone();
            let source = source.clone();
            let workers = self.workers.clone();
            let window_bounds = *window_bounds;
            let (resampling, no_data) = (req.resampling, req.no_data);
            let dir = *dir;
            async move {
                let outcome = coalescer
                    .get_or_fetch(&key, move || async move {
                        workers
                            .run(move || {
                                source.read_window(
                                    &window_bounds,
                                    window_px,
                                    window_px,
                                    resampling,
                                    no_data,
                                )
                            })
                            .await
                    })
                    .await;
                (dir, outcome)
            }
        });
        let fetched = futures::future::join_all(fetches).await;

        let mut self_grid: Option<Arc<ElevationGrid>> = None;
        let mut neighbor_grids: Vec<(Direction, Arc<ElevationGrid>)> = Vec::new();
        for (dir, outcome) in fetched {
            match (dir, outcome) {
                (None, Ok(grid)) => self_grid = Some(grid),
                (None, Err(err)) => return Err(err),
                (Some(d), Ok(grid)) => {
                    if !grid.out_of_bounds {
                        neighbor_grids.push((d, grid));
                    }
                }
                (Some(d), Err(err)) => {
                    // A failing neighbor only costs stitching quality
                    tracing::debug!(tile = %req.tile, neighbor = ?d, error = %err,
                        "neighbor window failed, treating as absent");
                }
            }
        }
        let self_grid = self_grid.ok_or_else(|| Error::Internal("self window missing".into()))?;
        if self_grid.out_of_bounds {
            return self.finish_empty(req, &fingerprint, bounds).await;
        }

        enter(Stage::Meshing, &req.tile);
        let with_normals = req.with_normals;
        let mesh_jobs = std::iter::once((None, self_grid.clone()))
            .chain(neighbor_grids.iter().map(|(d, g)| (Some(*d), g.clone())))
            .map(|(dir, grid)| {
                let workers = self.workers.clone();
                async move {
                    let mesh = workers
                        .run(move || meshing::produce(&grid, &params, with_normals))
                        .await;
                    (dir, mesh)
                }
            });
        let meshed = futures::future::join_all(mesh_jobs).await;

        let mut self_mesh = None;
        let mut neighbors = NeighborSet::default();
        for (dir, outcome) in meshed {
            let mesh = outcome?;
            match dir {
                None => self_mesh = Some(mesh),
                Some(d) => neighbors.set(d, mesh),
            }
        }
        let mut self_mesh =
            self_mesh.ok_or_else(|| Error::Internal("self mesh missing".into()))?;

        enter(Stage::Stitching, &req.tile);
        let tile = req.tile;
        let encoded = self
            .workers
            .run(move || {
                stitch::stitch(&mut self_mesh, &neighbors, &bounds, with_normals);
                // Encoding immediately after stitching keeps the mesh on
                // one worker and off the reactor
                enter(Stage::Encoding, &tile);
                qmesh::encode(&self_mesh, &bounds)
            })
            .await?;

        self.persist(req, &fingerprint, &encoded).await;
        enter(Stage::Done, &req.tile);
        Ok(TileArtifact::new(encoded, req.content_type()))
    }

    /// Encode, persist and return the deterministic empty tile
    async fn finish_empty(
        &self,
        req: &TileRequest,
        fingerprint: &DatasetFingerprint,
        bounds: GeoBounds,
    ) -> Result<TileArtifact> {
        let with_normals = req.with_normals;
        let encoded = self
            .workers
            .run(move || {
                let mesh = meshing::empty_tile_mesh(&bounds, with_normals);
                qmesh::encode(&mesh, &bounds)
            })
            .await?;
        self.persist(req, fingerprint, &encoded).await;
        Ok(TileArtifact::new(encoded, req.content_type()))
    }

    async fn persist(&self, req: &TileRequest, fingerprint: &DatasetFingerprint, bytes: &[u8]) {
        let cache = match &self.disk_cache {
            Some(cache) => cache.clone(),
            None => return,
        };
        enter(Stage::Persisting, &req.tile);
        let fingerprint = *fingerprint;
        let (method, resampling, tile) = (req.method, req.resampling, req.tile);
        let with_normals = req.with_normals;
        let bytes = bytes.to_vec();
        let result = self
            .workers
            .run(move || cache.write(&fingerprint, method, resampling, with_normals, &tile, &bytes))
            .await;
        if let Err(err) = result {
            tracing::warn!(tile = %tile, error = %err, "failed to persist tile to disk cache");
        }
    }
}
