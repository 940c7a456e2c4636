//! CTOD server binary
//!
//! Parses flags (with `CTOD_*` environment fallbacks), wires up the
//! terrain factory and dataset config, and serves the tile endpoints
//! until ctrl-c. Fatal startup problems (unreadable config, port in
//! use) exit non-zero.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Parser;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use ctod::core::cog::DatasetPool;
use ctod::core::disk_cache::TileDiskCache;
use ctod::core::factory::{FactoryConfig, TerrainFactory};
use ctod::core::tms::TileMatrixSet;
use ctod::server::config::DatasetConfig;
use ctod::server::{router, AppState};

#[derive(Parser)]
#[command(name = "ctod", version, about = "Cesium Terrain On Demand")]
struct Args {
    /// Directory for the on-disk tile cache; caching is disabled when absent
    #[arg(long, env = "CTOD_TILE_CACHE_PATH")]
    tile_cache_path: Option<PathBuf>,

    /// JSON file declaring named datasets
    #[arg(long, env = "CTOD_DATASET_CONFIG_PATH", default_value = "./config/datasets.json")]
    dataset_config_path: PathBuf,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, env = "CTOD_LOGGING_LEVEL", default_value = "info")]
    logging_level: String,

    /// Port to listen on
    #[arg(long, env = "CTOD_PORT", default_value_t = 5000)]
    port: u16,

    /// Serve tiles even when the COG lacks the overviews to do so cheaply
    #[arg(long = "unsafe", env = "CTOD_UNSAFE")]
    unsafe_loading: bool,

    /// Disable the /tiles/dynamic endpoints
    #[arg(long, env = "CTOD_NO_DYNAMIC")]
    no_dynamic: bool,

    /// Comma-separated allowed CORS origins; '*' allows any
    #[arg(long, env = "CTOD_CORS_ALLOW_ORIGINS", default_value = "*")]
    cors_allow_origins: String,
}

fn cors_layer(origins: &str) -> Result<CorsLayer> {
    if origins.trim() == "*" {
        return Ok(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
    }
    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .map(|o| {
            o.trim()
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin '{}'", o))
        })
        .collect::<Result<_>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.logging_level)
                .with_context(|| format!("invalid logging level '{}'", args.logging_level))?,
        )
        .init();

    let datasets = DatasetConfig::load(&args.dataset_config_path)
        .context("failed to load dataset config")?;
    let disk_cache = match &args.tile_cache_path {
        Some(path) => Some(TileDiskCache::open(path).context("failed to open tile cache")?),
        None => None,
    };
    let factory = TerrainFactory::new(
        DatasetPool::new(args.unsafe_loading),
        disk_cache,
        FactoryConfig::default(),
    )
    .context("failed to build terrain factory")?;

    let state = Arc::new(AppState {
        factory,
        datasets,
        tms: TileMatrixSet::Wgs1984Quad,
        no_dynamic: args.no_dynamic,
        started_at: SystemTime::now(),
    });

    let app = router(state.clone(), cors_layer(&args.cors_allow_origins)?);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!(
        port = args.port,
        datasets = state.datasets.len(),
        tile_cache = args.tile_cache_path.is_some(),
        dynamic = !args.no_dynamic,
        "ctod listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    Ok(())
}
