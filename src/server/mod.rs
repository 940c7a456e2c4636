//! HTTP surface: axum routes, query parameters, layer.json and the
//! dataset configuration.

pub mod config;
pub mod handlers;
pub mod layer;
pub mod queries;

pub use handlers::{router, AppState};
