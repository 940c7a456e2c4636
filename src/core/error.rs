//! Error types for the terrain core
//!
//! Hard failures surface to the HTTP layer which maps them onto status
//! codes; soft failures (missing neighbors, cache write errors) are
//! recovered inside the factory and never reach this boundary.

use std::fmt;

/// Main error type for terrain operations
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed request parameters
    BadRequest(String),

    /// Named dataset not present in the dataset config
    NoSuchDataset(String),

    /// Unknown tile matrix set identifier
    NoSuchTms(String),

    /// Tile index outside the matrix for its zoom level
    TileOutOfRange(String),

    /// Requested zoom has no usable overview and the native window
    /// exceeds the pixel budget
    UnsafeRequest(String),

    /// COG unreachable or corrupt
    SourceUnavailable(String),

    /// Tile bounds fully outside the dataset footprint
    OutOfBounds(String),

    /// Mesh producer failed
    MeshingFailed(String),

    /// Quantized-mesh serialization failed
    EncodingFailed(String),

    /// Request exceeded its wall-clock budget
    Timeout,

    /// Worker pool queue is full
    Overloaded,

    /// Anything else
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Error::NoSuchDataset(name) => write!(f, "Dataset '{}' not found", name),
            Error::NoSuchTms(id) => write!(f, "Tile matrix set '{}' not found", id),
            Error::TileOutOfRange(msg) => write!(f, "Tile out of range: {}", msg),
            Error::UnsafeRequest(msg) => write!(f, "Unsafe request: {}", msg),
            Error::SourceUnavailable(msg) => write!(f, "Source unavailable: {}", msg),
            Error::OutOfBounds(msg) => write!(f, "Out of bounds: {}", msg),
            Error::MeshingFailed(msg) => write!(f, "Meshing failed: {}", msg),
            Error::EncodingFailed(msg) => write!(f, "Encoding failed: {}", msg),
            Error::Timeout => write!(f, "Request timed out"),
            Error::Overloaded => write!(f, "Server overloaded"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Short machine-readable kind, used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BadRequest",
            Error::NoSuchDataset(_) => "NoSuchDataset",
            Error::NoSuchTms(_) => "NoSuchTMS",
            Error::TileOutOfRange(_) => "TileOutOfRange",
            Error::UnsafeRequest(_) => "UnsafeRequest",
            Error::SourceUnavailable(_) => "SourceUnavailable",
            Error::OutOfBounds(_) => "OutOfBounds",
            Error::MeshingFailed(_) => "MeshingFailed",
            Error::EncodingFailed(_) => "EncodingFailed",
            Error::Timeout => "Timeout",
            Error::Overloaded => "Overloaded",
            Error::Internal(_) => "Internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SourceUnavailable(err.to_string())
    }
}

impl From<tiff::TiffError> for Error {
    fn from(err: tiff::TiffError) -> Self {
        Error::SourceUnavailable(err.to_string())
    }
}

/// Convenience result type for terrain operations
pub type Result<T> = std::result::Result<T, Error>;
