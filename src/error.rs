#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid YAML in source options.")]
    Options(#[from] serde_yaml::Error),
    #[error("Invalid source options: {0}")]
    InvalidOptions(String),
    #[error("Malformed tile data: {0}")]
    DataFormat(#[from] DataFormatError),
    #[error("Tile provider failed: {0}")]
    Provider(String),
}

/// Reasons a tile payload was rejected. The previously loaded data for the
/// tile (if any) is always left in place when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum DataFormatError {
    #[error("payload is not valid GeoJSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported GeoJSON type {0:?}")]
    UnsupportedType(String),
    #[error("feature {0} has no geometry")]
    MissingGeometry(usize),
    #[error("feature {index}: {reason}")]
    Geometry { index: usize, reason: String },
}
