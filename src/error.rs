use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type CivdResult<T> = Result<T, CivdError>;

/// The error taxonomy for the storage engine.
///
/// Every variant carries enough context (tile id, snapshot name, pack path)
/// to name the offending resource directly through `Display`, without the
/// caller needing to reconstruct it from a bare message string.
#[derive(Debug, thiserror::Error)]
pub enum CivdError {
    /// A volume's dimensions are not a multiple of the tile size, or a
    /// declared shape has a non-positive axis.
    #[error("shape error: {0}")]
    ShapeError(String),

    /// An index document is missing a required key or has a value of the
    /// wrong shape.
    #[error("schema error: [{context}] {message}")]
    SchemaError {
        /// Where in the document the problem was found, e.g. `"tiles[3]"`.
        context: String,
        /// What was wrong.
        message: String,
    },

    /// Filesystem I/O failed: missing file, short read, failed rename.
    #[error("I/O error at {path}: {source}")]
    IoError {
        /// The path being read or written when the failure occurred.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A tile's compressed bytes failed to decompress, or decompressed to
    /// the wrong length for its declared shape.
    #[error("corrupt tile {tile_id} in {pack}: {reason}")]
    CorruptTile {
        /// The tile's canonical id, e.g. `"z00_y02_x01"`.
        tile_id: String,
        /// The pack file the bytes were read from.
        pack: PathBuf,
        /// What went wrong decoding it.
        reason: String,
    },

    /// A reference entry points at a snapshot, pack, or tile id that does
    /// not exist.
    #[error("dangling reference: tile {tile_id} references {target}")]
    DanglingRef {
        /// The referencing tile's id.
        tile_id: String,
        /// A human-readable description of the unresolvable target.
        target: String,
    },

    /// The preconditions of [`crate::world::World::apply_delta`] were not
    /// met: mismatched ROI, shape, or channel list between base and delta.
    #[error("mismatched packets: {0}")]
    MismatchedPackets(String),

    /// A query mode string was neither `"full"` nor `"delta"`.
    #[error("invalid query mode: {0:?}")]
    InvalidMode(String),
}

impl From<std::io::Error> for CivdError {
    fn from(source: std::io::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source,
        }
    }
}

impl From<serde_json::Error> for CivdError {
    fn from(err: serde_json::Error) -> Self {
        Self::SchemaError {
            context: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::num::TryFromIntError> for CivdError {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::ShapeError(err.to_string())
    }
}

impl CivdError {
    /// Attach a path to an I/O error produced from a bare `std::io::Error`
    /// via `?`, so the caller doesn't have to match on the variant.
    pub(crate) fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::IoError { source, .. } => Self::IoError {
                path: path.into(),
                source,
            },
            other => other,
        }
    }

    pub(crate) fn schema(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaError {
            context: context.into(),
            message: message.into(),
        }
    }
}
