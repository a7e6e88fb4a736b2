//! The canonical query result and its query-mode enum.

use ndarray::Array4;
use serde_json::{Map, Value};

use crate::error::CivdError;
use crate::geometry::Roi;

/// `civd.packet.v1`, the schema tag carried in [`VolumePacket::schema_version`].
pub const SCHEMA_PACKET_V1: &str = "civd.packet.v1";

/// Query mode: whether a query returns every tile in the ROI, or only the
/// tiles that carry their own payload at that snapshot (i.e. changed
/// there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Full,
    Delta,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Delta => "delta",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = CivdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Mode::Full),
            "delta" => Ok(Mode::Delta),
            other => Err(CivdError::InvalidMode(other.to_string())),
        }
    }
}

/// The stable, public query result. Downstream adapters consume only the
/// fields documented on this type — never the tile-level internals.
#[derive(Debug, Clone)]
pub struct VolumePacket {
    pub schema_version: String,
    pub time: String,
    pub mode: Mode,
    pub roi: Roi,
    /// The packet's own ROI-local shape `(roiZ, roiY, roiX, |channels|)`,
    /// not the owning snapshot's full volume shape.
    pub shape_zyxc: [i64; 4],
    pub tile_size: i64,
    pub channels: Vec<String>,
    pub tiles_total: u64,
    pub tiles_included: u64,
    pub bytes_read: u64,
    pub decode_ms: f64,
    pub volume: Array4<f32>,
    /// Per-tile coverage mask in ROI-tile-grid order; reserved for a future
    /// schema version's merge rule (unused by v1's `apply_delta`).
    pub tile_mask: Option<ndarray::Array3<bool>>,
    pub meta: Map<String, Value>,
}

impl VolumePacket {
    #[must_use]
    pub fn roi_shape_zyx(&self) -> (usize, usize, usize) {
        self.roi.shape_zyx()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
