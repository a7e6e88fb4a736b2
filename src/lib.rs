//! Chunked, temporally-deduplicated volumetric storage engine for dense 4-D
//! scalar/feature volumes of shape `(Z, Y, X, C)`.
//!
//! A snapshot whose content is largely identical to the prior snapshot
//! stores only the tiles whose bytes differ; unchanged tiles are recorded
//! as references into an earlier snapshot's byte pack. An ROI query at any
//! snapshot transparently resolves references and returns a dense,
//! ROI-local array together with byte-accurate I/O and timing statistics.
//!
//! See [`world::World`] for the query entrypoint, [`writer::build_snapshot`]
//! for writing a new snapshot, and [`cache::StreamSession`] for long-lived
//! streaming reads over a cache.

mod cache;
mod codec;
mod error;
mod extract;
mod geometry;
mod index;
mod pack;
mod packet;
mod schema;
mod tile_store;
mod world;
mod writer;

pub use cache::{DEFAULT_CAPACITY, StreamSession, StreamStats, TileCache};
pub use codec::DEFAULT_LEVEL;
pub use error::{CivdError, CivdResult};
pub use extract::{SCHEMA_SUBMAP_V1, SubmapManifest, export_submap, reconstruct_roi, verify_submap_v1};
pub use geometry::{Intersection, Roi, clamp_roi, intersect, roi_from_center_radius, roi_tile_ids, tile_bounds, tile_id_string};
pub use index::{Bounds6, Index, Payload, SCHEMA_INDEX_V1, TileEntry};
pub use packet::{Mode, SCHEMA_PACKET_V1, VolumePacket};
pub use schema::{VerifyReport, upgrade_index_file, upgrade_legacy_document, verify_index_v1};
pub use tile_store::{RefMode, ReadStats, TileLocation, decode_at, decode_tile, resolve_location};
pub use world::{SnapshotMeta, World};
pub use writer::{WriteStats, build_snapshot, commit_index, hash_tile_bytes};
