//! Resolves a tile entry — local or reference — to a decoded array plus
//! read statistics.

use ndarray::Array4;

use crate::codec;
use crate::error::{CivdError, CivdResult};
use crate::index::{Index, Payload, TileEntry};
use crate::pack;

/// How a tile's bytes were ultimately located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefMode {
    /// Read directly from the owning snapshot's own pack.
    Direct,
    /// Read from another pack via an explicit path.
    PackSlice,
    /// Read from another pack resolved by snapshot name.
    TimeId,
}

/// Per-tile read accounting: compressed bytes actually pulled off disk, and
/// which resolution path was taken.
#[derive(Debug, Clone, Copy)]
pub struct ReadStats {
    pub bytes_read: u64,
    pub mode: RefMode,
}

/// The physical location a tile entry's bytes resolve to: a pack file path
/// plus a byte range. Two entries that resolve to the same location —
/// always true of a reference entry and the base tile it points at — hold
/// bitwise-identical bytes, which is what lets a tile cache key on this
/// location instead of on `(snapshot, tile_id)` and still get cache hits
/// for content reused across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileLocation {
    pub pack_path: std::path::PathBuf,
    pub offset: u64,
    pub length: u64,
    pub mode: RefMode,
}

/// Resolve a tile entry to the pack file and byte range its compressed
/// bytes actually live at, without reading or decoding anything.
///
/// `resolve_snapshot_pack` is used only for reference entries that name a
/// base snapshot by name rather than (or in addition to) an explicit path;
/// it must return that snapshot's pack file path. The engine's `World`
/// supplies this by joining its storage root with the snapshot name — kept
/// as a callback here so `tile_store` has no dependency on `World` itself.
pub fn resolve_location(
    entry: &TileEntry,
    owning_index: &Index,
    resolve_snapshot_pack: impl FnOnce(&str) -> CivdResult<std::path::PathBuf>,
) -> TileLocation {
    match &entry.payload {
        Payload::Local { offset, length } => TileLocation {
            pack_path: owning_index.pack_path.clone(),
            offset: *offset,
            length: *length,
            mode: RefMode::Direct,
        },
        Payload::Reference {
            base_pack,
            base_timestamp,
            offset,
            length,
        } => {
            let path = if let Some(name) = base_timestamp {
                match resolve_snapshot_pack(name) {
                    Ok(p) => p,
                    Err(_) => owning_index.index_dir.join(base_pack),
                }
            } else {
                owning_index.index_dir.join(base_pack)
            };
            let mode = if base_timestamp.is_some() {
                RefMode::TimeId
            } else {
                RefMode::PackSlice
            };
            TileLocation {
                pack_path: path,
                offset: *offset,
                length: *length,
                mode,
            }
        }
    }
}

/// Resolve and decode one tile entry into a dense `(tile_size, tile_size,
/// tile_size, C)` array. See [`resolve_location`] for what "resolve" means.
pub fn decode_tile(
    entry: &TileEntry,
    owning_index: &Index,
    resolve_snapshot_pack: impl FnOnce(&str) -> CivdResult<std::path::PathBuf>,
) -> CivdResult<(Array4<f32>, ReadStats)> {
    let location = resolve_location(entry, owning_index, resolve_snapshot_pack);
    let array = decode_at(entry, &location)?;
    Ok((
        array,
        ReadStats {
            bytes_read: location.length,
            mode: location.mode,
        },
    ))
}

/// Read and decode a tile entry's bytes from an already-resolved location,
/// verifying the decoded bytes against the entry's stored hash.
pub fn decode_at(entry: &TileEntry, location: &TileLocation) -> CivdResult<Array4<f32>> {
    let pack_path = &location.pack_path;
    let (offset, length) = (location.offset, location.length);
    let compressed = pack::read_slice(pack_path, offset, length)?;
    let byte_len = (entry.shape_zyxc[0] * entry.shape_zyxc[1] * entry.shape_zyxc[2]) as usize
        * entry.shape_zyxc[3] as usize
        * std::mem::size_of::<f32>();
    let raw = codec::decompress(&compressed, byte_len).map_err(|e| match e {
        CivdError::CorruptTile { reason, .. } => CivdError::CorruptTile {
            tile_id: entry.tile_id.clone(),
            pack: pack_path.clone(),
            reason,
        },
        other => other,
    })?;

    if let Some(expected_hash) = &entry.hash {
        let actual = crate::writer::hash_tile_bytes(&raw);
        if &actual != expected_hash {
            return Err(CivdError::CorruptTile {
                tile_id: entry.tile_id.clone(),
                pack: pack_path.clone(),
                reason: "decoded bytes do not match stored hash".to_string(),
            });
        }
    }

    let floats: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let shape = (
        entry.shape_zyxc[0] as usize,
        entry.shape_zyxc[1] as usize,
        entry.shape_zyxc[2] as usize,
        entry.shape_zyxc[3] as usize,
    );
    let array = Array4::from_shape_vec(shape, floats).map_err(|e| CivdError::CorruptTile {
        tile_id: entry.tile_id.clone(),
        pack: pack_path.clone(),
        reason: format!("reshape failed: {e}"),
    })?;

    Ok(array)
}
