//! Builds a snapshot's pack and index, deduplicating tiles against a base
//! snapshot by content hash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::Array4;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{CivdError, CivdResult};
use crate::geometry::{self, Roi};
use crate::index::{Bounds6, Index, Payload, TileEntry};
use crate::pack::PackWriter;

/// SHA-256 of a tile's canonical C-order little-endian float32 byte
/// encoding, as a lowercase hex string.
#[must_use]
pub fn hash_tile_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Counters accumulated while building a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub changed_tiles: u64,
    pub unchanged_tiles: u64,
}

/// Build a new snapshot's pack and index from a dense source volume,
/// deduplicating unchanged tiles against `base_index` when given.
///
/// `snapshot_dir` is the directory the new `index.json`/`tiles.zstpack`
/// pair is written into (typically `<root>/data/civd_time/<name>/`).
/// `base_name` names the base snapshot for reference entries; required
/// whenever `base_index` is `Some`.
pub fn build_snapshot(
    volume: &Array4<f32>,
    tile_size: i64,
    codec_level: i32,
    snapshot_dir: &Path,
    base_index: Option<&Index>,
    base_name: Option<&str>,
) -> CivdResult<(Index, WriteStats)> {
    let shape = volume.shape();
    let (z, y, x, channels) = (shape[0] as i64, shape[1] as i64, shape[2] as i64, shape[3]);

    if z % tile_size != 0 || y % tile_size != 0 || x % tile_size != 0 {
        return Err(CivdError::ShapeError(format!(
            "volume shape ({z},{y},{x}) is not a multiple of tile_size {tile_size}"
        )));
    }
    if tile_size <= 0 || channels == 0 {
        return Err(CivdError::ShapeError(
            "tile_size and channel count must be positive".to_string(),
        ));
    }

    let base_hash: HashMap<&str, &str> = base_index
        .map(|idx| {
            idx.tiles()
                .iter()
                .filter_map(|t| t.hash.as_deref().map(|h| (t.tile_id.as_str(), h)))
                .collect()
        })
        .unwrap_or_default();

    std::fs::create_dir_all(snapshot_dir).map_err(|e| CivdError::from(e).with_path(snapshot_dir))?;
    let pack_path = snapshot_dir.join("tiles.zstpack");
    let mut pack_writer = PackWriter::create(&pack_path)?;

    let roi = Roi::new(0, z, 0, y, 0, x);
    let tile_ids = geometry::roi_tile_ids(roi, tile_size);

    let mut entries = Vec::with_capacity(tile_ids.len());
    let mut stats = WriteStats::default();

    for coord in tile_ids {
        let tile_id = geometry::tile_id_string(coord);
        let bounds = geometry::tile_bounds(coord, tile_size);
        let bytes = extract_tile_bytes(volume, bounds, channels)?;
        let hash = hash_tile_bytes(&bytes);

        let reuse_from_base = base_hash.get(tile_id.as_str()).is_some_and(|h| *h == hash);

        let payload = if reuse_from_base {
            stats.unchanged_tiles += 1;
            let base_idx = base_index.ok_or_else(|| {
                CivdError::ShapeError("base_index required when deduping against a base snapshot".into())
            })?;
            let base_name = base_name
                .ok_or_else(|| CivdError::ShapeError("base_name required when deduping against a base snapshot".into()))?;
            let base_entry = base_idx
                .find_by_id(&tile_id)
                .ok_or_else(|| CivdError::DanglingRef {
                    tile_id: tile_id.clone(),
                    target: format!("tile missing from base index for snapshot {base_name}"),
                })?;
            // Flatten: if the base entry is itself a reference, point at
            // its own target rather than chaining references.
            match &base_entry.payload {
                Payload::Local { offset, length } => Payload::Reference {
                    base_pack: base_idx.pack_path.clone(),
                    base_timestamp: Some(base_name.to_string()),
                    offset: *offset,
                    length: *length,
                },
                Payload::Reference {
                    base_pack,
                    base_timestamp,
                    offset,
                    length,
                } => Payload::Reference {
                    base_pack: base_pack.clone(),
                    base_timestamp: base_timestamp.clone(),
                    offset: *offset,
                    length: *length,
                },
            }
        } else {
            stats.changed_tiles += 1;
            let compressed = codec::compress(&bytes, codec_level)?;
            let (offset, length) = pack_writer.append(&compressed)?;
            Payload::Local { offset, length }
        };

        entries.push(TileEntry {
            tile_id,
            tile_coord: coord,
            bounds_zyx: bounds_tuple(bounds),
            shape_zyxc: [tile_size, tile_size, tile_size, channels as i64],
            codec: "zstd".to_string(),
            hash: Some(hash),
            payload,
            extra: serde_json::Map::new(),
        });
    }

    pack_writer.finish()?;

    let index = Index::new(
        [z, y, x, channels as i64],
        tile_size,
        pack_path,
        snapshot_dir.to_path_buf(),
        entries,
    );
    Ok((index, stats))
}

/// Atomically commit an index to `<snapshot_dir>/index.json` (temp file +
/// rename), the same linearisation point the one-shot upgrader uses.
pub fn commit_index(index: &Index, snapshot_dir: &Path) -> CivdResult<PathBuf> {
    let final_path = snapshot_dir.join("index.json");
    let tmp_path = snapshot_dir.join("index.json.tmp");
    let value = crate::index::to_json(index);
    let bytes = serde_json::to_vec_pretty(&value)?;
    std::fs::write(&tmp_path, &bytes).map_err(|e| CivdError::from(e).with_path(&tmp_path))?;
    std::fs::rename(&tmp_path, &final_path).map_err(|e| CivdError::from(e).with_path(&final_path))?;
    Ok(final_path)
}

fn bounds_tuple(roi: Roi) -> Bounds6 {
    (roi.z0, roi.z1, roi.y0, roi.y1, roi.x0, roi.x1)
}

fn extract_tile_bytes(volume: &Array4<f32>, bounds: Roi, channels: usize) -> CivdResult<Vec<u8>> {
    let slice = volume.slice(ndarray::s![
        bounds.z0 as usize..bounds.z1 as usize,
        bounds.y0 as usize..bounds.y1 as usize,
        bounds.x0 as usize..bounds.x1 as usize,
        0..channels,
    ]);
    let contiguous = slice.as_standard_layout();
    let mut bytes = Vec::with_capacity(contiguous.len() * std::mem::size_of::<f32>());
    for v in contiguous.iter() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn checker_volume(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(z, y, x, c)| (z + y + x + c) as f32)
    }

    #[test]
    fn writer_is_deterministic() {
        let volume = checker_volume((32, 32, 32, 2));
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let (idx_a, stats_a) = build_snapshot(&volume, 32, 3, dir_a.path(), None, None).unwrap();
        let (idx_b, stats_b) = build_snapshot(&volume, 32, 3, dir_b.path(), None, None).unwrap();

        assert_eq!(stats_a, stats_b);
        assert_eq!(idx_a.tiles().len(), idx_b.tiles().len());
        for (a, b) in idx_a.tiles().iter().zip(idx_b.tiles()) {
            assert_eq!(a.hash, b.hash);
        }
        let pack_a = std::fs::read(&idx_a.pack_path).unwrap();
        let pack_b = std::fs::read(&idx_b.pack_path).unwrap();
        assert_eq!(pack_a, pack_b);
    }

    #[test]
    fn unchanged_tiles_become_references_to_base() {
        let volume = checker_volume((32, 32, 32, 1));
        let base_dir = tempfile::tempdir().unwrap();
        let (base_index, base_stats) =
            build_snapshot(&volume, 32, 3, base_dir.path(), None, None).unwrap();
        assert_eq!(base_stats.changed_tiles, 1);
        assert_eq!(base_stats.unchanged_tiles, 0);

        let next_dir = tempfile::tempdir().unwrap();
        let (next_index, next_stats) = build_snapshot(
            &volume,
            32,
            3,
            next_dir.path(),
            Some(&base_index),
            Some("t000"),
        )
        .unwrap();

        assert_eq!(next_stats.changed_tiles, 0);
        assert_eq!(next_stats.unchanged_tiles, 1);
        let entry = &next_index.tiles()[0];
        assert!(!entry.has_own_payload());
    }

    #[test]
    fn one_changed_tile_among_many_is_isolated() {
        let mut volume = Array4::<f32>::zeros((64, 32, 32, 1));
        let base_dir = tempfile::tempdir().unwrap();
        let (base_index, _) = build_snapshot(&volume, 32, 3, base_dir.path(), None, None).unwrap();

        volume[[40, 10, 10, 0]] = 42.0;
        let next_dir = tempfile::tempdir().unwrap();
        let (next_index, stats) = build_snapshot(
            &volume,
            32,
            3,
            next_dir.path(),
            Some(&base_index),
            Some("t000"),
        )
        .unwrap();

        assert_eq!(stats.changed_tiles, 1);
        assert_eq!(stats.unchanged_tiles, 1);
        let changed: Vec<_> = next_index.tiles().iter().filter(|t| t.has_own_payload()).collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].tile_id, "z01_y00_x00");
    }
}
