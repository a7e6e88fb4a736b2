//! Public query entrypoint: opens a storage root, loads per-snapshot
//! indices on first access, and answers ROI queries in full or delta mode.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use ndarray::Array4;

use crate::error::{CivdError, CivdResult};
use crate::geometry::{self, Roi};
use crate::index::Index;
use crate::packet::{Mode, VolumePacket};
use crate::tile_store;

/// Metadata about one snapshot, independent of any particular query.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub schema_version: String,
    pub shape_zyxc: [i64; 4],
    pub tile_size: i64,
    pub pack_path: PathBuf,
    pub channels: Vec<String>,
}

/// Entry point for reading a time series of snapshots rooted at one
/// storage directory.
///
/// Caches per-snapshot indices behind a `RefCell`: loading is the only
/// mutation path, so a `World` is re-entrant from a single thread but (per
/// the crate's concurrency model) is not `Sync` without an external lock.
pub struct World {
    root: PathBuf,
    cache: RefCell<HashMap<String, Rc<Index>>>,
}

impl World {
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.root.join("data").join("civd_time").join(name)
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.snapshot_dir(name).join("index.json")
    }

    fn load_index(&self, name: &str) -> CivdResult<Rc<Index>> {
        if let Some(idx) = self.cache.borrow().get(name) {
            return Ok(Rc::clone(idx));
        }
        log::debug!("loading index for snapshot {name}");
        let idx = Rc::new(Index::load(&self.index_path(name))?);
        self.cache.borrow_mut().insert(name.to_string(), Rc::clone(&idx));
        Ok(idx)
    }

    pub fn meta(&self, name: &str) -> CivdResult<SnapshotMeta> {
        let idx = self.load_index(name)?;
        let channels = (0..idx.shape_zyxc[3]).map(|c| format!("chan{c}")).collect();
        Ok(SnapshotMeta {
            schema_version: idx.schema_version.clone(),
            shape_zyxc: idx.shape_zyxc,
            tile_size: idx.tile_size,
            pack_path: idx.pack_path.clone(),
            channels,
        })
    }

    /// Run an ROI query against one snapshot.
    ///
    /// `channels`, when `None`, selects every channel in declaration order.
    pub fn query(
        &self,
        name: &str,
        roi: Roi,
        channels: Option<&[usize]>,
        mode: Mode,
    ) -> CivdResult<VolumePacket> {
        let idx = self.load_index(name)?;
        let shape_zyx = (idx.shape_zyxc[0], idx.shape_zyxc[1], idx.shape_zyxc[2]);
        let roi = geometry::clamp_roi(roi, shape_zyx);

        let all_channels: Vec<usize> = (0..idx.shape_zyxc[3] as usize).collect();
        let channel_idx: Vec<usize> = channels.map(<[usize]>::to_vec).unwrap_or(all_channels);

        let tile_ids = geometry::roi_tile_ids(roi, idx.tile_size);
        let tiles_total = tile_ids.len() as u64;

        let (roi_z, roi_y, roi_x) = roi.shape_zyx();
        let mut buffer = Array4::<f32>::zeros((roi_z, roi_y, roi_x, channel_idx.len()));

        let mut tiles_included = 0u64;
        let mut bytes_read = 0u64;
        let mut decode_ms = 0.0f64;

        for coord in tile_ids {
            let tile_id = geometry::tile_id_string(coord);
            let Some(entry) = idx.find_by_id(&tile_id) else {
                return Err(CivdError::SchemaError {
                    context: format!("snapshot {name}"),
                    message: format!("grid position {tile_id} has no tile entry"),
                });
            };

            if mode == Mode::Delta && !entry.has_own_payload() {
                continue;
            }

            let start = Instant::now();
            let (tile_array, stats) =
                tile_store::decode_tile(entry, &idx, |snap| Ok(self.snapshot_dir(snap).join("tiles.zstpack")))?;
            decode_ms += start.elapsed().as_secs_f64() * 1000.0;
            bytes_read += stats.bytes_read;
            tiles_included += 1;

            let tile_world = geometry::tile_bounds(coord, idx.tile_size);
            let Some(isect) = geometry::intersect(tile_world, roi) else {
                continue;
            };
            let (sz0, sz1, sy0, sy1, sx0, sx1) = isect.src;
            let (dz0, dz1, dy0, dy1, dx0, dx1) = isect.dst;

            for (ci, &src_c) in channel_idx.iter().enumerate() {
                let src = tile_array.slice(ndarray::s![sz0..sz1, sy0..sy1, sx0..sx1, src_c]);
                let mut dst = buffer.slice_mut(ndarray::s![dz0..dz1, dy0..dy1, dx0..dx1, ci]);
                dst.assign(&src);
            }
        }

        let channels: Vec<String> = channel_idx.iter().map(|c| format!("chan{c}")).collect();

        let mut meta = serde_json::Map::new();
        meta.insert(
            "index_schema_version".to_string(),
            serde_json::Value::String(idx.schema_version.clone()),
        );

        Ok(VolumePacket {
            schema_version: crate::packet::SCHEMA_PACKET_V1.to_string(),
            time: name.to_string(),
            mode,
            roi,
            shape_zyxc: [roi_z as i64, roi_y as i64, roi_x as i64, channel_idx.len() as i64],
            tile_size: idx.tile_size,
            channels,
            tiles_total,
            tiles_included,
            bytes_read,
            decode_ms,
            volume: buffer,
            tile_mask: None,
            meta,
        })
    }

    /// Merge a delta packet into a base packet using v1's deterministic
    /// "overwrite nonzero" rule: every voxel where `delta.volume != 0`
    /// replaces the corresponding voxel in `base.volume`. See the crate's
    /// design notes for this rule's documented limitation (a true zero
    /// delta voxel cannot overwrite a nonzero base voxel).
    pub fn apply_delta(base: &VolumePacket, delta: &VolumePacket) -> CivdResult<VolumePacket> {
        if base.roi != delta.roi {
            return Err(CivdError::MismatchedPackets("roi differs between base and delta".into()));
        }
        if base.shape_zyxc != delta.shape_zyxc {
            return Err(CivdError::MismatchedPackets(
                "shape_zyxc differs between base and delta".into(),
            ));
        }
        if base.channels != delta.channels {
            return Err(CivdError::MismatchedPackets(
                "channels differ between base and delta".into(),
            ));
        }

        let mut merged = base.volume.clone();
        ndarray::Zip::from(&mut merged)
            .and(&delta.volume)
            .for_each(|out, &d| {
                if d != 0.0 {
                    *out = d;
                }
            });

        let mut meta = serde_json::Map::new();
        meta.insert(
            "applied_delta_from".to_string(),
            serde_json::Value::String(base.time.clone()),
        );
        meta.insert(
            "delta_time".to_string(),
            serde_json::Value::String(delta.time.clone()),
        );

        Ok(VolumePacket {
            schema_version: crate::packet::SCHEMA_PACKET_V1.to_string(),
            time: delta.time.clone(),
            mode: Mode::Full,
            roi: base.roi,
            shape_zyxc: base.shape_zyxc,
            tile_size: base.tile_size,
            channels: base.channels.clone(),
            tiles_total: base.tiles_total,
            tiles_included: base.tiles_total,
            bytes_read: base.bytes_read + delta.bytes_read,
            decode_ms: base.decode_ms + delta.decode_ms,
            volume: merged,
            tile_mask: None,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;
    use ndarray::Array4;

    fn write_snapshot(
        world_root: &Path,
        name: &str,
        volume: &Array4<f32>,
        base_name: Option<&str>,
    ) -> Index {
        let world = World::open(world_root);
        let snap_dir = world.snapshot_dir(name);
        let base_index = base_name.map(|n| Index::load(&world.index_path(n)).unwrap());
        let (index, _stats) =
            writer::build_snapshot(volume, 32, 3, &snap_dir, base_index.as_ref(), base_name).unwrap();
        writer::commit_index(&index, &snap_dir).unwrap();
        index
    }

    #[test]
    fn full_query_reconstructs_aligned_roi_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Array4::from_shape_fn((64, 64, 64, 2), |(z, y, x, c)| {
            (z * 10000 + y * 100 + x + c) as f32
        });
        write_snapshot(dir.path(), "t000", &volume, None);

        let world = World::open(dir.path());
        let roi = Roi::new(0, 32, 0, 32, 0, 32);
        let packet = world.query("t000", roi, None, Mode::Full).unwrap();

        assert_eq!(packet.tiles_total, 1);
        assert_eq!(packet.tiles_included, 1);
        for z in 0..32 {
            for y in 0..32 {
                for x in 0..32 {
                    for c in 0..2 {
                        assert_eq!(packet.volume[[z, y, x, c]], volume[[z, y, x, c]]);
                    }
                }
            }
        }
    }

    #[test]
    fn delta_mode_skips_unchanged_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Array4::<f32>::zeros((32, 32, 32, 1));
        write_snapshot(dir.path(), "t000", &volume, None);
        write_snapshot(dir.path(), "t001", &volume, Some("t000"));

        let world = World::open(dir.path());
        let roi = Roi::new(0, 32, 0, 32, 0, 32);
        let packet = world.query("t001", roi, None, Mode::Delta).unwrap();
        assert_eq!(packet.tiles_included, 0);
        assert_eq!(packet.bytes_read, 0);
        assert!(packet.volume.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn apply_delta_overwrites_only_nonzero_voxels() {
        let dir = tempfile::tempdir().unwrap();
        let mut volume = Array4::<f32>::zeros((32, 32, 32, 1));
        write_snapshot(dir.path(), "t000", &volume, None);
        volume[[5, 5, 5, 0]] = 9.0;
        write_snapshot(dir.path(), "t001", &volume, Some("t000"));

        let world = World::open(dir.path());
        let roi = Roi::new(0, 32, 0, 32, 0, 32);
        let full = world.query("t001", roi, None, Mode::Full).unwrap();
        let delta = world.query("t001", roi, None, Mode::Delta).unwrap();
        let merged = World::apply_delta(&full, &delta).unwrap();

        for (a, b) in merged.volume.iter().zip(full.volume.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn apply_delta_rejects_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let volume_a = Array4::<f32>::zeros((32, 32, 32, 1));
        let volume_b = Array4::<f32>::zeros((32, 32, 32, 2));
        write_snapshot(dir.path(), "t000", &volume_a, None);

        let world = World::open(dir.path());
        let roi = Roi::new(0, 32, 0, 32, 0, 32);
        let a = world.query("t000", roi, None, Mode::Full).unwrap();
        let mut b = a.clone();
        b.shape_zyxc = [32, 32, 32, 2];
        b.volume = volume_b;
        assert!(World::apply_delta(&a, &b).is_err());
    }
}
