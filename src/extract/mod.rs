//! Exporter / bridge: serialises a submap — an ROI's worth of decoded tiles
//! at one snapshot — into a portable sidecar + manifest pair for
//! cross-process transport. A publish/subscribe bridge (out of scope, §1)
//! would treat this pair as its wire representation.

use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CivdError, CivdResult};
use crate::geometry::{self, Roi};
use crate::index::Index;
use crate::packet::Mode;
use crate::tile_store;
use crate::world::World;

/// `civd.submap.v1`, the schema tag carried in [`SubmapManifest::schema_version`].
pub const SCHEMA_SUBMAP_V1: &str = "civd.submap.v1";

/// The `{z0,z1,y0,y1,x0,x1}` object form an exported ROI is recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiObject {
    pub z0: i64,
    pub z1: i64,
    pub y0: i64,
    pub y1: i64,
    pub x0: i64,
    pub x1: i64,
}

impl From<Roi> for RoiObject {
    fn from(roi: Roi) -> Self {
        Self {
            z0: roi.z0,
            z1: roi.z1,
            y0: roi.y0,
            y1: roi.y1,
            x0: roi.x0,
            x1: roi.x1,
        }
    }
}

impl From<RoiObject> for Roi {
    fn from(r: RoiObject) -> Self {
        Roi::new(r.z0, r.z1, r.y0, r.y1, r.x0, r.x1)
    }
}

/// The canonical metadata record for one exported submap. Consumers load
/// this alongside the sidecar file it names and treat the manifest as
/// canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmapManifest {
    pub schema_version: String,
    pub time: String,
    pub mode: String,
    pub roi: RoiObject,
    pub shape_zyxc: [i64; 4],
    pub tile_size: i64,
    pub channels: Vec<String>,
    pub tiles_total: u64,
    pub tiles_included: u64,
    pub bytes_npz: u64,
    pub decode_ms: f64,
    pub sidecar_path: PathBuf,
    pub source_index: PathBuf,
}

/// Sidecar binary layout: a little-endian `u32` header length, a JSON
/// header describing tile count/shape/ROI/per-tile bounds, then the raw
/// concatenated tile byte buffers — the same "structured header + flat
/// byte region" shape the core pack format itself uses, rather than
/// depending on a third-party `.npz`/zip-of-`.npy` implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarHeader {
    n_tiles: usize,
    tile_shape: [usize; 4],
    roi: [i64; 6],
    bounds_zyx: Vec<[i64; 6]>,
}

/// Export a submap: every tile touching an ROI (full mode) or only the
/// tiles carrying their own payload at this snapshot (delta mode), decoded
/// and stacked into one sidecar file plus a manifest describing it.
///
/// `center_zyx`/`radius` define the ROI via
/// [`crate::geometry::roi_from_center_radius`]. `out_dir` is created if
/// missing.
pub fn export_submap(
    world: &World,
    snapshot: &str,
    center_zyx: (i64, i64, i64),
    radius: i64,
    mode: Mode,
    out_dir: &Path,
) -> CivdResult<SubmapManifest> {
    let index_path = world.snapshot_dir(snapshot).join("index.json");
    let idx = Index::load(&index_path)?;
    let shape_zyx = (idx.shape_zyxc[0], idx.shape_zyxc[1], idx.shape_zyxc[2]);
    let roi = geometry::roi_from_center_radius(center_zyx, radius, shape_zyx);
    let tile_ids = geometry::roi_tile_ids(roi, idx.tile_size);
    let tiles_total = tile_ids.len() as u64;

    let mut tiles: Vec<Array4<f32>> = Vec::new();
    let mut bounds: Vec<[i64; 6]> = Vec::new();

    let start = Instant::now();
    for coord in tile_ids {
        let tile_id = geometry::tile_id_string(coord);
        let Some(entry) = idx.find_by_id(&tile_id) else {
            return Err(CivdError::SchemaError {
                context: format!("snapshot {snapshot}"),
                message: format!("grid position {tile_id} has no tile entry"),
            });
        };
        if mode == Mode::Delta && !entry.has_own_payload() {
            continue;
        }
        let (array, _stats) =
            tile_store::decode_tile(entry, &idx, |snap| Ok(world.snapshot_dir(snap).join("tiles.zstpack")))?;
        let b = entry.bounds_zyx;
        bounds.push([b.0, b.1, b.2, b.3, b.4, b.5]);
        tiles.push(array);
    }
    let decode_ms = start.elapsed().as_secs_f64() * 1000.0;
    let tiles_included = tiles.len() as u64;

    std::fs::create_dir_all(out_dir).map_err(|e| CivdError::from(e).with_path(out_dir))?;
    let (cz, cy, cx) = center_zyx;
    let file_stem = format!("submap_{snapshot}_{}_z{cz}_y{cy}_x{cx}_r{radius}", mode.as_str());
    let sidecar_path = out_dir.join(format!("{file_stem}.civdsub"));
    let manifest_path = out_dir.join(format!("{file_stem}.json"));

    let bytes_npz = write_sidecar(&sidecar_path, &tiles, &bounds, roi, idx.tile_size)?;

    let channels: Vec<String> = (0..idx.shape_zyxc[3]).map(|c| format!("chan{c}")).collect();
    let manifest = SubmapManifest {
        schema_version: SCHEMA_SUBMAP_V1.to_string(),
        time: snapshot.to_string(),
        mode: mode.as_str().to_string(),
        roi: roi.into(),
        shape_zyxc: idx.shape_zyxc,
        tile_size: idx.tile_size,
        channels,
        tiles_total,
        tiles_included,
        bytes_npz,
        decode_ms,
        sidecar_path: sidecar_path.clone(),
        source_index: index_path,
    };
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(&manifest_path, &bytes).map_err(|e| CivdError::from(e).with_path(&manifest_path))?;

    Ok(manifest)
}

fn write_sidecar(
    path: &Path,
    tiles: &[Array4<f32>],
    bounds: &[[i64; 6]],
    roi: Roi,
    tile_size: i64,
) -> CivdResult<u64> {
    let channels = tiles.first().map_or(1, |t| t.shape()[3]);
    let tile_shape = [tile_size as usize, tile_size as usize, tile_size as usize, channels];

    let header = SidecarHeader {
        n_tiles: tiles.len(),
        tile_shape,
        roi: [roi.z0, roi.z1, roi.y0, roi.y1, roi.x0, roi.x1],
        bounds_zyx: bounds.to_vec(),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + tiles.len() * tile_byte_len(&tile_shape));
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    for tile in tiles {
        let contiguous = tile.as_standard_layout();
        for v in contiguous.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    std::fs::write(path, &out).map_err(|e| CivdError::from(e).with_path(path))?;
    Ok(out.len() as u64)
}

fn tile_byte_len(shape: &[usize; 4]) -> usize {
    shape.iter().product::<usize>() * std::mem::size_of::<f32>()
}

fn read_sidecar(path: &Path) -> CivdResult<(SidecarHeader, Vec<Array4<f32>>)> {
    let bytes = std::fs::read(path).map_err(|e| CivdError::from(e).with_path(path))?;
    if bytes.len() < 4 {
        return Err(CivdError::schema("submap.sidecar", "file too short for header length"));
    }
    let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let header_start = 4;
    let header_end = header_start + header_len;
    if bytes.len() < header_end {
        return Err(CivdError::schema("submap.sidecar", "file too short for declared header"));
    }
    let header: SidecarHeader = serde_json::from_slice(&bytes[header_start..header_end])?;

    let tile_len = tile_byte_len(&header.tile_shape);
    let mut tiles = Vec::with_capacity(header.n_tiles);
    let mut offset = header_end;
    for _ in 0..header.n_tiles {
        let end = offset + tile_len;
        if bytes.len() < end {
            return Err(CivdError::schema("submap.sidecar", "truncated tile buffer"));
        }
        let floats: Vec<f32> = bytes[offset..end]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let shape = (
            header.tile_shape[0],
            header.tile_shape[1],
            header.tile_shape[2],
            header.tile_shape[3],
        );
        let array = Array4::from_shape_vec(shape, floats)
            .map_err(|e| CivdError::schema("submap.sidecar", format!("reshape failed: {e}")))?;
        tiles.push(array);
        offset = end;
    }

    Ok((header, tiles))
}

/// Reconstruct the dense ROI-local array a submap describes, using the same
/// intersection math as [`crate::geometry::intersect`].
pub fn reconstruct_roi(manifest: &SubmapManifest) -> CivdResult<Array4<f32>> {
    let (header, tiles) = read_sidecar(&manifest.sidecar_path)?;
    let roi: Roi = manifest.roi.into();
    let (roi_z, roi_y, roi_x) = roi.shape_zyx();
    let channels = header.tile_shape[3];
    let mut buffer = Array4::<f32>::zeros((roi_z, roi_y, roi_x, channels));

    for (tile, bounds) in tiles.iter().zip(header.bounds_zyx.iter()) {
        let tile_world = Roi::new(bounds[0], bounds[1], bounds[2], bounds[3], bounds[4], bounds[5]);
        let Some(isect) = geometry::intersect(tile_world, roi) else {
            continue;
        };
        let (sz0, sz1, sy0, sy1, sx0, sx1) = isect.src;
        let (dz0, dz1, dy0, dy1, dx0, dx1) = isect.dst;
        let src = tile.slice(ndarray::s![sz0..sz1, sy0..sy1, sx0..sx1, ..]);
        let mut dst = buffer.slice_mut(ndarray::s![dz0..dz1, dy0..dy1, dx0..dx1, ..]);
        dst.assign(&src);
    }

    Ok(buffer)
}

/// Validate a submap manifest document against `civd.submap.v1`: required
/// fields, internally-consistent counts, and that the sidecar it names
/// actually exists and has the declared byte size.
pub fn verify_submap_v1(manifest_path: &Path) -> CivdResult<SubmapManifest> {
    let bytes = std::fs::read(manifest_path).map_err(|e| CivdError::from(e).with_path(manifest_path))?;
    let value: Value = serde_json::from_slice(&bytes)?;

    let schema_version = value
        .get("schema_version")
        .and_then(Value::as_str)
        .ok_or_else(|| CivdError::schema("submap", "missing schema_version"))?;
    if schema_version != SCHEMA_SUBMAP_V1 {
        return Err(CivdError::schema(
            "submap.schema_version",
            format!("must be {SCHEMA_SUBMAP_V1:?}, got {schema_version:?}"),
        ));
    }

    let manifest: SubmapManifest = serde_json::from_value(value)?;
    if manifest.mode != "full" && manifest.mode != "delta" {
        return Err(CivdError::schema("submap.mode", "must be \"full\" or \"delta\""));
    }
    if manifest.tiles_included > manifest.tiles_total {
        return Err(CivdError::schema(
            "submap",
            "tiles_included cannot exceed tiles_total",
        ));
    }
    if manifest.channels.is_empty() {
        return Err(CivdError::schema("submap.channels", "must be non-empty"));
    }

    let actual_size = std::fs::metadata(&manifest.sidecar_path)
        .map_err(|e| CivdError::from(e).with_path(&manifest.sidecar_path))?
        .len();
    if actual_size != manifest.bytes_npz {
        return Err(CivdError::schema(
            "submap.bytes_npz",
            format!("manifest declares {}, sidecar is actually {actual_size} bytes", manifest.bytes_npz),
        ));
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;
    use ndarray::Array4;

    fn write_snapshot(world: &World, name: &str, volume: &Array4<f32>, base: Option<&str>) {
        let snap_dir = world.snapshot_dir(name);
        let base_index = base.map(|n| Index::load(&world.snapshot_dir(n).join("index.json")).unwrap());
        let (index, _) = writer::build_snapshot(volume, 32, 3, &snap_dir, base_index.as_ref(), base).unwrap();
        writer::commit_index(&index, &snap_dir).unwrap();
    }

    #[test]
    fn export_then_reconstruct_matches_full_query() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let volume = Array4::from_shape_fn((64, 64, 64, 2), |(z, y, x, c)| (z * 10000 + y * 100 + x + c) as f32);
        write_snapshot(&world, "t000", &volume, None);

        let out_dir = dir.path().join("exports");
        let manifest = export_submap(&world, "t000", (32, 32, 32), 16, Mode::Full, &out_dir).unwrap();
        assert_eq!(manifest.tiles_included, manifest.tiles_total);

        let reconstructed = reconstruct_roi(&manifest).unwrap();
        let full = world.query("t000", manifest.roi.into(), None, Mode::Full).unwrap();
        assert_eq!(reconstructed.shape(), full.volume.shape());
        for (a, b) in reconstructed.iter().zip(full.volume.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn delta_export_includes_only_changed_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let mut volume = Array4::<f32>::zeros((64, 32, 32, 1));
        write_snapshot(&world, "t000", &volume, None);
        volume[[40, 0, 0, 0]] = 5.0;
        write_snapshot(&world, "t001", &volume, Some("t000"));

        let out_dir = dir.path().join("exports");
        let manifest = export_submap(&world, "t001", (32, 16, 16), 32, Mode::Delta, &out_dir).unwrap();
        assert_eq!(manifest.tiles_included, 1);
        assert!(manifest.tiles_total > manifest.tiles_included);
    }

    #[test]
    fn verify_submap_v1_accepts_its_own_export() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let volume = Array4::<f32>::zeros((32, 32, 32, 1));
        write_snapshot(&world, "t000", &volume, None);

        let out_dir = dir.path().join("exports");
        let manifest = export_submap(&world, "t000", (16, 16, 16), 16, Mode::Full, &out_dir).unwrap();
        let manifest_path = out_dir.join("submap_t000_full_z16_y16_x16_r16.json");
        let reloaded = verify_submap_v1(&manifest_path).unwrap();
        assert_eq!(reloaded.schema_version, manifest.schema_version);
    }

    #[test]
    fn verify_submap_v1_rejects_tampered_bytes_npz() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let volume = Array4::<f32>::zeros((32, 32, 32, 1));
        write_snapshot(&world, "t000", &volume, None);

        let out_dir = dir.path().join("exports");
        let manifest = export_submap(&world, "t000", (16, 16, 16), 16, Mode::Full, &out_dir).unwrap();
        let manifest_path = out_dir.join("submap_t000_full_z16_y16_x16_r16.json");

        let mut value: Value = serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        value["bytes_npz"] = Value::from(manifest.bytes_npz + 1);
        std::fs::write(&manifest_path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(verify_submap_v1(&manifest_path).is_err());
    }
}
