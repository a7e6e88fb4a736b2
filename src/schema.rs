//! Validation of `civd.index.v1` and the one-shot upgrader for pre-v1
//! layouts.
//!
//! [`verify_index_v1`] enforces every invariant in the data model beyond
//! what [`crate::index::Index::load`] already checks at parse time: grid
//! coverage, non-overlapping local offsets, and reference fidelity (a
//! reference entry's bytes must decode to the hash its own entry declares).
//! [`upgrade_index_file`] rewrites a legacy pre-v1 index (flat `shape_zyxc`,
//! `pack_path`, assorted bounds keys) into the canonical layout, atomically.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{CivdError, CivdResult};
use crate::index::{self, Index, Payload, SCHEMA_INDEX_V1};
use crate::tile_store;

/// Outcome of a successful [`verify_index_v1`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub tiles_checked: u64,
    pub references_checked: u64,
}

/// Validate a loaded index against every invariant in the data model.
///
/// `resolve_snapshot_pack` resolves a base snapshot name to its pack path,
/// for reference entries that need another snapshot's index loaded to
/// re-derive bounds — the same callback shape [`crate::tile_store`] takes.
pub fn verify_index_v1(
    idx: &Index,
    resolve_snapshot_pack: impl Fn(&str) -> CivdResult<PathBuf>,
) -> CivdResult<VerifyReport> {
    if idx.schema_version != SCHEMA_INDEX_V1 {
        return Err(CivdError::schema(
            "index.schema_version",
            format!("must be {SCHEMA_INDEX_V1:?}, got {:?}", idx.schema_version),
        ));
    }
    if idx.shape_zyxc.iter().any(|&d| d <= 0) {
        return Err(CivdError::schema("index.volume.shape_zyxc", "elements must be positive"));
    }
    if idx.tile_size <= 0 {
        return Err(CivdError::schema("index.grid.tile_size", "must be positive"));
    }
    if idx.tiles().is_empty() {
        return Err(CivdError::schema("index.tiles", "must be non-empty"));
    }

    let (z, y, x) = (idx.shape_zyxc[0], idx.shape_zyxc[1], idx.shape_zyxc[2]);
    if z % idx.tile_size != 0 || y % idx.tile_size != 0 || x % idx.tile_size != 0 {
        return Err(CivdError::ShapeError(format!(
            "volume shape ({z},{y},{x}) is not a multiple of tile_size {}",
            idx.tile_size
        )));
    }

    let expected_grid: HashSet<(u32, u32, u32)> = crate::geometry::roi_tile_ids(
        crate::geometry::Roi::new(0, z, 0, y, 0, x),
        idx.tile_size,
    )
    .into_iter()
    .collect();
    let mut seen_ids = HashSet::new();

    // (pack_path, offset) -> length, to check non-overlap of local frames
    // within each pack this index owns bytes in.
    let mut local_ranges: Vec<(u64, u64)> = Vec::new();

    let mut report = VerifyReport::default();

    for entry in idx.tiles() {
        if !seen_ids.insert(entry.tile_id.clone()) {
            return Err(CivdError::schema(
                format!("index.tiles[{}]", entry.tile_id),
                "duplicate tile_id",
            ));
        }
        if !expected_grid.contains(&entry.tile_coord) {
            return Err(CivdError::schema(
                format!("index.tiles[{}]", entry.tile_id),
                "tile_coord is not part of this volume's grid",
            ));
        }
        let expected_id = crate::geometry::tile_id_string(entry.tile_coord);
        if expected_id != entry.tile_id {
            return Err(CivdError::schema(
                format!("index.tiles[{}]", entry.tile_id),
                format!("tile_id does not match its bounds_zyx (expected {expected_id})"),
            ));
        }
        if entry.bounds_zyx.1 - entry.bounds_zyx.0 != idx.tile_size
            || entry.bounds_zyx.3 - entry.bounds_zyx.2 != idx.tile_size
            || entry.bounds_zyx.5 - entry.bounds_zyx.4 != idx.tile_size
        {
            return Err(CivdError::schema(
                format!("index.tiles[{}]", entry.tile_id),
                "bounds_zyx span does not match grid.tile_size on every axis",
            ));
        }
        if entry.shape_zyxc[0] != idx.tile_size
            || entry.shape_zyxc[1] != idx.tile_size
            || entry.shape_zyxc[2] != idx.tile_size
        {
            return Err(CivdError::schema(
                format!("index.tiles[{}]", entry.tile_id),
                "shape_zyxc does not match the owning snapshot's tile_size",
            ));
        }

        if let Payload::Local { offset, length } = &entry.payload {
            local_ranges.push((*offset, *length));
        }

        report.tiles_checked += 1;

        if !entry.has_own_payload() {
            let (_array, _stats) = tile_store::decode_tile(entry, idx, &resolve_snapshot_pack)?;
            report.references_checked += 1;
        }
    }

    local_ranges.sort_unstable_by_key(|&(offset, _)| offset);
    for pair in local_ranges.windows(2) {
        let (off_a, len_a) = pair[0];
        let (off_b, _) = pair[1];
        if off_a + len_a > off_b {
            return Err(CivdError::schema(
                "index.tiles",
                format!("local frames overlap at offsets {off_a} and {off_b}"),
            ));
        }
    }
    if let Some(&(last_offset, last_len)) = local_ranges.last() {
        let file_size = std::fs::metadata(&idx.pack_path)
            .map_err(|e| CivdError::from(e).with_path(&idx.pack_path))?
            .len();
        if last_offset + last_len > file_size {
            return Err(CivdError::schema(
                "index.pack",
                format!("tile frame [{last_offset}, {}) exceeds pack file size {file_size}", last_offset + last_len),
            ));
        }
    }

    Ok(report)
}

/// Infer a tile size from whatever's available in a legacy document: an
/// explicit `grid.tile_size`, else the span of the first tile's bounds,
/// else `default_tile_size`.
fn infer_tile_size(doc: &Value, default_tile_size: i64) -> CivdResult<i64> {
    if let Some(ts) = doc.pointer("/grid/tile_size").and_then(Value::as_i64) {
        return Ok(ts);
    }
    if let Some(first) = doc.get("tiles").and_then(Value::as_array).and_then(|t| t.first()) {
        for key in ["bounds_zyx", "bounds", "bounds_zyx6"] {
            if let Some(b) = first.get(key) {
                let bounds6 = index::as_bounds6(b, "legacy tile bounds")?;
                return Ok(index::infer_tile_size_from_bounds(bounds6));
            }
        }
    }
    Ok(default_tile_size)
}

/// Rewrite a legacy pre-v1 document (flat `shape_zyxc`, `pack_path`,
/// assorted per-entry bounds/id keys) into the canonical `civd.index.v1`
/// layout. Already-canonical documents pass through unchanged (besides
/// gaining an explicit `schema_version`).
pub fn upgrade_legacy_document(mut doc: Value, default_tile_size: i64) -> CivdResult<Value> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| CivdError::schema("index", "top-level document must be an object"))?;

    obj.insert(
        "schema_version".to_string(),
        Value::String(SCHEMA_INDEX_V1.to_string()),
    );

    if !obj.get("volume").is_some_and(Value::is_object) {
        let shape = obj
            .remove("shape_zyxc")
            .ok_or_else(|| CivdError::schema("index", "missing volume.shape_zyxc (or legacy shape_zyxc)"))?;
        obj.insert(
            "volume".to_string(),
            serde_json::json!({ "shape_zyxc": shape }),
        );
    }

    if !obj.get("pack").is_some_and(Value::is_object) {
        let path = obj
            .remove("pack_path")
            .ok_or_else(|| CivdError::schema("index", "missing pack.path (or legacy pack_path)"))?;
        obj.insert("pack".to_string(), serde_json::json!({ "path": path }));
    }

    let tile_size = infer_tile_size(&doc, default_tile_size)?;
    doc.as_object_mut()
        .ok_or_else(|| CivdError::schema("index", "top-level document must be an object"))?
        .entry("grid")
        .or_insert_with(|| serde_json::json!({}));
    doc["grid"]["tile_size"] = Value::from(tile_size);

    let tiles = doc
        .get_mut("tiles")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| CivdError::schema("index.tiles", "must be a non-empty array"))?;
    if tiles.is_empty() {
        return Err(CivdError::schema("index.tiles", "must be non-empty"));
    }

    for (i, tile) in tiles.iter_mut().enumerate() {
        let ctx = format!("index.tiles[{i}]");
        let entry = tile
            .as_object_mut()
            .ok_or_else(|| CivdError::schema(ctx.as_str(), "tile entry must be an object"))?;

        let bounds_key = ["bounds_zyx", "bounds", "bounds_zyx6"]
            .into_iter()
            .find(|k| entry.contains_key(*k))
            .ok_or_else(|| CivdError::schema(ctx.as_str(), "missing bounds; cannot upgrade to v1"))?;
        let bounds6 = index::as_bounds6(&entry[bounds_key], &ctx)?;
        entry.retain(|k, _| k != "bounds" && k != "bounds_zyx6");
        entry.insert(
            "bounds_zyx".to_string(),
            serde_json::json!([bounds6.0, bounds6.1, bounds6.2, bounds6.3, bounds6.4, bounds6.5]),
        );

        if !entry.contains_key("tile_id") {
            let legacy_id = entry
                .remove("id")
                .or_else(|| entry.remove("tile"))
                .ok_or_else(|| CivdError::schema(ctx.as_str(), "missing tile_id"))?;
            entry.insert("tile_id".to_string(), legacy_id);
        }
    }

    Ok(doc)
}

/// Upgrade a legacy `index.json` file in place: parse, upgrade, validate,
/// then rewrite atomically (temp file + rename), the same linearisation
/// pattern [`crate::writer::commit_index`] uses for a fresh snapshot.
pub fn upgrade_index_file(path: &Path, default_tile_size: i64) -> CivdResult<()> {
    let bytes = std::fs::read(path).map_err(|e| CivdError::from(e).with_path(path))?;
    let doc: Value = serde_json::from_slice(&bytes)?;
    let upgraded = upgrade_legacy_document(doc, default_tile_size)?;

    // Round-trip through the real parser to confirm the result is a valid
    // v1 document before committing it.
    let index_dir = path.parent().unwrap_or_else(|| Path::new("."));
    Index::load_value(upgraded.clone(), index_dir)?;

    let pretty = serde_json::to_vec_pretty(&upgraded)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &pretty).map_err(|e| CivdError::from(e).with_path(&tmp_path))?;
    std::fs::rename(&tmp_path, path).map_err(|e| CivdError::from(e).with_path(path))?;
    Ok(())
}
