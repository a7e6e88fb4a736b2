//! Per-snapshot index: parsing, schema-tolerant bounds normalization, and
//! id/coordinate lookups.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CivdError, CivdResult};

/// `civd.index.v1`, the only schema version this crate writes.
pub const SCHEMA_INDEX_V1: &str = "civd.index.v1";

/// The six-integer half-open bounds of a tile in world voxel coordinates:
/// `(z0, z1, y0, y1, x0, x1)`.
pub type Bounds6 = (i64, i64, i64, i64, i64, i64);

/// A tile's payload: either its own compressed bytes in the owning
/// snapshot's pack, or a pointer to bytes recorded by an earlier snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Local {
        offset: u64,
        length: u64,
    },
    Reference {
        /// Path to the pack file holding the bytes, relative to the
        /// referencing snapshot's directory unless absolute.
        base_pack: PathBuf,
        /// The snapshot name the reference points at, when known. Preferred
        /// over `base_pack` for resolving the referenced snapshot's own
        /// index, falling back to deriving it from `base_pack`'s parent
        /// directory name when absent.
        base_timestamp: Option<String>,
        offset: u64,
        length: u64,
    },
}

/// One tile entry in a snapshot's index.
#[derive(Debug, Clone, PartialEq)]
pub struct TileEntry {
    pub tile_id: String,
    pub tile_coord: (u32, u32, u32),
    pub bounds_zyx: Bounds6,
    pub shape_zyxc: [i64; 4],
    pub codec: String,
    pub hash: Option<String>,
    pub payload: Payload,
    /// Top-level tile keys this crate doesn't interpret, preserved verbatim
    /// and re-emitted on the next `to_json` so a third-party producer's
    /// extension fields survive a round trip through this crate.
    pub extra: Map<String, Value>,
}

impl TileEntry {
    #[must_use]
    pub fn has_own_payload(&self) -> bool {
        matches!(self.payload, Payload::Local { .. })
    }
}

/// A parsed `civd.index.v1` document.
#[derive(Debug, Clone)]
pub struct Index {
    pub schema_version: String,
    pub shape_zyxc: [i64; 4],
    pub tile_size: i64,
    pub pack_path: PathBuf,
    /// Directory `pack_path` (and any relative reference path) is resolved
    /// against — the directory `index.json` itself lived in.
    pub index_dir: PathBuf,
    /// Sorted by `tile_id` for binary search.
    tiles: Vec<TileEntry>,
}

impl Index {
    /// Construct an in-memory index directly (used by the writer, which
    /// never round-trips its own output through JSON before returning it).
    #[must_use]
    pub fn new(
        shape_zyxc: [i64; 4],
        tile_size: i64,
        pack_path: PathBuf,
        index_dir: PathBuf,
        mut tiles: Vec<TileEntry>,
    ) -> Self {
        tiles.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));
        Self {
            schema_version: SCHEMA_INDEX_V1.to_string(),
            shape_zyxc,
            tile_size,
            pack_path,
            index_dir,
            tiles,
        }
    }

    #[must_use]
    pub fn tiles(&self) -> &[TileEntry] {
        &self.tiles
    }

    /// Binary search by tile id, falling back to a linear scan if the
    /// caller constructed the index out of order (never true for indices
    /// produced by this crate's writer, but tolerated for hand-authored
    /// test fixtures and third-party indices).
    #[must_use]
    pub fn find_by_id(&self, tile_id: &str) -> Option<&TileEntry> {
        match self.tiles.binary_search_by(|e| e.tile_id.as_str().cmp(tile_id)) {
            Ok(i) => Some(&self.tiles[i]),
            Err(_) => self.tiles.iter().find(|e| e.tile_id == tile_id),
        }
    }

    pub fn load(path: &Path) -> CivdResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| CivdError::from(e).with_path(path))?;
        let value: Value = serde_json::from_slice(&bytes)?;
        Self::from_value(value, path.parent().unwrap_or_else(|| Path::new(".")))
    }

    /// Parse an already-in-memory document, e.g. one produced by
    /// [`crate::schema::upgrade_legacy_document`] before it is written back
    /// to disk.
    pub fn load_value(value: Value, index_dir: &Path) -> CivdResult<Self> {
        Self::from_value(value, index_dir)
    }

    fn from_value(value: Value, index_dir: &Path) -> CivdResult<Self> {
        let schema_version = require_str(&value, "schema_version", "index")?.to_string();

        let volume = require(&value, "volume", "index")?;
        let shape_zyxc = require(volume, "shape_zyxc", "index.volume")?;
        let shape_zyxc = as_shape4(shape_zyxc, "index.volume.shape_zyxc")?;

        let grid = require(&value, "grid", "index")?;
        let tile_size = require(grid, "tile_size", "index.grid")?
            .as_i64()
            .ok_or_else(|| CivdError::schema("index.grid.tile_size", "not an integer"))?;
        if tile_size <= 0 {
            return Err(CivdError::schema(
                "index.grid.tile_size",
                "must be positive",
            ));
        }

        let pack = require(&value, "pack", "index")?;
        let pack_path_str = require_str(pack, "path", "index.pack")?;
        let pack_path = index_dir.join(pack_path_str);

        let tiles_raw = require(&value, "tiles", "index")?
            .as_array()
            .ok_or_else(|| CivdError::schema("index.tiles", "not an array"))?;
        if tiles_raw.is_empty() {
            return Err(CivdError::schema("index.tiles", "must be non-empty"));
        }

        let mut tiles = Vec::with_capacity(tiles_raw.len());
        for (i, raw) in tiles_raw.iter().enumerate() {
            tiles.push(parse_tile_entry(raw, tile_size, &format!("index.tiles[{i}]"))?);
        }
        tiles.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));

        Ok(Self {
            schema_version,
            shape_zyxc,
            tile_size,
            pack_path,
            index_dir: index_dir.to_path_buf(),
            tiles,
        })
    }
}

fn require<'a>(value: &'a Value, key: &str, ctx: &str) -> CivdResult<&'a Value> {
    value
        .get(key)
        .ok_or_else(|| CivdError::schema(ctx, format!("missing required key: {key}")))
}

fn require_str<'a>(value: &'a Value, key: &str, ctx: &str) -> CivdResult<&'a str> {
    require(value, key, ctx)?
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CivdError::schema(ctx, format!("{key} must be a non-empty string")))
}

fn as_shape4(value: &Value, ctx: &str) -> CivdResult<[i64; 4]> {
    let arr = value
        .as_array()
        .ok_or_else(|| CivdError::schema(ctx, "not an array"))?;
    if arr.len() != 4 {
        return Err(CivdError::schema(ctx, "expected exactly 4 elements"));
    }
    let mut out = [0i64; 4];
    for (i, v) in arr.iter().enumerate() {
        let n = v
            .as_i64()
            .ok_or_else(|| CivdError::schema(ctx, "element is not an integer"))?;
        if n <= 0 {
            return Err(CivdError::schema(ctx, "elements must be positive"));
        }
        out[i] = n;
    }
    Ok(out)
}

/// Normalize any of the three tolerated bounds encodings into the
/// canonical six-int tuple:
/// - `[z0,z1,y0,y1,x0,x1]`
/// - `{z0,z1,y0,y1,x0,x1}`
/// - `{z:[z0,z1], y:[y0,y1], x:[x0,x1]}`
pub fn as_bounds6(value: &Value, ctx: &str) -> CivdResult<Bounds6> {
    if let Some(arr) = value.as_array() {
        if arr.len() != 6 {
            return Err(CivdError::schema(ctx, "bounds list must have 6 elements"));
        }
        let n: Vec<i64> = arr
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| CivdError::schema(ctx, "bounds element is not an integer")))
            .collect::<CivdResult<_>>()?;
        return Ok((n[0], n[1], n[2], n[3], n[4], n[5]));
    }
    if let Some(obj) = value.as_object() {
        if let (Some(z0), Some(z1), Some(y0), Some(y1), Some(x0), Some(x1)) = (
            obj.get("z0"),
            obj.get("z1"),
            obj.get("y0"),
            obj.get("y1"),
            obj.get("x0"),
            obj.get("x1"),
        ) {
            return Ok((
                req_i64(z0, ctx)?,
                req_i64(z1, ctx)?,
                req_i64(y0, ctx)?,
                req_i64(y1, ctx)?,
                req_i64(x0, ctx)?,
                req_i64(x1, ctx)?,
            ));
        }
        if let (Some(z), Some(y), Some(x)) = (obj.get("z"), obj.get("y"), obj.get("x")) {
            let z = pair(z, ctx)?;
            let y = pair(y, ctx)?;
            let x = pair(x, ctx)?;
            return Ok((z.0, z.1, y.0, y.1, x.0, x.1));
        }
    }
    Err(CivdError::schema(
        ctx,
        "bounds must be a 6-element list, a {z0..x1} object, or a {z,y,x} object of pairs",
    ))
}

fn req_i64(v: &Value, ctx: &str) -> CivdResult<i64> {
    v.as_i64()
        .ok_or_else(|| CivdError::schema(ctx, "bounds field is not an integer"))
}

fn pair(v: &Value, ctx: &str) -> CivdResult<(i64, i64)> {
    let arr = v
        .as_array()
        .ok_or_else(|| CivdError::schema(ctx, "axis bounds must be a 2-element list"))?;
    if arr.len() != 2 {
        return Err(CivdError::schema(ctx, "axis bounds must be a 2-element list"));
    }
    Ok((req_i64(&arr[0], ctx)?, req_i64(&arr[1], ctx)?))
}

/// `bounds[1] - bounds[0]`, the tile size a set of bounds implies.
#[must_use]
pub fn infer_tile_size_from_bounds(bounds: Bounds6) -> i64 {
    bounds.1 - bounds.0
}

fn tile_coord_from_bounds(bounds: Bounds6, tile_size: i64) -> (u32, u32, u32) {
    (
        (bounds.0 / tile_size) as u32,
        (bounds.2 / tile_size) as u32,
        (bounds.4 / tile_size) as u32,
    )
}

fn parse_tile_entry(value: &Value, tile_size: i64, ctx: &str) -> CivdResult<TileEntry> {
    let tile_id = require_str(value, "tile_id", ctx)?.to_string();
    let bounds_value = require(value, "bounds_zyx", ctx)?;
    let bounds_zyx = as_bounds6(bounds_value, &format!("{ctx}.bounds_zyx"))?;
    if bounds_zyx.1 - bounds_zyx.0 != tile_size {
        return Err(CivdError::schema(
            ctx,
            format!(
                "bounds span {} does not match grid.tile_size {tile_size}",
                bounds_zyx.1 - bounds_zyx.0
            ),
        ));
    }

    let shape_zyxc = value
        .get("shape_zyxc")
        .map(|v| as_shape4(v, &format!("{ctx}.shape_zyxc")))
        .transpose()?
        .unwrap_or([tile_size, tile_size, tile_size, 1]);

    let codec = value
        .get("codec")
        .and_then(Value::as_str)
        .unwrap_or("zstd")
        .to_string();
    let hash = value
        .get("hash")
        .and_then(Value::as_str)
        .map(str::to_string);

    let known_keys = [
        "tile_id",
        "bounds_zyx",
        "shape_zyxc",
        "codec",
        "hash",
        "offset",
        "length",
        "ref",
    ];
    let extra: Map<String, Value> = value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !known_keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    let payload = if let Some(reference) = value.get("ref") {
        let base_pack = require_str(reference, "base_pack", &format!("{ctx}.ref"))?;
        let base_timestamp = reference
            .get("base_timestamp")
            .and_then(Value::as_str)
            .map(str::to_string);
        let offset = require(reference, "offset", &format!("{ctx}.ref"))?
            .as_u64()
            .ok_or_else(|| CivdError::schema(format!("{ctx}.ref"), "offset is not an integer"))?;
        let length = require(reference, "length", &format!("{ctx}.ref"))?
            .as_u64()
            .ok_or_else(|| CivdError::schema(format!("{ctx}.ref"), "length is not an integer"))?;
        Payload::Reference {
            base_pack: PathBuf::from(base_pack),
            base_timestamp,
            offset,
            length,
        }
    } else {
        let offset = require(value, "offset", ctx)?
            .as_u64()
            .ok_or_else(|| CivdError::schema(ctx, "offset is not an integer"))?;
        let length = require(value, "length", ctx)?
            .as_u64()
            .ok_or_else(|| CivdError::schema(ctx, "length is not an integer"))?;
        Payload::Local { offset, length }
    };

    Ok(TileEntry {
        tile_id,
        tile_coord: tile_coord_from_bounds(bounds_zyx, tile_size),
        bounds_zyx,
        shape_zyxc,
        codec,
        hash,
        payload,
        extra,
    })
}

impl Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Payload::Local { offset, length } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("offset", offset)?;
                map.serialize_entry("length", length)?;
                map.end()
            }
            Payload::Reference {
                base_pack,
                base_timestamp,
                offset,
                length,
            } => {
                let mut map = serializer.serialize_map(Some(1))?;
                let mut inner = Map::new();
                inner.insert(
                    "base_pack".to_string(),
                    Value::String(base_pack.to_string_lossy().into_owned()),
                );
                if let Some(ts) = base_timestamp {
                    inner.insert("base_timestamp".to_string(), Value::String(ts.clone()));
                }
                inner.insert("offset".to_string(), Value::from(*offset));
                inner.insert("length".to_string(), Value::from(*length));
                map.serialize_entry("ref", &inner)?;
                map.end()
            }
        }
    }
}

/// Serialize a full index document back to canonical `civd.index.v1` JSON.
pub fn to_json(index: &Index) -> Value {
    let tiles: Vec<Value> = index
        .tiles
        .iter()
        .map(|t| {
            let mut obj = Map::new();
            obj.insert("tile_id".to_string(), Value::String(t.tile_id.clone()));
            obj.insert(
                "bounds_zyx".to_string(),
                Value::Array(
                    [
                        t.bounds_zyx.0,
                        t.bounds_zyx.1,
                        t.bounds_zyx.2,
                        t.bounds_zyx.3,
                        t.bounds_zyx.4,
                        t.bounds_zyx.5,
                    ]
                    .into_iter()
                    .map(Value::from)
                    .collect(),
                ),
            );
            obj.insert(
                "shape_zyxc".to_string(),
                Value::Array(t.shape_zyxc.into_iter().map(Value::from).collect()),
            );
            obj.insert("codec".to_string(), Value::String(t.codec.clone()));
            if let Some(hash) = &t.hash {
                obj.insert("hash".to_string(), Value::String(hash.clone()));
            }
            match serde_json::to_value(&t.payload).unwrap_or(Value::Null) {
                Value::Object(payload_obj) => obj.extend(payload_obj),
                _ => {}
            }
            obj.extend(t.extra.clone());
            Value::Object(obj)
        })
        .collect();

    serde_json::json!({
        "schema_version": index.schema_version,
        "volume": { "shape_zyxc": index.shape_zyxc },
        "grid": { "tile_size": index.tile_size },
        "pack": { "path": index.pack_path },
        "tiles": tiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_tile(bounds_value: Value) -> Value {
        serde_json::json!({
            "tile_id": "z00_y00_x00",
            "bounds_zyx": bounds_value,
            "shape_zyxc": [32, 32, 32, 2],
            "codec": "zstd",
            "hash": "deadbeef",
            "offset": 0,
            "length": 128,
        })
    }

    #[rstest]
    #[case::list(serde_json::json!([0, 32, 0, 32, 0, 32]))]
    #[case::flat_dict(serde_json::json!({"z0":0,"z1":32,"y0":0,"y1":32,"x0":0,"x1":32}))]
    #[case::axis_pairs(serde_json::json!({"z":[0,32],"y":[0,32],"x":[0,32]}))]
    fn tolerates_all_three_bounds_encodings(#[case] bounds_value: Value) {
        let entry = parse_tile_entry(&sample_tile(bounds_value), 32, "test").unwrap();
        assert_eq!(entry.bounds_zyx, (0, 32, 0, 32, 0, 32));
    }

    #[test]
    fn rejects_mismatched_tile_size() {
        let value = sample_tile(serde_json::json!([0, 16, 0, 16, 0, 16]));
        assert!(parse_tile_entry(&value, 32, "test").is_err());
    }

    #[test]
    fn reference_payload_parses() {
        let value = serde_json::json!({
            "tile_id": "z00_y00_x00",
            "bounds_zyx": [0, 32, 0, 32, 0, 32],
            "shape_zyxc": [32, 32, 32, 2],
            "hash": "deadbeef",
            "ref": {
                "base_pack": "../t000/tiles.zstpack",
                "base_timestamp": "t000",
                "offset": 10,
                "length": 20,
            }
        });
        let entry = parse_tile_entry(&value, 32, "test").unwrap();
        assert!(!entry.has_own_payload());
        match entry.payload {
            Payload::Reference {
                base_timestamp,
                offset,
                length,
                ..
            } => {
                assert_eq!(base_timestamp.as_deref(), Some("t000"));
                assert_eq!((offset, length), (10, 20));
            }
            Payload::Local { .. } => panic!("expected a reference payload"),
        }
    }

    #[test]
    fn unknown_tile_fields_round_trip_opaquely() {
        let mut tile = sample_tile(serde_json::json!([0, 32, 0, 32, 0, 32]));
        tile["producer"] = Value::String("some-other-pipeline".to_string());
        let entry = parse_tile_entry(&tile, 32, "test").unwrap();
        assert_eq!(entry.extra.get("producer"), Some(&Value::String("some-other-pipeline".to_string())));

        let dir = tempfile::tempdir().unwrap();
        let index = Index::new([64, 64, 64, 2], 32, dir.path().join("tiles.zstpack"), dir.path().to_path_buf(), vec![entry]);
        let doc = to_json(&index);
        assert_eq!(doc["tiles"][0]["producer"], "some-other-pipeline");
    }

    #[test]
    fn load_round_trips_through_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.json");
        let doc = serde_json::json!({
            "schema_version": SCHEMA_INDEX_V1,
            "volume": {"shape_zyxc": [64, 64, 64, 2]},
            "grid": {"tile_size": 32},
            "pack": {"path": "tiles.zstpack"},
            "tiles": [sample_tile(serde_json::json!([0,32,0,32,0,32]))],
        });
        std::fs::write(&index_path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let index = Index::load(&index_path).unwrap();
        assert_eq!(index.tile_size, 32);
        assert_eq!(index.shape_zyxc, [64, 64, 64, 2]);
        assert!(index.find_by_id("z00_y00_x00").is_some());
        assert!(index.find_by_id("z99_y00_x00").is_none());
    }
}
