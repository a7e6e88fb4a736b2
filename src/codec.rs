//! Per-tile compression. Zstandard is the only codec family in v1.

use crate::error::{CivdError, CivdResult};

/// Default compression level used by the writer when none is specified.
pub const DEFAULT_LEVEL: i32 = 3;

/// Compress a contiguous tile byte buffer.
pub fn compress(data: &[u8], level: i32) -> CivdResult<Vec<u8>> {
    zstd::bulk::compress(data, level).map_err(|e| CivdError::CorruptTile {
        tile_id: String::new(),
        pack: std::path::PathBuf::new(),
        reason: format!("zstd compress failed: {e}"),
    })
}

/// Decompress a tile frame, verifying the decompressed length matches the
/// expected tile byte length exactly.
pub fn decompress(data: &[u8], expected_len: usize) -> CivdResult<Vec<u8>> {
    let out = zstd::bulk::decompress(data, expected_len).map_err(|e| CivdError::CorruptTile {
        tile_id: String::new(),
        pack: std::path::PathBuf::new(),
        reason: format!("zstd decompress failed: {e}"),
    })?;
    if out.len() != expected_len {
        return Err(CivdError::CorruptTile {
            tile_id: String::new(),
            pack: std::path::PathBuf::new(),
            reason: format!("decompressed {} bytes, expected {expected_len}", out.len()),
        });
    }
    Ok(out)
}

/// The byte length of one tile's canonical C-order float32 encoding.
#[must_use]
pub fn tile_byte_len(tile_size: i64, channels: usize) -> usize {
    (tile_size as usize).pow(3) * channels * std::mem::size_of::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = vec![0u8; 32 * 32 * 32 * 2 * 4];
        let compressed = compress(&data, DEFAULT_LEVEL).unwrap();
        let decompressed = decompress(&compressed, data.len()).unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn rejects_wrong_expected_len() {
        let data = vec![1u8; 128];
        let compressed = compress(&data, DEFAULT_LEVEL).unwrap();
        assert!(decompress(&compressed, 64).is_err());
    }

    #[test]
    fn tile_byte_len_matches_formula() {
        assert_eq!(tile_byte_len(32, 2), 32 * 32 * 32 * 2 * 4);
    }
}
