//! Axis-aligned region-of-interest geometry: clamping, tile coverage, and
//! tile/ROI intersection.

/// An axis-aligned, half-open voxel region `[z0,z1) x [y0,y1) x [x0,x1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Roi {
    pub z0: i64,
    pub z1: i64,
    pub y0: i64,
    pub y1: i64,
    pub x0: i64,
    pub x1: i64,
}

impl Roi {
    #[must_use]
    pub fn new(z0: i64, z1: i64, y0: i64, y1: i64, x0: i64, x1: i64) -> Self {
        Self {
            z0,
            z1,
            y0,
            y1,
            x0,
            x1,
        }
    }

    #[must_use]
    pub fn shape_zyx(&self) -> (usize, usize, usize) {
        (
            (self.z1 - self.z0).max(0) as usize,
            (self.y1 - self.y0).max(0) as usize,
            (self.x1 - self.x0).max(0) as usize,
        )
    }
}

fn clamp_axis(lo: i64, hi: i64, dim: i64) -> (i64, i64) {
    let mut lo = lo.clamp(0, dim);
    let mut hi = hi.clamp(0, dim);
    if hi <= lo {
        // Non-empty after clamping: expand by one voxel against whichever
        // edge has room, preferring to grow forward.
        if lo < dim {
            hi = lo + 1;
        } else {
            lo = dim - 1;
            hi = dim;
        }
    }
    (lo, hi)
}

/// Clamp an ROI into `[0, dim)` per axis against `shape_zyx`. If clamping
/// would empty a dimension, expand it to one voxel against the relevant
/// edge so the ROI is never degenerate.
#[must_use]
pub fn clamp_roi(roi: Roi, shape_zyx: (i64, i64, i64)) -> Roi {
    let (z0, z1) = clamp_axis(roi.z0, roi.z1, shape_zyx.0);
    let (y0, y1) = clamp_axis(roi.y0, roi.y1, shape_zyx.1);
    let (x0, x1) = clamp_axis(roi.x0, roi.x1, shape_zyx.2);
    Roi::new(z0, z1, y0, y1, x0, x1)
}

/// Build a symmetric `[c-r, c+r)` ROI around a center voxel, then clamp to
/// the volume shape.
#[must_use]
pub fn roi_from_center_radius(
    center_zyx: (i64, i64, i64),
    radius: i64,
    shape_zyx: (i64, i64, i64),
) -> Roi {
    let roi = Roi::new(
        center_zyx.0 - radius,
        center_zyx.0 + radius,
        center_zyx.1 - radius,
        center_zyx.1 + radius,
        center_zyx.2 - radius,
        center_zyx.2 + radius,
    );
    clamp_roi(roi, shape_zyx)
}

/// The set of tile grid coordinates `(tz, ty, tx)` that an ROI intersects,
/// in lexicographic order.
#[must_use]
pub fn roi_tile_ids(roi: Roi, tile_size: i64) -> Vec<(u32, u32, u32)> {
    let tz_range = tile_coord_range(roi.z0, roi.z1, tile_size);
    let ty_range = tile_coord_range(roi.y0, roi.y1, tile_size);
    let tx_range = tile_coord_range(roi.x0, roi.x1, tile_size);

    let mut out = Vec::new();
    for tz in tz_range.clone() {
        for ty in ty_range.clone() {
            for tx in tx_range.clone() {
                out.push((tz, ty, tx));
            }
        }
    }
    out
}

fn tile_coord_range(lo: i64, hi: i64, tile_size: i64) -> std::ops::RangeInclusive<u32> {
    if hi <= lo {
        // Degenerate: no coverage. Represented as an empty inclusive range
        // by returning 1..=0, which iterates zero times.
        return 1..=0;
    }
    let t0 = lo.div_euclid(tile_size);
    let t1 = (hi - 1).div_euclid(tile_size);
    (t0 as u32)..=(t1 as u32)
}

/// World-space half-open bounds of a tile given its grid coordinates.
#[must_use]
pub fn tile_bounds(tile_coord: (u32, u32, u32), tile_size: i64) -> Roi {
    let (tz, ty, tx) = tile_coord;
    let z0 = i64::from(tz) * tile_size;
    let y0 = i64::from(ty) * tile_size;
    let x0 = i64::from(tx) * tile_size;
    Roi::new(z0, z0 + tile_size, y0, y0 + tile_size, x0, x0 + tile_size)
}

/// The canonical textual tile id, e.g. `"z00_y02_x01"`.
#[must_use]
pub fn tile_id_string(tile_coord: (u32, u32, u32)) -> String {
    let (tz, ty, tx) = tile_coord;
    format!("z{tz:02}_y{ty:02}_x{tx:02}")
}

/// A pair of axis-local boxes describing the overlap between a tile and an
/// ROI: `src` indexes into the tile-local buffer, `dst` indexes into the
/// ROI-local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intersection {
    /// `(z0, z1, y0, y1, x0, x1)` within the tile's own `[0, tile_size)` frame.
    pub src: (usize, usize, usize, usize, usize, usize),
    /// `(z0, z1, y0, y1, x0, x1)` within the ROI's own `[0, roi_extent)` frame.
    pub dst: (usize, usize, usize, usize, usize, usize),
}

/// Compute the overlap between a tile's world-space bounds and an ROI, in
/// both the tile-local and ROI-local coordinate frames. Returns `None` if
/// the tile and ROI do not overlap.
#[must_use]
pub fn intersect(tile_world: Roi, roi: Roi) -> Option<Intersection> {
    let (sz0, sz1, dz0, dz1) = axis_intersect(tile_world.z0, tile_world.z1, roi.z0, roi.z1)?;
    let (sy0, sy1, dy0, dy1) = axis_intersect(tile_world.y0, tile_world.y1, roi.y0, roi.y1)?;
    let (sx0, sx1, dx0, dx1) = axis_intersect(tile_world.x0, tile_world.x1, roi.x0, roi.x1)?;
    Some(Intersection {
        src: (sz0, sz1, sy0, sy1, sx0, sx1),
        dst: (dz0, dz1, dy0, dy1, dx0, dx1),
    })
}

/// Returns `(tile_local_lo, tile_local_hi, roi_local_lo, roi_local_hi)`.
fn axis_intersect(
    tile_lo: i64,
    tile_hi: i64,
    roi_lo: i64,
    roi_hi: i64,
) -> Option<(usize, usize, usize, usize)> {
    let lo = tile_lo.max(roi_lo);
    let hi = tile_hi.min(roi_hi);
    if hi <= lo {
        return None;
    }
    Some((
        (lo - tile_lo) as usize,
        (hi - tile_lo) as usize,
        (lo - roi_lo) as usize,
        (hi - roi_lo) as usize,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_roi_expands_degenerate_axis_against_edge() {
        let roi = Roi::new(-5, 0, 10, 20, 0, 5);
        let clamped = clamp_roi(roi, (256, 256, 256));
        assert_eq!((clamped.z0, clamped.z1), (0, 1));
    }

    #[test]
    fn clamp_roi_expands_against_far_edge_when_at_hi_bound() {
        let roi = Roi::new(256, 300, 0, 10, 0, 10);
        let clamped = clamp_roi(roi, (256, 256, 256));
        assert_eq!((clamped.z0, clamped.z1), (255, 256));
    }

    #[test]
    fn roi_tile_coverage_of_an_80_voxel_cube() {
        // An 80-voxel-wide ROI over a 32-voxel grid touches 4 tiles per
        // axis unless its low edge happens to land on a tile boundary
        // (ceil(80/32) = 3 only in the aligned case; here 88 mod 32 = 24,
        // so the cube spills into a fourth tile on each axis).
        let roi = Roi::new(88, 168, 88, 168, 120, 200);
        let ids = roi_tile_ids(roi, 32);
        assert_eq!(ids.len(), 64);
        assert_eq!(ids[0], (2, 2, 3));
        assert_eq!(*ids.last().unwrap(), (5, 5, 6));
    }

    #[test]
    fn roi_tile_ids_are_lexicographic() {
        let roi = Roi::new(0, 64, 0, 64, 0, 64);
        let ids = roi_tile_ids(roi, 32);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn intersect_is_none_for_disjoint_regions() {
        let tile = tile_bounds((0, 0, 0), 32);
        let roi = Roi::new(32, 64, 32, 64, 32, 64);
        assert!(intersect(tile, roi).is_none());
    }

    #[test]
    fn intersect_partial_overlap_offsets() {
        let tile = tile_bounds((0, 0, 0), 32); // [0,32) each axis
        let roi = Roi::new(16, 48, 16, 48, 16, 48);
        let isect = intersect(tile, roi).unwrap();
        assert_eq!(isect.src, (16, 32, 16, 32, 16, 32));
        assert_eq!(isect.dst, (0, 16, 0, 16, 0, 16));
    }

    #[test]
    fn tile_id_string_is_zero_padded() {
        assert_eq!(tile_id_string((2, 2, 3)), "z02_y02_x03");
    }
}
