//! Per-source blend-weight fields.
//!
//! In blended mode each valid pixel's weight is its city-block distance to
//! the nearest invalid pixel or grid edge (a grassfire transform), so weight
//! peaks in the interior of a valid region and decays to zero at its
//! boundary. Draft mode replaces the falloff with a flat constant for fast,
//! non-blended mosaics.

use crate::raster::Grid;

/// Flat weight assigned to valid pixels in draft mode.
pub const DRAFT_WEIGHT: f64 = 1e8;

/// Weighting strategy, fixed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightMode {
    /// Grassfire interior-distance weights for smooth blending.
    Blended,
    /// Flat weights, last-writer-wins compositing.
    Draft,
}

/// Whether a sample counts as data.
#[inline]
fn is_valid(v: f64, nodata: f64) -> bool {
    v != nodata && !v.is_nan()
}

/// Two-pass city-block grassfire transform of the valid mask of `grid`.
///
/// Invalid pixels get 0; a valid pixel gets its distance to the nearest
/// invalid pixel or grid edge, so pixels on the grid border get 1.
pub fn grassfire(grid: &Grid, nodata: f64) -> Grid {
    let (cols, rows) = (grid.cols, grid.rows);
    let inf = (cols + rows + 2) as f64;
    let mut dist = Grid::filled(cols, rows, 0.0);

    // Forward pass: left and top neighbors; outside the grid counts as 0.
    for r in 0..rows {
        for c in 0..cols {
            if !is_valid(grid.get(c, r), nodata) {
                continue;
            }
            let left = if c > 0 { dist.get(c - 1, r) } else { 0.0 };
            let up = if r > 0 { dist.get(c, r - 1) } else { 0.0 };
            dist.set(c, r, inf.min(left.min(up) + 1.0));
        }
    }

    // Backward pass: right and bottom neighbors.
    for r in (0..rows).rev() {
        for c in (0..cols).rev() {
            if !is_valid(grid.get(c, r), nodata) {
                continue;
            }
            let right = if c + 1 < cols { dist.get(c + 1, r) } else { 0.0 };
            let down = if r + 1 < rows { dist.get(c, r + 1) } else { 0.0 };
            let d = dist.get(c, r).min(right.min(down) + 1.0);
            dist.set(c, r, d);
        }
    }
    dist
}

/// Draft weights: [`DRAFT_WEIGHT`] where the pixel is not nodata, else 0.
pub fn draft_weights(grid: &Grid, nodata: f64) -> Grid {
    let mut wts = Grid::filled(grid.cols, grid.rows, 0.0);
    for r in 0..grid.rows {
        for c in 0..grid.cols {
            if grid.get(c, r) != nodata {
                wts.set(c, r, DRAFT_WEIGHT);
            }
        }
    }
    wts
}

/// Erode `weights` in place: subtract `erode_len` and clamp to
/// `[0, max_cutoff - erode_len]`.
///
/// If no weight exceeds the erosion length the cutoff ceiling is raised by
/// one so the field does not degenerate to all zeros.
pub fn erode(weights: &mut Grid, erode_len: i64) {
    let min_cutoff = erode_len as f64;
    let mut max_cutoff = weights.max_value();
    if max_cutoff <= min_cutoff {
        max_cutoff = min_cutoff + 1.0;
    }
    for r in 0..weights.rows {
        for c in 0..weights.cols {
            let w = (weights.get(c, r) - min_cutoff).clamp(0.0, max_cutoff - min_cutoff);
            weights.set(c, r, w);
        }
    }
}

/// Weights for a cropped source region, under the selected mode, eroded.
pub fn compute_weights(grid: &Grid, nodata: f64, mode: WeightMode, erode_len: i64) -> Grid {
    let mut wts = match mode {
        WeightMode::Blended => grassfire(grid, nodata),
        WeightMode::Draft => draft_weights(grid, nodata),
    };
    erode(&mut wts, erode_len);
    wts
}

#[cfg(test)]
mod tests {
    use super::*;

    const ND: f64 = -9999.0;

    /// 5x5 all-valid grid.
    fn valid_grid() -> Grid {
        Grid::filled(5, 5, 100.0)
    }

    /// True city-block distance to the nearest invalid pixel or edge,
    /// brute-forced.
    fn true_distance(grid: &Grid, nodata: f64, c: usize, r: usize) -> f64 {
        if grid.get(c, r) == nodata || grid.get(c, r).is_nan() {
            return 0.0;
        }
        let mut best = (c + 1)
            .min(grid.cols - c)
            .min(r + 1)
            .min(grid.rows - r) as f64;
        for rr in 0..grid.rows {
            for cc in 0..grid.cols {
                if grid.get(cc, rr) == nodata {
                    let d = (cc.abs_diff(c) + rr.abs_diff(r)) as f64;
                    best = best.min(d);
                }
            }
        }
        best
    }

    #[test]
    fn test_grassfire_all_valid() {
        let wts = grassfire(&valid_grid(), ND);
        // Border pixels are one step from the edge, the center is three.
        assert_eq!(wts.get(0, 0), 1.0);
        assert_eq!(wts.get(2, 0), 1.0);
        assert_eq!(wts.get(1, 1), 2.0);
        assert_eq!(wts.get(2, 2), 3.0);
    }

    #[test]
    fn test_grassfire_matches_brute_force_with_hole() {
        let mut g = Grid::filled(7, 6, 50.0);
        g.set(3, 2, ND);
        g.set(0, 5, ND);
        g.set(6, 0, f64::NAN); // NaN counts as invalid too

        let wts = grassfire(&g, ND);
        for r in 0..g.rows {
            for c in 0..g.cols {
                let expected = if g.get(c, r).is_nan() {
                    0.0
                } else {
                    // Recheck against NaN-as-invalid by brute force
                    let mut best = true_distance(&g, ND, c, r);
                    if g.get(c, r) != ND {
                        let d = (c.abs_diff(6) + r.abs_diff(0)) as f64;
                        best = best.min(d);
                    }
                    best
                };
                assert_eq!(wts.get(c, r), expected, "mismatch at ({c},{r})");
            }
        }
    }

    #[test]
    fn test_grassfire_monotone_toward_interior() {
        let wts = grassfire(&valid_grid(), ND);
        // Walking inward along a row, weight never decreases up to the center.
        for c in 0..2 {
            assert!(wts.get(c + 1, 2) >= wts.get(c, 2));
        }
    }

    #[test]
    fn test_erosion_removes_boundary_weight() {
        let mut g = Grid::filled(9, 9, 10.0);
        g.set(4, 4, ND);
        let mut wts = grassfire(&g, ND);
        let before = wts.clone();
        let k = 2;
        erode(&mut wts, k);
        for r in 0..9 {
            for c in 0..9 {
                if before.get(c, r) <= k as f64 {
                    assert_eq!(wts.get(c, r), 0.0, "({c},{r}) within {k} of an edge");
                } else {
                    assert!(wts.get(c, r) > 0.0);
                }
            }
        }
    }

    #[test]
    fn test_erosion_exceeding_max_weight_zeroes_without_panic() {
        // 2x2 valid grid has max grassfire weight 1; eroding by more than
        // that bumps the cutoff ceiling instead of inverting the clamp
        // range, and every weight lands at 0.
        let g = Grid::filled(2, 2, 5.0);
        let mut wts = grassfire(&g, ND);
        erode(&mut wts, 2);
        for r in 0..2 {
            for c in 0..2 {
                assert_eq!(wts.get(c, r), 0.0);
            }
        }
    }

    #[test]
    fn test_draft_weights_are_flat() {
        let mut g = Grid::filled(4, 4, 1.0);
        g.set(1, 1, ND);
        let wts = draft_weights(&g, ND);
        assert_eq!(wts.get(0, 0), DRAFT_WEIGHT);
        assert_eq!(wts.get(3, 3), DRAFT_WEIGHT);
        assert_eq!(wts.get(1, 1), 0.0);
    }

    #[test]
    fn test_compute_weights_dispatch() {
        let g = valid_grid();
        let blended = compute_weights(&g, ND, WeightMode::Blended, 0);
        let draft = compute_weights(&g, ND, WeightMode::Draft, 0);
        assert_eq!(blended.get(2, 2), 3.0);
        assert_eq!(draft.get(2, 2), DRAFT_WEIGHT);
    }
}
