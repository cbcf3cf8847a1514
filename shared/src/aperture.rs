//! Oriented oblong aperture generator.
//!
//! A detection aperture for a source trailed along a hypothesized track: the
//! set of integer pixel offsets whose perpendicular distance to a centred
//! track segment of length `L` at angle `θ` is at most the aperture radius
//! `a`. Offsets are sorted by that distance so the centroid refinement can
//! shrink the working radius by walking a prefix of the list.

/// One aperture member: an integer offset and its distance to the track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureCell {
    pub dx: i64,
    pub dy: i64,
    /// Perpendicular distance from the offset to the centred track segment.
    pub dist: f64,
}

/// Oriented oblong aperture with distance-sorted member offsets.
#[derive(Debug, Clone)]
pub struct Aperture {
    /// Aperture radius `a` in pixels.
    pub radius: f64,
    /// Track length `L` in pixels (motion × exposure).
    pub track_len: f64,
    /// Track position angle in radians, eastward from north.
    pub angle: f64,
    /// Member offsets, sorted ascending by `dist`.
    pub cells: Vec<ApertureCell>,
    /// Number of leading cells with `dist ≤ 0.4·a` (the FWHM sub-aperture).
    pub fwhm_count: usize,
    /// Margin needed so every cell of a centred aperture stays in-image:
    /// `a + ⌈L/2⌉ + 1`.
    pub ap_radius: i64,
}

impl Aperture {
    /// Build the aperture for radius `a`, track length `track_len` and track
    /// angle `angle`.
    pub fn new(radius: f64, track_len: f64, angle: f64) -> Self {
        let half = track_len / 2.0;
        // Track endpoints, x east / y north.
        let ex = half * angle.sin();
        let ey = half * angle.cos();

        let ap_radius = (radius + (track_len / 2.0).ceil() + 1.0).ceil() as i64;

        let mut cells = Vec::new();
        for dy in -ap_radius..=ap_radius {
            for dx in -ap_radius..=ap_radius {
                let dist = segment_distance(dx as f64, dy as f64, ex, ey);
                if dist <= radius {
                    cells.push(ApertureCell { dx, dy, dist });
                }
            }
        }
        cells.sort_by(|a, b| a.dist.partial_cmp(&b.dist).unwrap());

        let fwhm_limit = 0.4 * radius;
        let fwhm_count = cells.iter().take_while(|c| c.dist <= fwhm_limit).count();

        Self {
            radius,
            track_len,
            angle,
            cells,
            fwhm_count,
            ap_radius,
        }
    }
}

/// Distance from point `(px, py)` to the segment from `(-ex, -ey)` to
/// `(ex, ey)`.
fn segment_distance(px: f64, py: f64, ex: f64, ey: f64) -> f64 {
    let len_sq = 4.0 * (ex * ex + ey * ey);
    if len_sq < 1e-12 {
        // Degenerate track, plain radial distance.
        return (px * px + py * py).sqrt();
    }
    // Parametrize the segment as (-e) + t·(2e), t in [0, 1].
    let t = (((px + ex) * 2.0 * ex + (py + ey) * 2.0 * ey) / len_sq).clamp(0.0, 1.0);
    let cx = -ex + t * 2.0 * ex;
    let cy = -ey + t * 2.0 * ey;
    let dx = px - cx;
    let dy = py - cy;
    (dx * dx + dy * dy).sqrt()
}
