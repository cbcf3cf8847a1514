//! Object detection in stacked images.
//!
//! Detection walks the tracked stack for threshold-exceeding seeds and hands
//! each seed to [`refine_object`], an iterative centre-of-brightness
//! refinement over a shrinking prefix of the distance-sorted aperture. The
//! accepted aperture is cleared to the background in the scratch buffer so a
//! bright object is reported once.

use ndarray::Array2;
use shared::aperture::Aperture;
use shared::{GridPoint, ImageSize, SubPixel};

/// A candidate detection in one group's tracked stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageObject {
    /// Refined sub-pixel location.
    pub x: f64,
    pub y: f64,
    /// Pixels inside the accepted aperture.
    pub ob_size: usize,
    /// Threshold-exceeding pixels inside the accepted aperture.
    pub t_count: usize,
    /// Net flux above background over the accepted aperture.
    pub flux: f64,
    /// Flux over the residual annulus flux (or stack sigma when larger).
    pub snr: f64,
}

impl ImageObject {
    pub fn position(&self) -> SubPixel {
        SubPixel::new(self.x, self.y)
    }
}

/// Flux, pixel count and threshold count over the aperture prefix `d ≤ c`.
struct PrefixSums {
    flux: f64,
    p_count: usize,
    t_count: usize,
}

fn prefix_sums(
    scratch: &Array2<f32>,
    size: ImageSize,
    aperture: &Aperture,
    cx: i64,
    cy: i64,
    c: f64,
    background: f64,
    threshold: f64,
) -> PrefixSums {
    let mut sums = PrefixSums {
        flux: 0.0,
        p_count: 0,
        t_count: 0,
    };
    for cell in &aperture.cells {
        if cell.dist > c {
            break;
        }
        let point = GridPoint::new(cx + cell.dx, cy + cell.dy);
        if !size.contains(point) {
            continue;
        }
        let p = scratch[[point.y as usize, point.x as usize]] as f64;
        sums.flux += p - background;
        sums.p_count += 1;
        if p > threshold {
            sums.t_count += 1;
        }
    }
    sums
}

/// Refine a threshold seed into a detection, or reject it.
///
/// Starting from the full oblong aperture, the centre follows the
/// centre of brightness while the working radius `c` shrinks in half-pixel
/// steps. The candidate is rejected when it cannot hold the required
/// threshold-pixel count, drifts more than the aperture margin from its
/// seed, or reaches the FWHM core without the required flux; it is accepted
/// when threshold pixels saturate the working aperture or the core holds
/// the required flux.
#[allow(clippy::too_many_arguments)]
pub fn refine_object(
    scratch: &mut Array2<f32>,
    size: ImageSize,
    background: f64,
    threshold: f64,
    stack_sigma: f64,
    aperture: &Aperture,
    seed: GridPoint,
    min_pix: usize,
) -> Option<ImageObject> {
    let required_flux = min_pix as f64 * (threshold - background);
    let required_pix = ((min_pix as f64 * 0.5).floor() as usize).max(2);

    let mut cx = seed.x;
    let mut cy = seed.y;

    // Net flux over the whole oblong; a seed that cannot carry the required
    // flux even at full size is noise.
    let full = prefix_sums(
        scratch, size, aperture, cx, cy, f64::MAX, background, threshold,
    );
    if full.flux < required_flux {
        return None;
    }

    let mut flux = full.flux;
    let mut c = aperture.radius + 0.5;
    let mut all_flux = full.flux;
    let mut frac_x = 0.0;
    let mut frac_y = 0.0;

    let (sums, accepted) = loop {
        // Centre of brightness over the current working radius.
        if flux <= 0.0 {
            return None;
        }
        let mut ox = 0.0;
        let mut oy = 0.0;
        for cell in &aperture.cells {
            if cell.dist > c {
                break;
            }
            let point = GridPoint::new(cx + cell.dx, cy + cell.dy);
            if !size.contains(point) {
                continue;
            }
            let weight = (scratch[[point.y as usize, point.x as usize]] as f64 - background) / flux;
            ox += weight * cell.dx as f64;
            oy += weight * cell.dy as f64;
        }
        cx += ox.round() as i64;
        cy += oy.round() as i64;
        frac_x = ox - ox.round();
        frac_y = oy - oy.round();
        if (cx - seed.x).abs() > aperture.ap_radius || (cy - seed.y).abs() > aperture.ap_radius {
            return None;
        }

        c -= 0.5;
        let sums = prefix_sums(scratch, size, aperture, cx, cy, c, background, threshold);
        flux = sums.flux;
        if (c - aperture.radius).abs() < 1e-9 {
            all_flux = sums.flux;
        }

        if sums.t_count < required_pix {
            return None;
        }
        if sums.t_count >= sums.p_count {
            break (sums, true);
        }
        if sums.p_count <= aperture.fwhm_count {
            let ok = sums.flux > required_flux || sums.t_count >= min_pix;
            break (sums, ok);
        }
    };
    if !accepted {
        return None;
    }

    let snr = sums.flux / (all_flux - sums.flux).max(stack_sigma);

    // Clear the accepted aperture so the object is not re-seeded.
    for cell in &aperture.cells {
        let point = GridPoint::new(cx + cell.dx, cy + cell.dy);
        if size.contains(point) {
            scratch[[point.y as usize, point.x as usize]] = background as f32;
        }
    }

    Some(ImageObject {
        x: cx as f64 + frac_x,
        y: cy as f64 + frac_y,
        ob_size: sums.p_count,
        t_count: sums.t_count,
        flux: sums.flux,
        snr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const BG: f64 = 0.1;
    const THRESHOLD: f64 = 0.2;
    const SIGMA: f64 = 0.01;

    fn blob_field(center: (f64, f64), amplitude: f64, width: f64) -> Array2<f32> {
        Array2::from_shape_fn((60, 60), |(y, x)| {
            let dx = x as f64 - center.0;
            let dy = y as f64 - center.1;
            let r2 = dx * dx + dy * dy;
            (BG + amplitude * (-r2 / (2.0 * width * width)).exp()) as f32
        })
    }

    fn size() -> ImageSize {
        ImageSize::from_width_height(60, 60)
    }

    #[test]
    fn test_refines_to_blob_centre() {
        let mut scratch = blob_field((30.0, 28.0), 0.5, 1.5);
        let aperture = Aperture::new(3.0, 0.0, 0.0);
        // Seed two pixels off the true centre.
        let obj = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(32, 29),
            4,
        )
        .expect("blob detected");
        assert_abs_diff_eq!(obj.x, 30.0, epsilon = 0.5);
        assert_abs_diff_eq!(obj.y, 28.0, epsilon = 0.5);
        assert!(obj.flux > 0.0);
        assert!(obj.snr > 1.0);
        assert!(obj.t_count >= 2);
    }

    #[test]
    fn test_rejects_flat_background() {
        let mut scratch = Array2::from_elem((60, 60), BG as f32);
        // A spurious single-pixel seed.
        scratch[[30, 30]] = 0.25;
        let aperture = Aperture::new(3.0, 0.0, 0.0);
        let obj = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(30, 30),
            4,
        );
        assert!(obj.is_none());
    }

    #[test]
    fn test_accepted_aperture_cleared() {
        let mut scratch = blob_field((30.0, 30.0), 0.5, 1.5);
        let aperture = Aperture::new(3.0, 0.0, 0.0);
        let first = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(30, 30),
            4,
        );
        assert!(first.is_some());
        assert_abs_diff_eq!(scratch[[30, 30]], BG as f32, epsilon = 1e-6);
        // The same seed no longer yields a detection.
        let second = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(30, 30),
            4,
        );
        assert!(second.is_none());
    }

    #[test]
    fn test_saturated_region_accepts_early() {
        let mut scratch = Array2::from_elem((60, 60), BG as f32);
        for y in 25..36 {
            for x in 25..36 {
                scratch[[y, x]] = 0.9;
            }
        }
        let aperture = Aperture::new(3.0, 0.0, 0.0);
        let obj = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(30, 30),
            4,
        )
        .expect("saturated region accepted");
        // Every working-aperture pixel exceeds the threshold.
        assert_eq!(obj.t_count, obj.ob_size);
    }

    #[test]
    fn test_broad_faint_glow_rejected() {
        // Plenty of integrated flux but no pixel clears the threshold, so the
        // threshold-pixel floor rejects it.
        let mut scratch = blob_field((30.0, 30.0), 0.08, 4.0);
        let aperture = Aperture::new(3.0, 0.0, 0.0);
        let obj = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(30, 30),
            4,
        );
        assert!(obj.is_none());
    }

    #[test]
    fn test_seed_near_edge_never_panics() {
        let mut scratch = blob_field((1.0, 1.0), 0.5, 1.5);
        let aperture = Aperture::new(3.0, 0.0, 0.0);
        // Seed closer to the border than the aperture margin; reads clamp to
        // the image and the call returns without panicking.
        let _ = refine_object(
            &mut scratch,
            size(),
            BG,
            THRESHOLD,
            SIGMA,
            &aperture,
            GridPoint::new(1, 1),
            4,
        );
    }
}
