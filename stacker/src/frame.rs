//! Per-frame pixel buffer, metadata and preparation operations.
//!
//! A frame arrives with raw pixel values (roughly 0..65535 after BZERO) and
//! leaves preparation normalized to [0, 1]: robust background/sigma from a
//! two-pass histogram, linear stretch, optional blur and de-lining, the
//! static offset that aligns it to the run reference, and star subtraction
//! against the superstack.

use ndarray::Array2;
use shared::{EquatorialPoint, GridPoint, ImageSize};

use crate::stack::StackedImage;

/// Raw-histogram resolution; one bin per 16-bit ADU level.
const RAW_BINS: usize = 65536;

/// Cumulative fraction of the 2-sigma-low point used by both histogram
/// passes.
const LOW_TAIL: f64 = 0.0455;

/// 3x3 Gaussian blur coefficients for corner, edge and centre taps.
const BLUR_CORNER: f32 = 0.062147;
const BLUR_EDGE: f32 = 0.124294;
const BLUR_CENTER: f32 = 0.254237;

/// One astronomical exposure and its derived preparation state.
#[derive(Debug, Clone)]
pub struct FrameImage {
    pub size: ImageSize,
    /// Pixel grid, `(row, col)`; [0, 1] after preparation.
    pub pixels: Array2<f32>,
    /// Exposure start as a continuous day count (Julian day).
    pub timestamp: f64,
    /// Exposure length in seconds.
    pub exposure: f64,
    /// Reference celestial coordinate of the frame's WCS.
    pub reference: EquatorialPoint,
    /// Pixel the WCS reference maps to.
    pub ref_pixel: GridPoint,
    /// Angular scale, radians per pixel, x then y. Signed per the WCS.
    pub scale_x: f64,
    pub scale_y: f64,
    /// Field rotation in radians.
    pub rotation: f64,

    /// Background level, in the current pixel domain.
    pub background: f64,
    /// Background noise, in the current pixel domain.
    pub sigma: f64,
    /// Stretch levels in the current pixel domain.
    pub black: f64,
    pub white: f64,
    /// Mean pixel value after star subtraction.
    pub mean_residual: f64,

    /// Static alignment offset to the common reference, pixels.
    pub static_dx: f64,
    pub static_dy: f64,
    /// Tracking offset of the current sweep step, whole pixels.
    pub track_dx: i64,
    pub track_dy: i64,
}

impl FrameImage {
    /// Assemble a frame from loader output.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pixels: Array2<f32>,
        timestamp: f64,
        exposure: f64,
        reference: EquatorialPoint,
        ref_pixel: GridPoint,
        scale_x: f64,
        scale_y: f64,
        rotation: f64,
    ) -> Self {
        let (height, width) = pixels.dim();
        Self {
            size: ImageSize::from_width_height(width, height),
            pixels,
            timestamp,
            exposure,
            reference,
            ref_pixel,
            scale_x,
            scale_y,
            rotation,
            background: 0.0,
            sigma: 1.0,
            black: 0.0,
            white: 65535.0,
            mean_residual: 0.0,
            static_dx: 0.0,
            static_dy: 0.0,
            track_dx: 0,
            track_dy: 0,
        }
    }

    /// Two-pass robust background and noise estimate over the raw pixels.
    ///
    /// Pass 1 histograms the pixel integers and reads the median and the
    /// 2-sigma-low point. Pass 2 drops everything below
    /// `median - lower_clip * sigma` and reads both again, which keeps dead
    /// columns and cold pixels from dragging the estimate down. Stretch
    /// levels are placed `black_sigmas` below and `white_sigmas` above the
    /// final background.
    pub fn compute_histogram(&mut self, lower_clip: f64, black_sigmas: f64, white_sigmas: f64) {
        let mut bins = vec![0u64; RAW_BINS];
        for &p in self.pixels.iter() {
            let idx = (p.round() as i64).clamp(0, RAW_BINS as i64 - 1) as usize;
            bins[idx] += 1;
        }

        let (median0, low0) = histogram_points(&bins);
        let sigma0 = (((median0 - low0) as f64) / 2.0).max(1.0);

        let cut = (median0 as f64 - lower_clip * sigma0).floor();
        for (idx, bin) in bins.iter_mut().enumerate() {
            if (idx as f64) < cut {
                *bin = 0;
            }
        }

        let (median, low) = histogram_points(&bins);
        self.background = median as f64;
        self.sigma = (((median - low) as f64) / 2.0).max(1.0);
        self.black = (self.background - black_sigmas * self.sigma).clamp(0.0, 65535.0);
        self.white = (self.background + white_sigmas * self.sigma).clamp(0.0, 65535.0);
    }

    /// Linear remap of `[black, white]` onto [0, 1], saturating outside.
    ///
    /// The stored background and sigma follow the pixels into the stretched
    /// domain; black and white become the domain bounds.
    pub fn stretch(&mut self) {
        let span = (self.white - self.black).max(1.0);
        let black = self.black as f32;
        let inv = 1.0 / span as f32;
        self.pixels.mapv_inplace(|p| ((p - black) * inv).clamp(0.0, 1.0));
        self.background = ((self.background - self.black) / span).clamp(0.0, 1.0);
        self.sigma /= span;
        self.black = 0.0;
        self.white = 1.0;
    }

    /// 3x3 Gaussian convolution. Border pixels are left unchanged.
    pub fn blur(&mut self) {
        let (height, width) = self.pixels.dim();
        if height < 3 || width < 3 {
            return;
        }
        let src = self.pixels.clone();
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let corners = src[[y - 1, x - 1]]
                    + src[[y - 1, x + 1]]
                    + src[[y + 1, x - 1]]
                    + src[[y + 1, x + 1]];
                let edges =
                    src[[y - 1, x]] + src[[y + 1, x]] + src[[y, x - 1]] + src[[y, x + 1]];
                self.pixels[[y, x]] =
                    corners * BLUR_CORNER + edges * BLUR_EDGE + src[[y, x]] * BLUR_CENTER;
            }
        }
    }

    /// Per-column normalization against fixed vertical gradient artifacts.
    ///
    /// Each column is divided by its median expressed in units of the frame
    /// background, so a column uniformly brighter than the rest is pulled
    /// back to the common level. Requires a prior histogram.
    pub fn de_line(&mut self) {
        if self.background <= 0.0 {
            return;
        }
        let (height, width) = self.pixels.dim();
        let inv_b = 1.0 / self.background as f32;
        let mut column = vec![0.0f32; height];
        for x in 0..width {
            for y in 0..height {
                column[y] = self.pixels[[y, x]] * inv_b;
            }
            column.sort_by(f32::total_cmp);
            let median = column[height / 2];
            if median > 1e-6 {
                let inv_m = 1.0 / median;
                for y in 0..height {
                    self.pixels[[y, x]] = (self.pixels[[y, x]] * inv_m).clamp(0.0, 1.0);
                }
            }
        }
    }

    /// Compute the static offset aligning this frame to the run reference.
    ///
    /// `reference` is the run's common sky point and `anchor` the pixel it
    /// is pinned to on the common grid. The offset is where the reference
    /// lands in this frame minus the anchor, rotated by the field rotation.
    pub fn set_static_offset(&mut self, reference: &EquatorialPoint, anchor: GridPoint) {
        let (east, north) = self.reference.tangent_offset(reference);
        let px = self.ref_pixel.x as f64 + east / self.scale_x;
        let py = self.ref_pixel.y as f64 + north / self.scale_y;
        let dx = px - anchor.x as f64;
        let dy = py - anchor.y as f64;
        let (sin_r, cos_r) = self.rotation.sin_cos();
        self.static_dx = dx * cos_r - dy * sin_r;
        self.static_dy = dx * sin_r + dy * cos_r;
    }

    /// Set the whole-pixel tracking offset for a motion hypothesis.
    ///
    /// A synthetic object moving at `motion` arcsec/min along position angle
    /// `pa` is displaced from the group mid-time exposure by the returned
    /// offset; stacking with it accumulates the object coherently.
    pub fn set_tracked_offset(
        &mut self,
        group_mid_time: f64,
        motion: f64,
        pa: f64,
        arcsec_per_px: f64,
    ) -> (i64, i64) {
        let dt_minutes = (self.timestamp - group_mid_time) * 1440.0;
        let displacement_px = dt_minutes * motion / arcsec_per_px;
        self.track_dx = (displacement_px * pa.sin()).round() as i64;
        self.track_dy = (displacement_px * pa.cos()).round() as i64;
        (self.track_dx, self.track_dy)
    }

    /// Remove the static sky from this frame using the superstack.
    ///
    /// The superstack is shifted by the frame's static offset into the
    /// frame's own grid. Pixels under a star core (superstack above its
    /// threshold) are replaced with the frame background outright; elsewhere
    /// the background-relative superstack level is subtracted. Updates the
    /// running mean of the residual frame.
    pub fn subtract(&mut self, super_stack: &StackedImage) {
        let sdx = self.static_dx.round() as i64;
        let sdy = self.static_dy.round() as i64;
        let (height, width) = self.pixels.dim();
        let background = self.background as f32;
        let super_bg = super_stack.background as f32;
        let super_threshold = super_stack.threshold as f32;

        let mut sum = 0.0f64;
        for y in 0..height {
            for x in 0..width {
                let sp = GridPoint::new(x as i64 - sdx, y as i64 - sdy);
                if super_stack.size.contains(sp) {
                    let s = super_stack.pixels[[sp.y as usize, sp.x as usize]];
                    let p = &mut self.pixels[[y, x]];
                    if s > super_threshold {
                        *p = background;
                    } else {
                        *p = (*p - (s - super_bg)).clamp(0.0, 1.0);
                    }
                }
                sum += self.pixels[[y, x]] as f64;
            }
        }
        self.mean_residual = sum / self.size.pixel_count() as f64;
    }

    /// Divide out a synthetic flat field where it is positive.
    pub fn divide(&mut self, flat: &Array2<f32>) {
        ndarray::Zip::from(&mut self.pixels)
            .and(flat)
            .for_each(|p, &f| {
                if f > 0.0 {
                    *p = (*p / f).clamp(0.0, 1.0);
                }
            });
    }

    /// Shift pixels so the stored background moves to `target`.
    pub fn normalize_background(&mut self, target: f64) {
        let delta = (self.background - target) as f32;
        self.pixels.mapv_inplace(|p| (p - delta).clamp(0.0, 1.0));
        self.background = target;
    }

    /// Sample a pixel at a (possibly out-of-bounds) grid point.
    pub fn sample(&self, point: GridPoint) -> Option<f32> {
        if self.size.contains(point) {
            Some(self.pixels[[point.y as usize, point.x as usize]])
        } else {
            None
        }
    }

    /// Exposure end as a day count.
    pub fn end_timestamp(&self) -> f64 {
        self.timestamp + self.exposure / 86400.0
    }
}

/// Median bin and the `LOW_TAIL` cumulative bin of a histogram.
fn histogram_points(bins: &[u64]) -> (usize, usize) {
    let total: u64 = bins.iter().sum();
    if total == 0 {
        return (0, 0);
    }
    let median_target = total.div_ceil(2);
    let low_target = ((total as f64 * LOW_TAIL).ceil() as u64).max(1);

    let mut cumulative = 0u64;
    let mut median = 0;
    let mut low = 0;
    let mut low_found = false;
    for (idx, &count) in bins.iter().enumerate() {
        cumulative += count;
        if !low_found && cumulative >= low_target {
            low = idx;
            low_found = true;
        }
        if cumulative >= median_target {
            median = idx;
            break;
        }
    }
    (median, low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn test_frame(pixels: Array2<f32>) -> FrameImage {
        FrameImage::new(
            pixels,
            2_460_000.5,
            60.0,
            EquatorialPoint::new(1.0, 0.2),
            GridPoint::new(50, 50),
            -4.85e-6,
            4.85e-6,
            0.0,
        )
    }

    fn noise_pixels(size: (usize, usize), mean: f64, std_dev: f64, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, std_dev).unwrap();
        Array2::from_shape_fn(size, |_| normal.sample(&mut rng) as f32)
    }

    #[test]
    fn test_histogram_recovers_background() {
        let mut frame = test_frame(noise_pixels((100, 100), 1000.0, 10.0, 7));
        frame.compute_histogram(3.0, 3.0, 6.0);
        assert_abs_diff_eq!(frame.background, 1000.0, epsilon = 3.0);
        // The 4.55% point sits near 1.7 sigma below the median, so the
        // half-distance estimate lands below the true sigma but well off zero.
        assert!(frame.sigma > 4.0 && frame.sigma < 14.0);
        assert!(frame.black < frame.background);
        assert!(frame.white > frame.background);
    }

    #[test]
    fn test_stretch_bounds_and_background() {
        let mut frame = test_frame(noise_pixels((80, 80), 1200.0, 15.0, 11));
        frame.compute_histogram(3.0, 3.0, 6.0);
        frame.stretch();
        for &p in frame.pixels.iter() {
            assert!((0.0..=1.0).contains(&p));
        }
        assert!(frame.background > 0.0 && frame.background < 1.0);
        assert_eq!(frame.black, 0.0);
        assert_eq!(frame.white, 1.0);
    }

    #[test]
    fn test_blur_preserves_flat_interior() {
        let mut frame = test_frame(Array2::from_elem((10, 10), 0.5f32));
        frame.blur();
        // Kernel sums to one, so a flat field stays flat.
        assert_relative_eq!(frame.pixels[[5, 5]], 0.5, epsilon = 1e-5);
        // Border untouched by construction.
        assert_eq!(frame.pixels[[0, 3]], 0.5);
    }

    #[test]
    fn test_blur_spreads_point() {
        let mut pixels = Array2::from_elem((9, 9), 0.0f32);
        pixels[[4, 4]] = 1.0;
        let mut frame = test_frame(pixels);
        frame.blur();
        assert_relative_eq!(frame.pixels[[4, 4]], BLUR_CENTER, epsilon = 1e-6);
        assert_relative_eq!(frame.pixels[[4, 3]], BLUR_EDGE, epsilon = 1e-6);
        assert_relative_eq!(frame.pixels[[3, 3]], BLUR_CORNER, epsilon = 1e-6);
    }

    #[test]
    fn test_de_line_flattens_bright_column() {
        let mut pixels = Array2::from_elem((40, 40), 0.2f32);
        for y in 0..40 {
            pixels[[y, 17]] = 0.4;
        }
        let mut frame = test_frame(pixels);
        frame.background = 0.2;
        frame.de_line();
        assert_abs_diff_eq!(frame.pixels[[10, 17]], 0.2, epsilon = 1e-5);
        assert_abs_diff_eq!(frame.pixels[[10, 3]], 0.2, epsilon = 1e-5);
    }

    #[test]
    fn test_static_offset_zero_when_reference_at_anchor() {
        let mut frame = test_frame(Array2::zeros((100, 100)));
        let reference = frame.reference;
        let anchor = frame.ref_pixel;
        frame.set_static_offset(&reference, anchor);
        assert_abs_diff_eq!(frame.static_dx, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(frame.static_dy, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_static_offset_tracks_pointing_shift() {
        let mut frame = test_frame(Array2::zeros((100, 100)));
        // Run reference one pixel north of the frame reference.
        let reference = EquatorialPoint::new(frame.reference.ra, frame.reference.dec + 4.85e-6);
        frame.set_static_offset(&reference, frame.ref_pixel);
        assert_abs_diff_eq!(frame.static_dx, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(frame.static_dy, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_tracked_offset_east_motion() {
        let mut frame = test_frame(Array2::zeros((50, 50)));
        // Five minutes past group mid-time, 1 arcsec/min east, 1 arcsec/px.
        let mid = frame.timestamp - 5.0 / 1440.0;
        let (dx, dy) =
            frame.set_tracked_offset(mid, 1.0, std::f64::consts::FRAC_PI_2, 1.0);
        assert_eq!(dx, 5);
        assert_eq!(dy, 0);
    }

    #[test]
    fn test_subtract_masks_star_and_levels_sky() {
        let mut frame = test_frame(Array2::from_elem((20, 20), 0.3f32));
        frame.background = 0.25;
        frame.pixels[[10, 10]] = 0.9;

        let mut star_stack = StackedImage::new(ImageSize::from_width_height(20, 20));
        star_stack.pixels.fill(0.3);
        star_stack.pixels[[10, 10]] = 0.9;
        star_stack.background = 0.3;
        star_stack.threshold = 0.5;

        frame.subtract(&star_stack);
        // Star core replaced with the frame background.
        assert_relative_eq!(frame.pixels[[10, 10]], 0.25, epsilon = 1e-6);
        // Sky pixels keep the frame level: 0.3 - (0.3 - 0.3) = 0.3.
        assert_relative_eq!(frame.pixels[[5, 5]], 0.3, epsilon = 1e-6);
        assert!(frame.mean_residual > 0.0);
    }

    #[test]
    fn test_divide_guards_nonpositive_flat() {
        let mut frame = test_frame(Array2::from_elem((4, 4), 0.5f32));
        let mut flat = Array2::from_elem((4, 4), 2.0f32);
        flat[[1, 1]] = 0.0;
        frame.divide(&flat);
        assert_relative_eq!(frame.pixels[[0, 0]], 0.25, epsilon = 1e-6);
        assert_relative_eq!(frame.pixels[[1, 1]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_normalize_background_shifts_pixels() {
        let mut frame = test_frame(Array2::from_elem((4, 4), 0.4f32));
        frame.background = 0.4;
        frame.normalize_background(0.3);
        assert_relative_eq!(frame.pixels[[2, 2]], 0.3, epsilon = 1e-6);
        assert_eq!(frame.background, 0.3);
    }
}
