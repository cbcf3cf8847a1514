//! Stacked-image buffer with histogram-derived levels.

use ndarray::Array2;
use shared::ImageSize;

/// Histogram resolution for [0, 1] pixel data.
const STACK_BINS: usize = 1024;

/// Cumulative fraction one sigma above the median of a normal distribution.
const ONE_SIGMA_HIGH: f64 = 0.8413;

/// A stacked image shared between the pipeline and the display collaborator.
#[derive(Debug, Clone)]
pub struct StackedImage {
    pub size: ImageSize,
    /// Pixel grid in [0, 1], `(row, col)`.
    pub pixels: Array2<f32>,
    /// Histogram-derived background level.
    pub background: f64,
    /// Histogram-derived background noise.
    pub sigma: f64,
    /// Detection (or star-mask) threshold.
    pub threshold: f64,
    /// Display stretch levels.
    pub black: f64,
    pub white: f64,
    /// Set on every rebuild; cleared by the renderer.
    pub dirty: bool,
}

impl StackedImage {
    pub fn new(size: ImageSize) -> Self {
        Self {
            size,
            pixels: size.empty_pixels(),
            background: 0.0,
            sigma: 1.0 / STACK_BINS as f64,
            threshold: 1.0,
            black: 0.0,
            white: 1.0,
            dirty: false,
        }
    }

    /// Derive background, sigma and levels from the pixel histogram.
    ///
    /// Exactly-zero and exactly-one pixels are excluded: zeros are stacking
    /// fill for out-of-bounds samples and ones are saturation, and either
    /// would skew the order statistics. The background is the median and
    /// sigma the distance to the 0.8413 cumulative point. The threshold is
    /// placed `threshold_sigmas` above the background, which is the
    /// detection sigma for group stacks and the star-mask sigma for the
    /// superstack.
    pub fn compute_histogram(
        &mut self,
        threshold_sigmas: f64,
        black_sigmas: f64,
        white_sigmas: f64,
    ) {
        let mut bins = vec![0u64; STACK_BINS];
        let mut total = 0u64;
        for &p in self.pixels.iter() {
            if p <= 0.0 || p >= 1.0 {
                continue;
            }
            let idx = ((p as f64) * (STACK_BINS - 1) as f64).round() as usize;
            bins[idx.min(STACK_BINS - 1)] += 1;
            total += 1;
        }

        if total == 0 {
            self.background = 0.0;
            self.sigma = 1.0 / STACK_BINS as f64;
        } else {
            let median_target = total.div_ceil(2);
            let high_target = ((total as f64 * ONE_SIGMA_HIGH).ceil() as u64).min(total);

            let mut cumulative = 0u64;
            let mut median_bin = 0;
            let mut high_bin = 0;
            let mut median_found = false;
            for (idx, &count) in bins.iter().enumerate() {
                cumulative += count;
                if !median_found && cumulative >= median_target {
                    median_bin = idx;
                    median_found = true;
                }
                if cumulative >= high_target {
                    high_bin = idx;
                    break;
                }
            }

            let scale = 1.0 / (STACK_BINS - 1) as f64;
            self.background = median_bin as f64 * scale;
            self.sigma = (((high_bin - median_bin) as f64) * scale).max(scale);
        }

        self.black = (self.background - black_sigmas * self.sigma).max(0.0);
        self.white = (self.background + white_sigmas * self.sigma).min(1.0);
        self.threshold = (self.background + threshold_sigmas * self.sigma).min(1.0);
        self.dirty = true;
    }
}
