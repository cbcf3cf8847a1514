//! One image group: its frames, stacks and latest detections.

use ndarray::Array2;
use shared::aperture::Aperture;
use shared::{GridPoint, ImageSize};

use crate::detect::{refine_object, ImageObject};
use crate::frame::FrameImage;
use crate::settings::Settings;
use crate::stack::StackedImage;

/// Frames of one observation window plus the per-group pipeline state.
///
/// Membership is fixed after construction; the caller guarantees at least
/// one frame (the loader aborts the run otherwise).
#[derive(Debug)]
pub struct GroupStacker {
    pub index: usize,
    pub frames: Vec<FrameImage>,
    pub static_stack: StackedImage,
    pub tracked_stack: StackedImage,
    /// Detections from the most recent tracked stack.
    pub objects: Vec<ImageObject>,
    /// Largest tracking-offset magnitude of the current step, pixels.
    pub edge_band: i64,
    /// Working copy of the tracked stack consumed by the object scan.
    scratch: Array2<f32>,
    /// Per-pixel sample buffer for the median stack.
    sort_buf: Vec<f32>,
}

impl GroupStacker {
    pub fn new(index: usize, frames: Vec<FrameImage>) -> Self {
        // An empty group is rejected before Phase 1; a zero size keeps the
        // construction itself total.
        let size = frames
            .first()
            .map(|f| f.size)
            .unwrap_or_else(|| ImageSize::from_width_height(0, 0));
        Self {
            index,
            sort_buf: Vec::with_capacity(frames.len()),
            frames,
            static_stack: StackedImage::new(size),
            tracked_stack: StackedImage::new(size),
            objects: Vec::new(),
            edge_band: 0,
            scratch: size.empty_pixels(),
        }
    }

    pub fn size(&self) -> ImageSize {
        self.static_stack.size
    }

    /// Group reference time: midpoint of the first exposure start and the
    /// last exposure end, as a day count.
    pub fn mid_time(&self) -> f64 {
        let first = &self.frames[0];
        let last = &self.frames[self.frames.len() - 1];
        (first.timestamp + last.end_timestamp()) / 2.0
    }

    /// Observation window length in minutes, floored at one exposure.
    pub fn elapse_minutes(&self) -> f64 {
        let first = &self.frames[0];
        let last = &self.frames[self.frames.len() - 1];
        let span = (last.timestamp - first.timestamp) * 1440.0;
        span.max(first.exposure / 60.0)
    }

    /// Median-stack the frames under their static offsets.
    ///
    /// Out-of-bounds samples contribute zero, matching the depleted frame
    /// edges; the median suppresses both those and per-frame transients.
    pub fn build_static_stack(&mut self, settings: &Settings) {
        let (height, width) = self.static_stack.pixels.dim();
        let n = self.frames.len();
        let offsets: Vec<GridPoint> = self
            .frames
            .iter()
            .map(|f| GridPoint::new(f.static_dx.round() as i64, f.static_dy.round() as i64))
            .collect();

        for y in 0..height {
            for x in 0..width {
                self.sort_buf.clear();
                for (frame, off) in self.frames.iter().zip(&offsets) {
                    let sample = frame
                        .sample(GridPoint::new(x as i64 + off.x, y as i64 + off.y))
                        .unwrap_or(0.0);
                    self.sort_buf.push(sample);
                }
                self.sort_buf.sort_by(f32::total_cmp);
                self.static_stack.pixels[[y, x]] = self.sort_buf[n / 2];
            }
        }
        self.static_stack
            .compute_histogram(settings.sigma1, settings.black_hist, settings.white_hist);
    }

    /// Mean-stack the frames along a motion hypothesis.
    ///
    /// Each frame is shifted by its static offset plus the whole-pixel
    /// tracking offset for `(motion, pa)` around the group mid-time. The
    /// divisor is the frame count regardless of how many samples were
    /// in-bounds, so depleted edges fade instead of brightening.
    pub fn build_tracked_stack(
        &mut self,
        motion: f64,
        pa: f64,
        arcsec_per_px: f64,
        settings: &Settings,
    ) {
        let mid = self.mid_time();
        let mut max_magnitude = 0i64;
        let offsets: Vec<GridPoint> = self
            .frames
            .iter_mut()
            .map(|frame| {
                let (tdx, tdy) = frame.set_tracked_offset(mid, motion, pa, arcsec_per_px);
                max_magnitude = max_magnitude.max(tdx.abs()).max(tdy.abs());
                GridPoint::new(
                    frame.static_dx.round() as i64 + tdx,
                    frame.static_dy.round() as i64 + tdy,
                )
            })
            .collect();
        self.edge_band = max_magnitude;

        let (height, width) = self.tracked_stack.pixels.dim();
        let inv_n = 1.0 / self.frames.len() as f32;
        for y in 0..height {
            for x in 0..width {
                let mut sum = 0.0f32;
                for (frame, off) in self.frames.iter().zip(&offsets) {
                    if let Some(p) =
                        frame.sample(GridPoint::new(x as i64 + off.x, y as i64 + off.y))
                    {
                        sum += p;
                    }
                }
                self.tracked_stack.pixels[[y, x]] = sum * inv_n;
            }
        }
        self.tracked_stack
            .compute_histogram(settings.sigma1, settings.black_hist, settings.white_hist);
    }

    /// Scan the tracked stack for objects under the given aperture.
    ///
    /// The scan walks an inner rectangle inset far enough that a refined
    /// aperture can never leave the image, seeds on threshold-exceeding
    /// pixels of a scratch copy, and lets the refinement clear each
    /// accepted aperture from that copy.
    pub fn find_objects(&mut self, aperture: &Aperture, settings: &Settings) {
        self.objects.clear();
        self.scratch.assign(&self.tracked_stack.pixels);

        let min_pix = settings.tcount_base + aperture.track_len.floor() as usize;
        let inset = self.edge_band + 4 * aperture.ap_radius;
        let size = self.size();
        if 2 * inset >= size.width as i64 || 2 * inset >= size.height as i64 {
            return;
        }
        let (x0, x1) = (inset, size.width as i64 - inset);
        let (y0, y1) = (inset, size.height as i64 - inset);

        let threshold = self.tracked_stack.threshold as f32;
        for y in y0..y1 {
            for x in x0..x1 {
                if self.scratch[[y as usize, x as usize]] <= threshold {
                    continue;
                }
                if let Some(object) = refine_object(
                    &mut self.scratch,
                    size,
                    self.tracked_stack.background,
                    self.tracked_stack.threshold,
                    self.tracked_stack.sigma,
                    aperture,
                    GridPoint::new(x, y),
                    min_pix,
                ) {
                    self.objects.push(object);
                }
            }
        }
    }
}
