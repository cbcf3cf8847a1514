//! Cross-group coordination: the run reference, normalization, the
//! superstack star mask, flat synthesis, and tracklet/mover assembly.

use log::{debug, info};
use ndarray::Array2;
use shared::celestial::great_circle_midpoint;
use shared::geometry::angle_difference;
use shared::{EquatorialPoint, GridPoint, ImageSize, SubPixel};

use crate::group::GroupStacker;
use crate::mover::{Mover, Tracklet};
use crate::settings::Settings;
use crate::stack::StackedImage;
use crate::sweep::SweepState;

/// Immutable cross-group geometry, fixed before Phase 1.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Common sky reference: great-circle midpoint of the run's first and
    /// last pointing.
    pub reference: EquatorialPoint,
    /// Pixel the reference is pinned to on the common grid.
    pub anchor: GridPoint,
    /// Minutes between consecutive group mid-times.
    pub d_time: [f64; 2],
    /// Longest group window, minutes.
    pub max_elapse: f64,
    /// Plate scale, arcsec per pixel.
    pub arcsec_per_px: f64,
    /// Exposure length, seconds.
    pub exposure: f64,
    pub size: ImageSize,
}

impl RunContext {
    /// Derive the run geometry from the loaded groups.
    pub fn from_groups(groups: &[GroupStacker], arcsec_per_px: f64) -> Self {
        let first = &groups[0].frames[0];
        let last_frames = &groups[2].frames;
        let last = &last_frames[last_frames.len() - 1];
        let reference = great_circle_midpoint(&first.reference, &last.reference);

        let mids = [
            groups[0].mid_time(),
            groups[1].mid_time(),
            groups[2].mid_time(),
        ];
        let d_time = [
            (mids[1] - mids[0]) * 1440.0,
            (mids[2] - mids[1]) * 1440.0,
        ];
        let max_elapse = groups
            .iter()
            .map(GroupStacker::elapse_minutes)
            .fold(0.0, f64::max);

        Self {
            reference,
            anchor: first.ref_pixel,
            d_time,
            max_elapse,
            arcsec_per_px,
            exposure: first.exposure,
            size: first.size,
        }
    }

    /// Trail length of a source at `motion` arcsec/min over one exposure,
    /// in pixels.
    pub fn track_len_px(&self, motion: f64) -> f64 {
        motion * (self.exposure / 60.0) / self.arcsec_per_px
    }
}

/// The coordinator's cross-group working state.
#[derive(Debug)]
pub struct SuperGroup {
    pub context: RunContext,
    /// Tracklet lists for the 0-1 and 1-2 group gaps, rebuilt every step.
    pub tracklets: [Vec<Tracklet>; 2],
    /// Accumulated movers, deduplicated across sweep steps.
    pub movers: Vec<Mover>,
    cursor: usize,
}

impl SuperGroup {
    pub fn new(context: RunContext) -> Self {
        Self {
            context,
            tracklets: [Vec::new(), Vec::new()],
            movers: Vec::new(),
            cursor: 0,
        }
    }

    /// Shift every frame so all backgrounds meet the run mean.
    ///
    /// Returns the common background level.
    pub fn normalize(groups: [&mut GroupStacker; 3]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for group in &groups {
            for frame in &group.frames {
                sum += frame.background;
                count += 1;
            }
        }
        let mean = sum / count as f64;
        for group in groups {
            for frame in &mut group.frames {
                frame.normalize_background(mean);
            }
        }
        info!("normalized {count} frames to background {mean:.4}");
        mean
    }

    /// Median-combine the three static stacks into the superstack.
    ///
    /// The middle of three suppresses anything present in only one group, so
    /// the result carries the static stars alone; its threshold at the
    /// star-mask sigma drives the per-frame subtraction.
    pub fn build_superstack(
        groups: [&GroupStacker; 3],
        settings: &Settings,
        out: &mut StackedImage,
    ) {
        let a = &groups[0].static_stack.pixels;
        let b = &groups[1].static_stack.pixels;
        let c = &groups[2].static_stack.pixels;
        ndarray::Zip::from(&mut out.pixels)
            .and(a)
            .and(b)
            .and(c)
            .for_each(|o, &pa, &pb, &pc| {
                *o = middle_of_three(pa, pb, pc);
            });
        out.compute_histogram(settings.sigma2, settings.black_hist, settings.white_hist);
    }

    /// Synthesize a multiplicative flat as the per-pixel median over every
    /// frame of `pixel / frame mean`.
    pub fn build_flat(groups: [&GroupStacker; 3], out: &mut Array2<f32>) {
        let frame_count: usize = groups.iter().map(|g| g.frames.len()).sum();
        let mut samples = Vec::with_capacity(frame_count);
        let (height, width) = out.dim();
        for y in 0..height {
            for x in 0..width {
                samples.clear();
                for group in &groups {
                    for frame in &group.frames {
                        let mean = frame.mean_residual.max(1e-6) as f32;
                        samples.push(frame.pixels[[y, x]] / mean);
                    }
                }
                samples.sort_by(f32::total_cmp);
                out[[y, x]] = samples[frame_count / 2];
            }
        }
    }

    /// Pair detections of consecutive groups into tracklets.
    ///
    /// Tolerances derive from the current sweep step: half a step of motion
    /// or angle plus twice the positional error on either end.
    pub fn build_tracklets(
        &mut self,
        groups: [&GroupStacker; 3],
        sweep: &SweepState,
        settings: &Settings,
    ) {
        let scale = self.context.arcsec_per_px;
        for gap in 0..2 {
            self.tracklets[gap].clear();
            let d_time = self.context.d_time[gap];
            let expected = sweep.motion * d_time;
            let dist_tol = 0.5 * sweep.motion_step * d_time + 2.0 * settings.pos_err * scale;
            let pa_tol =
                sweep.pa_step / 2.0 + 2.0 * settings.pos_err * scale / expected.max(1e-9);

            for (from_id, from) in groups[gap].objects.iter().enumerate() {
                for (to_id, to) in groups[gap + 1].objects.iter().enumerate() {
                    let dist_arcsec = from.position().distance(&to.position()) * scale;
                    if (dist_arcsec - expected).abs() > dist_tol {
                        continue;
                    }
                    let pa = from.position().position_angle(&to.position());
                    if angle_difference(pa, sweep.pa) > pa_tol {
                        continue;
                    }
                    self.tracklets[gap].push(Tracklet {
                        gap,
                        from_id,
                        to_id,
                        from: from.clone(),
                        to: to.clone(),
                        motion: dist_arcsec / d_time,
                        pa,
                    });
                }
            }
        }
        debug!(
            "tracklets at ({:.2} \"/min, {:.1} deg): {} + {}",
            sweep.motion,
            sweep.pa.to_degrees(),
            self.tracklets[0].len(),
            self.tracklets[1].len()
        );
    }

    /// Join the tracklet lists on their shared middle object into movers.
    ///
    /// Works entirely from the snapshots captured at tracklet time, so it
    /// may overlap the workers' next stacking pass.
    pub fn build_movers(&mut self, settings: &Settings) {
        let d0 = self.context.d_time[0];
        let d1 = self.context.d_time[1];
        let fraction = d0 / (d0 + d1);

        for t1 in &self.tracklets[0] {
            for t2 in &self.tracklets[1] {
                if t1.to_id != t2.from_id {
                    continue;
                }
                let first = t1.from.position();
                let last = t2.to.position();
                let predicted = SubPixel::new(
                    first.x + (last.x - first.x) * fraction,
                    first.y + (last.y - first.y) * fraction,
                );
                let err_mid = predicted.distance(&t1.to.position());
                if err_mid > 2.0 * settings.pos_err {
                    continue;
                }

                let mover = Mover::new(
                    [t1.from.clone(), t1.to.clone(), t2.to.clone()],
                    (t1.motion + t2.motion) / 2.0,
                    first.position_angle(&last),
                    err_mid,
                );
                match self
                    .movers
                    .iter_mut()
                    .find(|m| m.is_same_as(&mover, settings.aperture))
                {
                    Some(existing) => {
                        if mover.score > existing.score {
                            *existing = mover;
                        }
                    }
                    None => self.movers.push(mover),
                }
            }
        }
    }

    /// Order movers best-first.
    pub fn sort_movers(&mut self) {
        self.movers.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.cursor = 0;
    }

    /// Move the selection cursor, saturating at both ends.
    pub fn select_next(&mut self, direction: i64) -> Option<&Mover> {
        if self.movers.is_empty() {
            return None;
        }
        let last = self.movers.len() as i64 - 1;
        self.cursor = (self.cursor as i64 + direction.signum()).clamp(0, last) as usize;
        self.movers.get(self.cursor)
    }
}

/// Middle of three values without a sort.
fn middle_of_three(a: f32, b: f32, c: f32) -> f32 {
    a.max(b).min(a.max(c)).min(b.max(c))
}
