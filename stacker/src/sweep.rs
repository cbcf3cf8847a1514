//! Motion/position-angle sweep state.

use std::f64::consts::FRAC_PI_4;

use crate::settings::Settings;

/// Coarse steps used until the first stack establishes the real geometry.
const COARSE_MOTION_STEP: f64 = 0.25;
const COARSE_PA_STEP: f64 = FRAC_PI_4;

/// Current sweep position, step sizes and bounds.
///
/// Written only by the coordinator between barrier exits; workers read it
/// at the top of each Phase 2 iteration.
#[derive(Debug, Clone)]
pub struct SweepState {
    /// Current motion hypothesis, arcsec/min.
    pub motion: f64,
    /// Current position angle, radians.
    pub pa: f64,
    /// Step sizes for the next advance.
    pub motion_step: f64,
    pub pa_step: f64,
    motion_min: f64,
    motion_max: f64,
    pa_min: f64,
    pa_max: f64,
    /// Set once the motion range is exhausted.
    pub finished: bool,
}

impl SweepState {
    pub fn new(settings: &Settings) -> Self {
        let (pa_min, pa_max) = settings.pa_bounds_rad();
        Self {
            motion: settings.motion_min,
            pa: pa_min,
            motion_step: COARSE_MOTION_STEP,
            pa_step: COARSE_PA_STEP,
            motion_min: settings.motion_min,
            motion_max: settings.motion_max,
            pa_min,
            pa_max,
            finished: false,
        }
    }

    /// Derive step sizes from the tracking tolerance.
    ///
    /// A motion error of `trk_err` pixels over the longest group window is
    /// the largest mis-track the stack tolerates, so steps are sized to keep
    /// neighbouring hypotheses within four times that. The PA step is capped
    /// at the coarse 45 degrees for slow motions.
    pub fn recompute_steps(&mut self, trk_err: f64, arcsec_per_px: f64, max_elapse: f64) {
        if max_elapse <= 0.0 {
            return;
        }
        let reach = 4.0 * trk_err * arcsec_per_px;
        self.motion_step = reach / max_elapse;
        self.pa_step = if self.motion > 1e-9 {
            (reach / (self.motion * max_elapse)).min(COARSE_PA_STEP)
        } else {
            COARSE_PA_STEP
        };
    }

    /// Step to the next (motion, PA) hypothesis.
    ///
    /// The position angle advances fastest; when it exceeds its bound the
    /// motion advances and the angle resets. Returns true exactly once, when
    /// the motion range is exhausted, and sets `finished`.
    pub fn advance(&mut self) -> bool {
        self.pa += self.pa_step;
        if self.pa > self.pa_max {
            self.pa = self.pa_min;
            self.motion += self.motion_step;
            if self.motion > self.motion_max {
                self.finished = true;
                return true;
            }
        }
        false
    }

    /// Upper bound on the remaining advances given the current step sizes.
    /// Used to size progress reporting; the true count is lower when steps
    /// grow during the sweep.
    pub fn step_bound(&self) -> u64 {
        let motions = ((self.motion_max - self.motion_min) / self.motion_step).ceil() + 1.0;
        let angles = ((self.pa_max - self.pa_min) / self.pa_step).ceil() + 1.0;
        (motions.max(1.0) * angles.max(1.0)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sweep_settings() -> Settings {
        Settings {
            motion_min: 0.5,
            motion_max: 1.5,
            pa_min: 0.0,
            pa_max: 180.0,
            ..Settings::default()
        }
    }

    #[test]
    fn test_starts_at_lower_bounds() {
        let sweep = SweepState::new(&sweep_settings());
        assert_eq!(sweep.motion, 0.5);
        assert_eq!(sweep.pa, 0.0);
        assert_eq!(sweep.motion_step, COARSE_MOTION_STEP);
        assert_eq!(sweep.pa_step, COARSE_PA_STEP);
        assert!(!sweep.finished);
    }

    #[test]
    fn test_pa_advances_before_motion() {
        let mut sweep = SweepState::new(&sweep_settings());
        assert!(!sweep.advance());
        assert_relative_eq!(sweep.pa, COARSE_PA_STEP);
        assert_eq!(sweep.motion, 0.5);
    }

    #[test]
    fn test_motion_advances_on_pa_wrap() {
        let mut sweep = SweepState::new(&sweep_settings());
        // 180 deg range at 45 deg steps: five angles, then the wrap.
        for _ in 0..4 {
            assert!(!sweep.advance());
        }
        assert!(!sweep.advance());
        assert_eq!(sweep.pa, 0.0);
        assert_relative_eq!(sweep.motion, 0.75);
    }

    #[test]
    fn test_terminates_within_bound() {
        let mut sweep = SweepState::new(&sweep_settings());
        let bound = sweep.step_bound();
        let mut advances = 0u64;
        while !sweep.advance() {
            advances += 1;
            assert!(advances <= bound, "sweep exceeded its step bound");
        }
        assert!(sweep.finished);
    }

    #[test]
    fn test_recomputed_steps() {
        let mut sweep = SweepState::new(&sweep_settings());
        sweep.motion = 1.0;
        // 4 * 1 px * 1 arcsec/px over 10 minutes.
        sweep.recompute_steps(1.0, 1.0, 10.0);
        assert_relative_eq!(sweep.motion_step, 0.4);
        assert_relative_eq!(sweep.pa_step, 0.4);

        // Slow motion caps the PA step at 45 degrees.
        sweep.motion = 0.1;
        sweep.recompute_steps(1.0, 1.0, 10.0);
        assert_relative_eq!(sweep.pa_step, COARSE_PA_STEP);
    }

    #[test]
    fn test_finished_is_sticky_observation() {
        let mut sweep = SweepState::new(&sweep_settings());
        while !sweep.advance() {}
        assert!(sweep.finished);
    }
}
