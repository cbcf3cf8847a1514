//! Tracklets, movers and mover scoring.

use crate::detect::ImageObject;

/// Smallest denominator admitted by the score; keeps a perfectly consistent
/// or perfectly centred mover finite.
const SCORE_FLOOR: f64 = 1e-9;

/// A candidate two-point track across consecutive groups.
///
/// Carries snapshots of both objects so mover assembly can overlap the next
/// sweep step, plus the object indices for joining tracklet lists.
#[derive(Debug, Clone)]
pub struct Tracklet {
    /// 0 joins groups 0 and 1; 1 joins groups 1 and 2.
    pub gap: usize,
    /// Object indices within the two groups' detection lists.
    pub from_id: usize,
    pub to_id: usize,
    pub from: ImageObject,
    pub to: ImageObject,
    /// Measured motion, arcsec/min.
    pub motion: f64,
    /// Measured position angle, radians.
    pub pa: f64,
}

/// A confirmed three-point candidate across all groups.
#[derive(Debug, Clone)]
pub struct Mover {
    pub objects: [ImageObject; 3],
    /// Mean of the two tracklet motions, arcsec/min.
    pub motion: f64,
    /// Position angle of the first-to-last line, radians.
    pub pa: f64,
    /// Distance of the middle object from the interpolated track, pixels.
    pub err_mid: f64,
    pub score: f64,
    pub status: &'static str,
}

impl Mover {
    pub fn new(objects: [ImageObject; 3], motion: f64, pa: f64, err_mid: f64) -> Self {
        let score = score_objects(&objects, err_mid);
        Self {
            objects,
            motion,
            pa,
            err_mid,
            score,
            status: "candidate",
        }
    }

    /// Tolerance equality: the same sky track found at a neighbouring sweep
    /// step lands within a few aperture radii on the first two objects.
    pub fn is_same_as(&self, other: &Mover, aperture_radius: f64) -> bool {
        let d0 = self.objects[0].position().distance(&other.objects[0].position());
        let d1 = self.objects[1].position().distance(&other.objects[1].position());
        d0 + d1 < 3.0 * aperture_radius
    }
}

/// Mover quality: mean SNR over its relative spread, over the mid-point
/// residual. Penalizes dim, inconsistent and off-line candidates alike.
pub fn score_objects(objects: &[ImageObject; 3], err_mid: f64) -> f64 {
    let mean = objects.iter().map(|o| o.snr).sum::<f64>() / 3.0;
    let variance = objects
        .iter()
        .map(|o| (o.snr - mean) * (o.snr - mean))
        .sum::<f64>()
        / 2.0;
    let relative = variance.sqrt() / mean.max(SCORE_FLOOR);
    (mean / relative.max(SCORE_FLOOR)) / err_mid.max(SCORE_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(x: f64, y: f64, snr: f64) -> ImageObject {
        ImageObject {
            x,
            y,
            ob_size: 12,
            t_count: 6,
            flux: snr * 0.1,
            snr,
        }
    }

    fn mover_at(x0: f64, snrs: [f64; 3], err_mid: f64) -> Mover {
        Mover::new(
            [
                object(x0, 10.0, snrs[0]),
                object(x0 + 5.0, 10.0, snrs[1]),
                object(x0 + 10.0, 10.0, snrs[2]),
            ],
            1.0,
            1.5,
            err_mid,
        )
    }

    #[test]
    fn test_brighter_scores_higher_at_equal_spread() {
        // Same relative spread and err_mid; double the SNR doubles the score.
        let dim = mover_at(10.0, [10.0, 11.0, 12.0], 0.5);
        let bright = mover_at(10.0, [20.0, 22.0, 24.0], 0.5);
        assert!(bright.score > dim.score);
    }

    #[test]
    fn test_inconsistent_scores_lower() {
        let steady = mover_at(10.0, [10.0, 10.5, 11.0], 0.5);
        let ragged = mover_at(10.0, [5.0, 10.5, 16.0], 0.5);
        assert!(steady.score > ragged.score);
    }

    #[test]
    fn test_off_line_scores_lower() {
        let centred = mover_at(10.0, [10.0, 11.0, 12.0], 0.2);
        let offset = mover_at(10.0, [10.0, 11.0, 12.0], 1.0);
        assert!(centred.score > offset.score);
    }

    #[test]
    fn test_identical_snrs_stay_finite() {
        let mover = mover_at(10.0, [10.0, 10.0, 10.0], 0.5);
        assert!(mover.score.is_finite());
        assert!(mover.score > 0.0);
    }

    #[test]
    fn test_is_same_as_reflexive_and_symmetric() {
        let a = mover_at(10.0, [10.0, 11.0, 12.0], 0.5);
        let b = mover_at(13.0, [9.0, 10.0, 11.0], 0.4);
        let c = mover_at(40.0, [9.0, 10.0, 11.0], 0.4);
        assert!(a.is_same_as(&a, 3.0));
        assert_eq!(a.is_same_as(&b, 3.0), b.is_same_as(&a, 3.0));
        assert!(a.is_same_as(&b, 3.0));
        assert!(!a.is_same_as(&c, 3.0));
    }

    #[test]
    fn test_sample_stddev_uses_two_denominator() {
        // SNRs 9, 12, 15: mean 12, squared deviations 9+0+9, variance 9.
        // relative spread 3/12, score = (12 / 0.25) / err_mid.
        let mover = mover_at(10.0, [9.0, 12.0, 15.0], 1.0);
        approx::assert_relative_eq!(mover.score, 48.0, epsilon = 1e-9);
    }
}
