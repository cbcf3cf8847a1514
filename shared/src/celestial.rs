//! Equatorial coordinates and the small slice of spherical math the
//! pipeline consumes.
//!
//! The stacking pipeline treats celestial math as an external library: it
//! needs a great-circle midpoint for the run reference and a locally linear
//! projection of sky offsets onto the pixel grid. Both live here.

use nalgebra::Vector3;

/// A point on the celestial sphere, RA/Dec in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EquatorialPoint {
    pub ra: f64,
    pub dec: f64,
}

impl EquatorialPoint {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Unit vector in the equatorial frame.
    fn unit_vector(&self) -> Vector3<f64> {
        Vector3::new(
            self.dec.cos() * self.ra.cos(),
            self.dec.cos() * self.ra.sin(),
            self.dec.sin(),
        )
    }

    fn from_unit_vector(v: Vector3<f64>) -> Self {
        Self {
            ra: v.y.atan2(v.x),
            dec: v.z.asin(),
        }
    }

    /// Locally linear offset of `target` from `self` on the tangent plane,
    /// in radians: `x` east (RA compressed by cos dec), `y` north.
    ///
    /// Valid over the small fields the pipeline works with; a full tangent
    /// projection is the job of the WCS collaborator.
    pub fn tangent_offset(&self, target: &EquatorialPoint) -> (f64, f64) {
        let x = (target.ra - self.ra) * self.dec.cos();
        let y = target.dec - self.dec;
        (x, y)
    }
}

/// Midpoint of the great-circle arc between `a` and `b`.
///
/// Computed as the normalized vector sum. For antipodal inputs the midpoint
/// is undefined; `a` is returned so callers never see a NaN reference.
pub fn great_circle_midpoint(a: &EquatorialPoint, b: &EquatorialPoint) -> EquatorialPoint {
    let sum = a.unit_vector() + b.unit_vector();
    let norm = sum.norm();
    if norm < 1e-9 {
        return *a;
    }
    EquatorialPoint::from_unit_vector(sum / norm)
}
