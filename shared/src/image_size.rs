//! Image dimensions and size utilities

use crate::geometry::GridPoint;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image dimensions structure
///
/// Represents the width and height of a frame or stacked image. Pixel buffers
/// throughout the pipeline are `Array2<f32>` in `(row, col)` order, so the
/// constructors here put height first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
}

impl ImageSize {
    /// Create a new ImageSize
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Create a zeroed pixel buffer with this size, shape `(height, width)`.
    pub fn empty_pixels(&self) -> Array2<f32> {
        Array2::zeros((self.height, self.width))
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Whether the (possibly negative) grid point lies inside the image.
    pub fn contains(&self, point: GridPoint) -> bool {
        point.x >= 0
            && point.y >= 0
            && (point.x as usize) < self.width
            && (point.y as usize) < self.height
    }

    /// Convert to tuple (width, height)
    pub fn to_tuple(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl From<(usize, usize)> for ImageSize {
    fn from(dimensions: (usize, usize)) -> Self {
        Self::from_width_height(dimensions.0, dimensions.1)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_bounds() {
        let size = ImageSize::from_width_height(10, 20);
        assert!(size.contains(GridPoint::new(0, 0)));
        assert!(size.contains(GridPoint::new(9, 19)));
        assert!(!size.contains(GridPoint::new(10, 0)));
        assert!(!size.contains(GridPoint::new(0, 20)));
        assert!(!size.contains(GridPoint::new(-1, 5)));
    }

    #[test]
    fn test_empty_pixels_shape() {
        let size = ImageSize::from_width_height(4, 3);
        let pixels = size.empty_pixels();
        assert_eq!(pixels.dim(), (3, 4));
        assert_eq!(size.pixel_count(), 12);
    }
}
