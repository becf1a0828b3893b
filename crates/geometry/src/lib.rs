//! Screen-space geometry shared by the graphics crates.

use std::ops::Sub;

pub use euclid::{Point2D as Point, Size2D as Extent};

/// Unit tag for pixel coordinates in a render target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Px;

/// An axis-aligned rectangle described by its min and max corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect<T, U = Px>(euclid::Box2D<T, U>);

impl<T: Copy, U> Rect<T, U> {
    pub fn from_corners(min: Point<T, U>, max: Point<T, U>) -> Self {
        Self(euclid::Box2D::new(min, max))
    }

    pub fn left(&self) -> T {
        self.0.min.x
    }

    pub fn top(&self) -> T {
        self.0.min.y
    }

    pub fn right(&self) -> T {
        self.0.max.x
    }

    pub fn bottom(&self) -> T {
        self.0.max.y
    }

    pub fn extent(&self) -> Extent<T, U>
    where
        T: Sub<T, Output = T>,
    {
        self.0.size()
    }
}

/// The pixel rectangle outside of which rasterized fragments are discarded.
pub type ScissorRect = Rect<i32, Px>;

/// Maps normalized device coordinates onto a render target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub origin: Point<f32, Px>,
    pub extent: Extent<f32, Px>,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// A viewport covering the whole of a `width` x `height` target with the
    /// default `[0, 1]` depth range.
    #[must_use]
    pub fn covering(width: u32, height: u32) -> Self {
        Self {
            origin: Point::new(0.0, 0.0),
            extent: Extent::new(width as f32, height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// The scissor rectangle matching this viewport's pixel coverage.
    #[must_use]
    pub fn scissor(&self) -> ScissorRect {
        let min = Point::new(self.origin.x as i32, self.origin.y as i32);
        let max = Point::new(
            (self.origin.x + self.extent.width) as i32,
            (self.origin.y + self.extent.height) as i32,
        );
        Rect::from_corners(min, max)
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::covering(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_viewport_scissor() {
        let viewport = Viewport::covering(1280, 720);
        let scissor = viewport.scissor();

        assert_eq!(scissor.left(), 0);
        assert_eq!(scissor.top(), 0);
        assert_eq!(scissor.right(), 1280);
        assert_eq!(scissor.bottom(), 720);
        assert_eq!(scissor.extent(), Extent::new(1280, 720));
    }
}
