//! Collision primitives.
//!
//! Narrow-phase only: the world checks every unordered pair each tick, so the
//! tests here are plain circle and box checks without a broad phase.

use crate::math::Vec2;

/// Circles touch when the squared centre distance is within the squared
/// radius sum. Touching counts as a hit.
#[inline]
pub fn circles_overlap(a: Vec2, ra: f32, b: Vec2, rb: f32) -> bool {
    let reach = ra + rb;
    (a - b).len_sq() <= reach * reach
}

/// Which world edges a box crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeHit {
    pub x: bool,
    pub y: bool,
}

impl EdgeHit {
    pub fn any(self) -> bool {
        self.x || self.y
    }
}

/// Axis-aligned world rectangle centred on the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub half: Vec2,
}

impl Bounds {
    pub fn new(half_width: f32, half_height: f32) -> Self {
        Self {
            half: Vec2::new(half_width, half_height),
        }
    }

    /// Clamps `pos` so the box of size `dim` lies inside, reporting the axes
    /// on which clamping happened.
    pub fn confine(&self, pos: &mut Vec2, dim: Vec2) -> EdgeHit {
        let mut hit = EdgeHit::default();
        confine_axis(&mut pos.x, 0.5 * dim.x, self.half.x, &mut hit.x);
        confine_axis(&mut pos.y, 0.5 * dim.y, self.half.y, &mut hit.y);
        hit
    }

    /// Clamps a point into the rectangle without reporting.
    pub fn clamp_point(&self, p: Vec2) -> Vec2 {
        p.clamp(-self.half, self.half)
    }
}

fn confine_axis(v: &mut f32, extent: f32, half: f32, hit: &mut bool) {
    // A box wider than the world pins to the centre.
    let limit = (half - extent).max(0.0);
    if *v < -limit {
        *v = -limit;
        *hit = true;
    } else if *v > limit {
        *v = limit;
        *hit = true;
    }
}
