use glam::Vec3;

use crate::math::safe_rcp3;

/// Distance value standing in for "no hit". Slab tests and triangle tests
/// compare against it directly, so it doubles as the maximum ray length.
pub const MISS: f32 = 1e30;

/// Result of a closest-hit query. Fits in four 32-bit values so it can be
/// stored compactly; everything needed for shading can be reconstructed
/// from `prim` and the original vertex data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intersection {
    /// Distance along the ray, `MISS` if nothing was hit.
    pub t: f32,
    pub u: f32,
    pub v: f32,
    /// Original input primitive index.
    pub prim: u32,
}

impl Intersection {
    #[inline]
    pub fn none() -> Self {
        Intersection { t: MISS, u: 0.0, v: 0.0, prim: 0 }
    }

    #[inline]
    pub fn is_hit(&self) -> bool {
        self.t < MISS
    }
}

#[derive(Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub inv_direction: Vec3,
    pub hit: Intersection,
}

impl Ray {
    /// Normalizes `direction`; traversal assumes unit length.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        let direction = direction.normalize_or_zero();
        Ray {
            origin,
            direction,
            inv_direction: safe_rcp3(direction),
            hit: Intersection::none(),
        }
    }

    /// Restrict the ray to hits closer than `t`.
    pub fn with_max_t(mut self, t: f32) -> Self {
        self.hit.t = t;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_normalizes_direction() {
        let ray = Ray::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 10.0));
        assert_eq!(ray.direction, Vec3::Z);
        assert_eq!(ray.inv_direction.z, 1.0);
        assert!(!ray.hit.is_hit());
    }

    #[test]
    fn zero_direction_lanes_get_huge_reciprocals() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        assert_eq!(ray.inv_direction.x, 1.0);
        assert_eq!(ray.inv_direction.y.abs(), MISS);
        assert_eq!(ray.inv_direction.z.abs(), MISS);
    }
}
