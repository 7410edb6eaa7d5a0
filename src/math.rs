use glam::Vec3;

use crate::ray::MISS;

/// Half the surface area of a box with the given extent.
///
/// The factor 2 cancels in every cost comparison, so it is never applied.
#[inline]
pub fn half_area(extent: Vec3) -> f32 {
    if extent.x < -MISS {
        return 0.0; // extent of an empty box
    }
    extent.x * extent.y + extent.y * extent.z + extent.z * extent.x
}

/// Reciprocal that maps near-zero input to a huge value of the same sign,
/// so that slab tests degrade to always-miss instead of producing NaN.
#[inline]
pub fn safe_rcp(x: f32) -> f32 {
    if x.abs() > 1e-12 {
        1.0 / x
    } else {
        x.signum() * MISS
    }
}

#[inline]
pub fn safe_rcp3(v: Vec3) -> Vec3 {
    Vec3::new(safe_rcp(v.x), safe_rcp(v.y), safe_rcp(v.z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_area_of_unit_cube() {
        assert_eq!(half_area(Vec3::ONE), 3.0);
    }

    #[test]
    fn half_area_of_empty_box_is_zero() {
        let extent = Vec3::splat(-MISS) - Vec3::splat(MISS);
        assert_eq!(half_area(extent), 0.0);
    }

    #[test]
    fn safe_rcp_keeps_sign_near_zero() {
        assert_eq!(safe_rcp(0.0), MISS);
        assert_eq!(safe_rcp(-1e-13), -MISS);
        assert_eq!(safe_rcp(2.0), 0.5);
        assert_eq!(safe_rcp(-4.0), -0.25);
    }
}
