//! World-to-grid coordinate mapping

use serde::{Deserialize, Serialize};

use crate::core::error::ensure;
use crate::core::{Result, Vec3};

/// Affine map from world space into the tree's `[0, 1)^3` grid space:
/// `g = (x + offset) * invradius`, componentwise.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub offset: Vec3,
    pub invradius: Vec3,
}

impl Default for Transform {
    /// Identity: world space already is grid space
    fn default() -> Self {
        Self { offset: Vec3::ZERO, invradius: Vec3::ONE }
    }
}

impl Transform {
    pub fn new(offset: Vec3, invradius: Vec3) -> Self {
        Self { offset, invradius }
    }

    /// Isotropic scale
    pub fn uniform(offset: Vec3, invradius: f32) -> Self {
        Self { offset, invradius: Vec3::splat(invradius) }
    }

    /// Transform mapping the cube `[center - radius, center + radius)` onto `[0, 1)`
    pub fn from_bounds(center: Vec3, radius: Vec3) -> Self {
        Self {
            offset: radius - center,
            invradius: 0.5 / radius,
        }
    }

    /// Build from raw buffers: `offset` must have 3 elements, `invradius`
    /// either 3 or 1 (broadcast).
    pub fn from_slices(offset: &[f32], invradius: &[f32]) -> Result<Self> {
        ensure!(offset.len() == 3, "offset must have 3 elements, got {}", offset.len());
        let invradius = match *invradius {
            [s] => Vec3::splat(s),
            [x, y, z] => Vec3::new(x, y, z),
            _ => {
                return Err(crate::core::Error::precondition(format!(
                    "invradius must have 1 or 3 elements, got {}",
                    invradius.len()
                )))
            }
        };
        Ok(Self { offset: Vec3::from_slice(offset), invradius })
    }

    /// World point to grid point. No clamping.
    #[inline]
    pub fn map(&self, x: Vec3) -> Vec3 {
        (x + self.offset) * self.invradius
    }

    /// World direction to (unnormalized) grid direction
    #[inline]
    pub fn map_direction(&self, d: Vec3) -> Vec3 {
        d * self.invradius
    }

    /// Grid point back to world space
    #[inline]
    pub fn unmap(&self, g: Vec3) -> Vec3 {
        g / self.invradius - self.offset
    }

    /// World-space center and radius of the tree
    pub fn bounds(&self) -> (Vec3, Vec3) {
        let radius = 0.5 / self.invradius;
        (radius - self.offset, radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let t = Transform::default();
        let p = Vec3::new(0.25, 0.5, 0.75);
        assert_eq!(t.map(p), p);
        assert_eq!(t.unmap(p), p);
    }

    #[test]
    fn test_map_is_affine() {
        let t = Transform::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.5, 0.25, 2.0));
        let g = t.map(Vec3::new(1.0, 2.0, -2.5));
        assert_eq!(g, Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(t.map_direction(Vec3::ONE), Vec3::new(0.5, 0.25, 2.0));
    }

    #[test]
    fn test_from_bounds() {
        let t = Transform::from_bounds(Vec3::new(10.0, 0.0, -4.0), Vec3::splat(2.0));
        assert_eq!(t.map(Vec3::new(8.0, -2.0, -6.0)), Vec3::ZERO);
        assert_eq!(t.map(Vec3::new(12.0, 2.0, -2.0)), Vec3::ONE);
        let (center, radius) = t.bounds();
        assert_eq!(center, Vec3::new(10.0, 0.0, -4.0));
        assert_eq!(radius, Vec3::splat(2.0));
    }

    #[test]
    fn test_unmap_inverts_map() {
        let t = Transform::from_bounds(Vec3::new(1.0, -1.0, 0.5), Vec3::new(2.0, 4.0, 8.0));
        let x = Vec3::new(0.3, 1.7, -2.0);
        assert!((t.unmap(t.map(x)) - x).length() < 1e-5);
    }

    #[test]
    fn test_from_slices() {
        let t = Transform::from_slices(&[0.5, 0.5, 0.5], &[2.0]).unwrap();
        assert_eq!(t.invradius, Vec3::splat(2.0));
        let t = Transform::from_slices(&[0.0; 3], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(t.invradius, Vec3::new(1.0, 2.0, 3.0));
        assert!(Transform::from_slices(&[0.0; 2], &[1.0]).is_err());
        assert!(Transform::from_slices(&[0.0; 3], &[1.0, 2.0]).is_err());
    }
}
