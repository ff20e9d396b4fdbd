//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// The grid-space domain of a whole tree, `[0, 1]^3`
    pub const UNIT: Aabb = Aabb { min: Vec3::ZERO, max: Vec3::ONE };

    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit() {
        assert_eq!(Aabb::new(Vec3::ZERO, Vec3::ONE), Aabb::UNIT);
    }
}
