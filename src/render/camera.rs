//! Pinhole camera producing world-space primary rays

use rayon::prelude::*;

use crate::core::{Mat3, Quat, Vec3};

/// Elevation is kept off the poles so the orbit basis stays defined
const MAX_ELEVATION_DEGREES: f32 = 89.0;

/// Camera with position, rotation, and projection parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
}

impl Camera {
    /// Camera at `position` looking down -Z
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
        }
    }

    /// Camera at `position` looking at `target`
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3, fov_y_degrees: f32, aspect: f32) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);
        let rotation = Quat::from_mat3(&Mat3::from_cols(right, up, -forward));

        Self {
            position,
            rotation,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
        }
    }

    /// Camera on a sphere of radius `distance` around `target`, +Y up.
    /// Azimuth 0 sits on +Z; elevation is clamped short of the poles.
    pub fn orbit(
        target: Vec3,
        distance: f32,
        elevation_degrees: f32,
        azimuth_degrees: f32,
        fov_y_degrees: f32,
        aspect: f32,
    ) -> Self {
        let elevation = elevation_degrees
            .clamp(-MAX_ELEVATION_DEGREES, MAX_ELEVATION_DEGREES)
            .to_radians();
        let azimuth = azimuth_degrees.to_radians();
        let offset = Vec3::new(
            elevation.cos() * azimuth.sin(),
            elevation.sin(),
            elevation.cos() * azimuth.cos(),
        ) * distance;
        Self::look_at(target + offset, target, Vec3::Y, fov_y_degrees, aspect)
    }

    /// Get forward direction (negative Z in camera space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Get right direction (positive X in camera space)
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Get up direction (positive Y in camera space)
    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// Unit ray direction through normalized device coordinates in `[-1, 1]`,
    /// +Y up
    pub fn ray_direction(&self, ndc_x: f32, ndc_y: f32) -> Vec3 {
        let half = (self.fov_y * 0.5).tan();
        (self.forward() + self.right() * (ndc_x * half * self.aspect) + self.up() * (ndc_y * half))
            .normalize()
    }

    /// One ray through the center of every pixel, row-major from the top-left.
    /// Returns `(origins, dirs)`.
    pub fn generate_rays(&self, width: u32, height: u32) -> (Vec<Vec3>, Vec<Vec3>) {
        let (w, h) = (width as usize, height as usize);
        let dirs: Vec<Vec3> = (0..w * h)
            .into_par_iter()
            .map(|i| {
                let (x, y) = ((i % w) as f32, (i / w) as f32);
                let ndc_x = 2.0 * (x + 0.5) / width as f32 - 1.0;
                let ndc_y = 1.0 - 2.0 * (y + 0.5) / height as f32;
                self.ray_direction(ndc_x, ndc_y)
            })
            .collect();
        (vec![self.position; dirs.len()], dirs)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions() {
        let camera = Camera::default();

        // Default camera looks down -Z
        assert!((camera.forward().z - (-1.0)).abs() < 0.001);
        assert!((camera.right().x - 1.0).abs() < 0.001);
        assert!((camera.up().y - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_look_at_faces_target() {
        let camera = Camera::look_at(Vec3::new(3.0, 1.0, 2.0), Vec3::ZERO, Vec3::Y, 45.0, 1.0);
        let expected = (-Vec3::new(3.0, 1.0, 2.0)).normalize();
        assert!(camera.forward().abs_diff_eq(expected, 1e-5));
        assert!(camera.right().dot(Vec3::Y).abs() < 1e-5);
    }

    #[test]
    fn test_orbit_distance_and_azimuth() {
        let target = Vec3::splat(0.5);
        let camera = Camera::orbit(target, 2.0, 0.0, 0.0, 40.0, 1.0);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.5, 0.5, 2.5), 1e-5));

        let side = Camera::orbit(target, 2.0, 30.0, 90.0, 40.0, 1.0);
        assert!((side.position.distance(target) - 2.0).abs() < 1e-5);
        assert!(side.position.x > target.x && side.position.y > target.y);
        assert!(side.forward().abs_diff_eq((target - side.position).normalize(), 1e-5));
    }

    #[test]
    fn test_orbit_pole_is_clamped() {
        let camera = Camera::orbit(Vec3::ZERO, 1.0, 90.0, 0.0, 40.0, 1.0);
        assert!(camera.forward().is_finite());
        assert!(camera.right().is_finite());
    }

    #[test]
    fn test_generate_rays() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), 90.0, 2.0);
        let (origins, dirs) = camera.generate_rays(4, 2);
        assert_eq!(origins.len(), 8);
        assert!(origins.iter().all(|&o| o == camera.position));
        assert!(dirs.iter().all(|d| (d.length() - 1.0).abs() < 1e-5));
        // Top-left pixel looks left and up, bottom-right looks right and down
        assert!(dirs[0].x < 0.0 && dirs[0].y > 0.0);
        assert!(dirs[7].x > 0.0 && dirs[7].y < 0.0);
        // Symmetric about the view axis
        assert!((dirs[0].x + dirs[3].x).abs() < 1e-6);
        assert!((dirs[0].y + dirs[4].y).abs() < 1e-6);
    }
}
