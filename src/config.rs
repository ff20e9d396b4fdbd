//! JSON render configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, Vec3};
use crate::render::{Camera, RenderOptions};
use crate::tree::{N3Tree, create_test_sphere};

/// Orbit camera placement around a target point
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    pub target: Vec3,
    pub distance: f32,
    pub elevation_degrees: f32,
    pub azimuth_degrees: f32,
    /// Vertical field of view
    pub fov_degrees: f32,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            target: Vec3::splat(0.5),
            distance: 2.5,
            elevation_degrees: 20.0,
            azimuth_degrees: 30.0,
            fov_degrees: 40.0,
        }
    }
}

/// Demo scene used when no tree file is given
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphereConfig {
    /// Tile side length
    pub n: usize,
    pub max_depth: u32,
    /// Ball radius in grid units
    pub radius: f32,
    pub density: f32,
}

impl Default for SphereConfig {
    fn default() -> Self {
        Self {
            n: 4,
            max_depth: 3,
            radius: 0.35,
            density: 40.0,
        }
    }
}

impl SphereConfig {
    pub fn build(&self) -> Result<N3Tree> {
        create_test_sphere(self.n, self.max_depth, self.radius, self.density)
    }
}

/// Everything needed to render one image
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub camera: OrbitConfig,
    pub render: RenderOptions,
    pub sphere: SphereConfig,
}

impl RenderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        log::info!("loaded render config from {}", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        let fov = self.camera.fov_degrees;
        if !(fov > 0.0 && fov < 180.0) {
            return Err(Error::Config(format!("fov_degrees must be in (0, 180), got {}", fov)));
        }
        if !(self.camera.distance.is_finite() && self.camera.distance > 0.0) {
            return Err(Error::Config(format!(
                "camera distance must be positive, got {}",
                self.camera.distance
            )));
        }
        Ok(())
    }

    pub fn camera(&self) -> Camera {
        let c = &self.camera;
        Camera::orbit(
            c.target,
            c.distance,
            c.elevation_degrees,
            c.azimuth_degrees,
            c.fov_degrees,
            self.width as f32 / self.height as f32,
        )
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            camera: OrbitConfig::default(),
            render: RenderOptions::default(),
            sphere: SphereConfig::default(),
        }
    }
}
