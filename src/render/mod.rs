//! Volume rendering through N³-trees

pub mod camera;
pub mod sh;
pub mod volume;

pub use camera::Camera;
pub use volume::{
    DataFormat, MAX_SAMPLES_PER_RAY, MIN_RENDER_CHANNELS, RayBatch, RenderOptions, volume_render,
    volume_render_backward,
};
