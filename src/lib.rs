//! svox - sparse voxel N³-trees with differentiable queries and volume rendering

pub mod core;
pub mod math;
pub mod tree;
pub mod render;
pub mod io;
pub mod ops;
pub mod config;

pub use crate::core::{Error, Result};
pub use crate::tree::{N3Tree, Transform, TreeBuilder};
