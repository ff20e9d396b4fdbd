//! Core type aliases and re-exports

pub use glam::{Mat3, Quat, UVec3, Vec3};

/// Standard Result type for svox
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;
