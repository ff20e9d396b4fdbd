//! Root-to-leaf descent through the tile arena

use crate::core::{UVec3, Vec3};
use super::grid::Topology;

/// Where a grid-space point ends up after descent
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LeafHit {
    /// Final tile
    pub tile: usize,
    /// Leaf cell containing the point inside `tile`
    pub cell: UVec3,
    /// Flat index of `cell`
    pub cell_index: usize,
    /// Point coordinate inside `tile`, in `[0, 1]^3`
    pub local: Vec3,
    /// Number of child pointers followed
    pub depth: u32,
}

/// Clamp each component into `[0, 1]`. NaN maps to 0.
#[inline]
pub fn clamp_unit(g: Vec3) -> Vec3 {
    Vec3::new(
        g.x.max(0.0).min(1.0),
        g.y.max(0.0).min(1.0),
        g.z.max(0.0).min(1.0),
    )
}

/// Cell containing the tile-scaled coordinate `s = g * n`
#[inline]
fn cell_of(s: Vec3, n: usize) -> UVec3 {
    let last = (n - 1) as f32;
    let f = s.floor();
    UVec3::new(
        f.x.max(0.0).min(last) as u32,
        f.y.max(0.0).min(last) as u32,
        f.z.max(0.0).min(last) as u32,
    )
}

/// Descend from the root to the tile holding the leaf cell that contains `g`.
///
/// `g` is clamped into the unit cube first, so every input resolves to some
/// leaf. Forward, backward and assignment all go through here, which keeps
/// their boundary behavior identical.
pub fn descend(topology: &Topology<'_>, g: Vec3) -> LeafHit {
    let shape = topology.shape();
    let n = shape.n as f32;
    let mut tile = 0usize;
    let mut g = clamp_unit(g);
    let mut depth = 0u32;

    loop {
        let s = g * n;
        let cell = cell_of(s, shape.n);
        let cell_index = shape.cell_index(tile, cell);
        match topology.child_of(cell_index) {
            // Depth is bounded by the tile count for a validated tree
            Some(next) if (depth as usize) < shape.tiles => {
                g = clamp_unit(s - cell.as_vec3());
                tile = next;
                depth += 1;
            }
            _ => {
                return LeafHit { tile, cell, cell_index, local: g, depth };
            }
        }
    }
}
