//! Adaptive tree construction from implicit functions

use rayon::prelude::*;

use crate::core::error::ensure;
use crate::core::{Result, UVec3, Vec3};
use super::n3tree::N3Tree;
use super::transform::Transform;

/// Builds an [`N3Tree`] by refining cells where a predicate asks for detail
/// and then filling every cell from a field evaluated at its center.
///
/// Both closures receive grid-space geometry (`[0, 1)^3`).
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    n: usize,
    channels: usize,
    max_depth: u32,
    transform: Transform,
}

impl TreeBuilder {
    pub fn new(n: usize, channels: usize) -> Self {
        Self {
            n,
            channels,
            max_depth: 0,
            transform: Transform::default(),
        }
    }

    /// Maximum number of levels below the root
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Build the tree.
    ///
    /// * `refine(cell_min, cell_size)` - subdivide this cell?
    /// * `fill(cell_center, cell_size, features)` - write the cell's features
    ///
    /// Interior cells are filled too, so coarse levels hold a sample of the
    /// field rather than zeros.
    pub fn build<R, F>(&self, refine: R, fill: F) -> Result<N3Tree>
    where
        R: Fn(Vec3, f32) -> bool,
        F: Fn(Vec3, f32, &mut [f32]) + Sync,
    {
        ensure!(self.n > 0, "tile side length must be positive");
        let mut tree = N3Tree::new(self.n, self.channels, self.transform)?;

        let mut frontier = vec![(0usize, Vec3::ZERO, 1.0f32, 0u32)];
        while let Some((tile, origin, size, depth)) = frontier.pop() {
            if depth >= self.max_depth {
                continue;
            }
            let cell_size = size / self.n as f32;
            for x in 0..self.n as u32 {
                for y in 0..self.n as u32 {
                    for z in 0..self.n as u32 {
                        let cell = UVec3::new(x, y, z);
                        let cell_min = origin + cell.as_vec3() * cell_size;
                        if refine(cell_min, cell_size) {
                            let child = tree.refine(tile, cell)?;
                            frontier.push((child, cell_min, cell_size, depth + 1));
                        }
                    }
                }
            }
        }

        let n = self.n;
        let k = self.channels;
        let geometry = tree.tile_geometry();
        let per_tile = tree.shape().cells_per_tile();
        if k > 0 {
            tree.data_mut()
                .par_chunks_mut(per_tile * k)
                .zip(geometry.par_iter())
                .for_each(|(tile_data, geom)| {
                    let Some(geom) = geom else { return };
                    for (i, features) in tile_data.chunks_exact_mut(k).enumerate() {
                        let cell = UVec3::new(
                            (i / (n * n)) as u32,
                            ((i / n) % n) as u32,
                            (i % n) as u32,
                        );
                        fill(geom.cell_center(n, cell), geom.cell_size(n), features);
                    }
                });
        }

        log::debug!(
            "built tree: {} tiles, {} leaves, depth {}",
            tree.tile_count(),
            tree.leaf_count(),
            tree.depth()
        );
        Ok(tree)
    }
}

/// A density + RGB (`K = 4`) ball of radius `radius` (grid units) centered in
/// the unit cube, refined around its surface. Used by the CLI demo and benches.
pub fn create_test_sphere(n: usize, max_depth: u32, radius: f32, density: f32) -> Result<N3Tree> {
    let center = Vec3::splat(0.5);
    TreeBuilder::new(n, 4)
        .max_depth(max_depth)
        .build(
            |min, size| {
                // Refine cells straddling the surface
                let closest = center.clamp(min, min + size);
                let near = (closest - center).length();
                let far = (center - (min + size * 0.5)).length() + size * 0.87;
                near <= radius && far >= radius
            },
            |p, _, out| {
                let d = p - center;
                if d.length() < radius {
                    out[0] = density;
                    // Color varies with position so views are distinguishable
                    let c = d / radius * 0.5 + 0.5;
                    out[1..4].copy_from_slice(&[c.x, c.y, c.z]);
                } else {
                    out.fill(0.0);
                }
            },
        )
}
