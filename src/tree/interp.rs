//! Cell-centred trilinear interpolation inside a tile
//!
//! Cell `i` of a tile with side `n` has its center at `(i + 0.5) / n`. A point
//! blends the 8 cell centers around it; outside the outermost centers the
//! indices clamp to the tile edge rather than wrapping, so the value is held
//! constant there. A point exactly at a cell center reproduces that cell.

use crate::core::{UVec3, Vec3};
use super::accumulator::AtomicAccumulator;
use super::grid::{GridRef, GridShape};

/// The 8 cells and weights contributing to one interpolated sample
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stencil {
    /// Flat cell indices, corner `c` uses offsets `(c >> 2 & 1, c >> 1 & 1, c & 1)`
    pub cells: [usize; 8],
    pub weights: [f32; 8],
}

/// Lower index, upper index and blend fraction along one axis
#[inline]
fn axis(g: f32, n: usize) -> (u32, u32, f32) {
    let last = (n - 1) as f32;
    let u = (g * n as f32 - 0.5).max(0.0).min(last);
    let i0 = (u.floor() as usize).min(n.saturating_sub(2));
    let i1 = (i0 + 1).min(n - 1);
    (i0 as u32, i1 as u32, u - i0 as f32)
}

impl Stencil {
    /// Stencil for tile-local coordinate `local` (in `[0, 1]^3`) of `tile`
    pub fn new(shape: &GridShape, tile: usize, local: Vec3) -> Self {
        let (x0, x1, fx) = axis(local.x, shape.n);
        let (y0, y1, fy) = axis(local.y, shape.n);
        let (z0, z1, fz) = axis(local.z, shape.n);

        let mut cells = [0usize; 8];
        let mut weights = [0.0f32; 8];
        for c in 0..8 {
            let (hx, hy, hz) = ((c >> 2) & 1 == 1, (c >> 1) & 1 == 1, c & 1 == 1);
            let cell = UVec3::new(
                if hx { x1 } else { x0 },
                if hy { y1 } else { y0 },
                if hz { z1 } else { z0 },
            );
            cells[c] = shape.cell_index(tile, cell);
            weights[c] = (if hx { fx } else { 1.0 - fx })
                * (if hy { fy } else { 1.0 - fy })
                * (if hz { fz } else { 1.0 - fz });
        }
        Self { cells, weights }
    }

    /// Write the blended feature vector into `out` (length = channels)
    #[inline]
    pub fn sample(&self, grid: &GridRef<'_>, out: &mut [f32]) {
        out.fill(0.0);
        for (&cell, &w) in self.cells.iter().zip(&self.weights) {
            if w == 0.0 {
                continue;
            }
            for (o, &v) in out.iter_mut().zip(grid.features(cell)) {
                *o += w * v;
            }
        }
    }

    /// Adjoint of [`sample`](Self::sample): add `w * grad` into each corner
    #[inline]
    pub fn scatter(&self, channels: usize, grad: &[f32], acc: &AtomicAccumulator) {
        for (&cell, &w) in self.cells.iter().zip(&self.weights) {
            acc.add_scaled(cell * channels, grad, w);
        }
    }

    pub fn weight_sum(&self) -> f32 {
        self.weights.iter().sum()
    }
}
