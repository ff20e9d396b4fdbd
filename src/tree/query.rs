//! Batched vertical queries: forward, gradient and scatter assignment
//!
//! Every operation maps its points through the [`Transform`], descends to the
//! leaf tile with [`descend`], and then either blends, scatters or overwrites.
//! One rayon task per point.

use rayon::prelude::*;

use crate::core::error::ensure;
use crate::core::{Result, Vec3};
use super::accumulator::AtomicAccumulator;
use super::grid::{GridMut, GridRef, Topology};
use super::interp::Stencil;
use super::transform::Transform;
use super::traversal::{descend, LeafHit};

/// Resolve a world point to its leaf and interpolation stencil
#[inline]
pub fn locate(topology: &Topology<'_>, transform: &Transform, point: Vec3) -> (LeafHit, Stencil) {
    let hit = descend(topology, transform.map(point));
    let stencil = Stencil::new(&topology.shape(), hit.tile, hit.local);
    (hit, stencil)
}

/// Interpolated feature vectors at `points`, returned row-major `Q×K`
pub fn query(grid: &GridRef<'_>, transform: &Transform, points: &[Vec3]) -> Vec<f32> {
    let k = grid.shape().channels;
    log::trace!("query: {} points, shape {:?}", points.len(), grid.shape().data_dims());
    let mut out = vec![0.0f32; points.len() * k];
    if k == 0 {
        return out;
    }

    let topology = grid.topology();
    out.par_chunks_mut(k)
        .zip(points.par_iter())
        .for_each(|(row, &p)| {
            let (_, stencil) = locate(&topology, transform, p);
            stencil.sample(grid, row);
        });
    out
}

/// Gradient of [`query`] with respect to `data`.
///
/// `grad_output` is `Q×K`. Returns a fresh `M×N×N×N×K` buffer that is zero
/// wherever no query touched.
pub fn query_backward(
    topology: &Topology<'_>,
    transform: &Transform,
    points: &[Vec3],
    grad_output: &[f32],
) -> Result<Vec<f32>> {
    let acc = AtomicAccumulator::zeros(topology.shape().data_len());
    query_backward_into(topology, transform, points, grad_output, &acc)?;
    Ok(acc.into_vec())
}

/// Like [`query_backward`] but adds into an existing accumulator
pub fn query_backward_into(
    topology: &Topology<'_>,
    transform: &Transform,
    points: &[Vec3],
    grad_output: &[f32],
    acc: &AtomicAccumulator,
) -> Result<()> {
    let shape = topology.shape();
    let k = shape.channels;
    ensure!(
        grad_output.len() == points.len() * k,
        "grad_output has {} elements, expected {} x {}",
        grad_output.len(), points.len(), k
    );
    ensure!(
        acc.len() == shape.data_len(),
        "gradient buffer has {} elements, expected {}",
        acc.len(), shape.data_len()
    );
    log::trace!("query_backward: {} points", points.len());
    if k == 0 {
        return Ok(());
    }

    grad_output
        .par_chunks(k)
        .zip(points.par_iter())
        .for_each(|(grad, &p)| {
            let (_, stencil) = locate(topology, transform, p);
            stencil.scatter(k, grad, acc);
        });
    Ok(())
}

/// Flat cell index of the leaf containing each point, in batch order
pub fn assign_targets(topology: &Topology<'_>, transform: &Transform, points: &[Vec3]) -> Vec<usize> {
    points
        .par_iter()
        .map(|&p| descend(topology, transform.map(p)).cell_index)
        .collect()
}

/// Overwrite the leaf cell containing each point with the matching row of
/// `values` (`Q×K`). No interpolation.
///
/// Targets are resolved in parallel and written in batch order, so when two
/// points land in the same cell the later one wins.
pub fn assign(
    grid: &mut GridMut<'_>,
    transform: &Transform,
    points: &[Vec3],
    values: &[f32],
) -> Result<()> {
    let k = grid.shape().channels;
    ensure!(
        values.len() == points.len() * k,
        "values has {} elements, expected {} x {}",
        values.len(), points.len(), k
    );
    log::trace!("assign: {} points", points.len());

    let targets = assign_targets(&grid.topology(), transform, points);

    if k == 0 {
        return Ok(());
    }
    for (&cell, row) in targets.iter().zip(values.chunks_exact(k)) {
        grid.features_mut(cell).copy_from_slice(row);
    }
    Ok(())
}
