//! Differentiable front-to-back volume rendering through an N³-tree
//!
//! Per ray, in grid space:
//!
//! ```text
//! T = 1, C = 0
//! for t = t_near + (i + 0.5) * step  while t < t_far:
//!     f     = trilinear(features at ray(t))
//!     alpha = 1 - exp(-max(f[0], 0) * step)
//!     C    += T * alpha * color(f[1..], vdir)
//!     T    *= 1 - alpha
//!     stop if T < stop_thresh
//! C += T * background
//! ```
//!
//! The backward pass re-marches each ray and scatters the analytic adjoint of
//! the compositing recurrence through the same trilinear stencils.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::error::ensure;
use crate::core::{Result, Vec3};
use crate::math::{Aabb, Ray};
use crate::tree::accumulator::AtomicAccumulator;
use crate::tree::grid::GridRef;
use crate::tree::interp::Stencil;
use crate::tree::n3tree::N3Tree;
use crate::tree::transform::Transform;
use crate::tree::traversal::descend;
use super::sh::{self, MAX_BASIS_DIM};

/// Minimum channel count: one density plus three color channels
pub const MIN_RENDER_CHANNELS: usize = 4;

/// Upper bound on samples along one ray. Sample indices stay exactly
/// representable as `f32`.
pub const MAX_SAMPLES_PER_RAY: u32 = 1 << 24;

/// Longest chord through the unit cube
const ROOT_DIAGONAL: f32 = 1.732_050_8;

/// How channels after the density channel encode color
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `Rgb` when there are exactly 3 color channels, spherical harmonics when
    /// the color channels split into 3 complete bases, `Rgb` otherwise
    #[default]
    Auto,
    /// Channels 1..4 are linear RGB; further channels are ignored
    Rgb,
    /// `3 × basis_dim` SH coefficients, laid out `[r_0..r_B, g_0..g_B, b_0..b_B]`
    Sh { basis_dim: usize },
}

/// Color decoding resolved against a concrete channel count
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColorBasis {
    Rgb,
    Sh(usize),
}

impl DataFormat {
    fn resolve(self, channels: usize) -> Result<ColorBasis> {
        ensure!(
            channels >= MIN_RENDER_CHANNELS,
            "volume rendering needs at least {} channels, got {}",
            MIN_RENDER_CHANNELS, channels
        );
        let color = channels - 1;
        match self {
            DataFormat::Rgb => Ok(ColorBasis::Rgb),
            DataFormat::Auto => {
                if color != 3 && color % 3 == 0 && sh::is_valid_basis_dim(color / 3) {
                    Ok(ColorBasis::Sh(color / 3))
                } else {
                    Ok(ColorBasis::Rgb)
                }
            }
            DataFormat::Sh { basis_dim } => {
                ensure!(
                    sh::is_valid_basis_dim(basis_dim),
                    "SH basis size must be 1, 4, 9, 16 or 25, got {}",
                    basis_dim
                );
                ensure!(
                    color >= 3 * basis_dim,
                    "SH basis {} needs {} channels, got {}",
                    basis_dim, 1 + 3 * basis_dim, channels
                );
                Ok(ColorBasis::Sh(basis_dim))
            }
        }
    }
}

/// Ray-marching parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Distance between samples, in grid units (the root spans 1.0)
    pub step_size: f32,
    /// Stop marching once transmittance drops below this; 0 disables
    pub stop_thresh: f32,
    /// Gray level composited behind the volume
    pub background_brightness: f32,
    pub data_format: DataFormat,
    /// Emit a fourth opacity channel `1 - T`
    pub output_alpha: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            step_size: 1e-3,
            stop_thresh: 1e-4,
            background_brightness: 1.0,
            data_format: DataFormat::Auto,
            output_alpha: false,
        }
    }
}

impl RenderOptions {
    /// Output channels per ray
    pub fn output_channels(&self) -> usize {
        if self.output_alpha { 4 } else { 3 }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.step_size.is_finite() && self.step_size > 0.0,
            "step_size must be positive and finite, got {}",
            self.step_size
        );
        ensure!(
            ROOT_DIAGONAL / self.step_size <= MAX_SAMPLES_PER_RAY as f32,
            "step_size {} is too small: a ray could need more than {} samples",
            self.step_size, MAX_SAMPLES_PER_RAY
        );
        ensure!(
            self.stop_thresh >= 0.0 && self.stop_thresh <= 1.0,
            "stop_thresh must be in [0, 1], got {}",
            self.stop_thresh
        );
        ensure!(
            self.background_brightness.is_finite(),
            "background_brightness must be finite"
        );
        if self.stop_thresh >= 1.0 {
            log::warn!(
                "stop_thresh {} ends every ray at its first non-empty sample",
                self.stop_thresh
            );
        }
        Ok(())
    }
}

/// Borrowed batch of world-space rays
#[derive(Clone, Copy, Debug)]
pub struct RayBatch<'a> {
    pub origins: &'a [Vec3],
    pub dirs: &'a [Vec3],
    /// View directions used for color decoding
    pub vdirs: &'a [Vec3],
}

impl<'a> RayBatch<'a> {
    pub fn new(origins: &'a [Vec3], dirs: &'a [Vec3], vdirs: &'a [Vec3]) -> Result<Self> {
        ensure!(
            origins.len() == dirs.len() && dirs.len() == vdirs.len(),
            "ray batch lengths differ: origins {}, dirs {}, vdirs {}",
            origins.len(), dirs.len(), vdirs.len()
        );
        Ok(Self { origins, dirs, vdirs })
    }

    /// Rays viewed along their own direction
    pub fn primary(origins: &'a [Vec3], dirs: &'a [Vec3]) -> Result<Self> {
        Self::new(origins, dirs, dirs)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// One accepted sample, as seen by a march visitor
struct Sample<'s> {
    stencil: &'s Stencil,
    /// Raw density channel before clamping
    sigma: f32,
    alpha: f32,
    /// Transmittance before and after this sample
    t_before: f32,
    t_after: f32,
    rgb: Vec3,
    basis: &'s [f32; MAX_BASIS_DIM],
}

/// Final state of one ray
#[derive(Clone, Copy, Debug, PartialEq)]
struct RayResult {
    /// Composited color including background
    color: Vec3,
    /// Transmittance left when marching stopped
    transmittance: f32,
}

/// Renderer bound to one grid and its options
struct Marcher<'g> {
    grid: GridRef<'g>,
    transform: Transform,
    basis: ColorBasis,
    opts: RenderOptions,
}

impl Marcher<'_> {
    fn decode(&self, features: &[f32], basis: &[f32; MAX_BASIS_DIM]) -> Vec3 {
        match self.basis {
            ColorBasis::Rgb => Vec3::new(features[1], features[2], features[3]),
            ColorBasis::Sh(b) => {
                let channel = |c: usize| -> f32 {
                    let coeffs = &features[1 + c * b..1 + (c + 1) * b];
                    coeffs.iter().zip(basis).map(|(k, y)| k * y).sum()
                };
                Vec3::new(channel(0), channel(1), channel(2))
            }
        }
    }

    /// Unit grid-space direction, or `None` when `dir` is zero or non-finite
    fn grid_direction(&self, dir: Vec3) -> Option<Vec3> {
        let dir_g = self.transform.map_direction(dir);
        let len = dir_g.length();
        (len.is_finite() && len > 0.0).then(|| dir_g / len)
    }

    /// Rays that march as misses because their direction is unusable
    fn count_degenerate(&self, rays: &RayBatch<'_>) -> usize {
        rays.dirs
            .par_iter()
            .filter(|&&dir| self.grid_direction(dir).is_none())
            .count()
    }

    fn warn_degenerate(&self, pass: &str, rays: &RayBatch<'_>) {
        let degenerate = self.count_degenerate(rays);
        if degenerate > 0 {
            log::warn!(
                "{}: {} of {} rays have a zero or non-finite direction and see only the background",
                pass, degenerate, rays.len()
            );
        }
    }

    /// March one ray, calling `visit` for every sample that contributes
    fn march<F>(&self, origin: Vec3, dir: Vec3, vdir: Vec3, mut visit: F) -> RayResult
    where
        F: FnMut(&Sample<'_>),
    {
        let background = Vec3::splat(self.opts.background_brightness);
        let miss = RayResult { color: background, transmittance: 1.0 };

        let Some(dir_g) = self.grid_direction(dir) else {
            return miss;
        };
        let ray = Ray::new(self.transform.map(origin), dir_g);
        let Some((t_near, t_far)) = ray.intersects_aabb(&Aabb::UNIT) else {
            return miss;
        };

        let view = match vdir.normalize_or_zero() {
            v if v == Vec3::ZERO => ray.direction,
            v => v,
        };
        let basis = match self.basis {
            ColorBasis::Rgb => [0.0; MAX_BASIS_DIM],
            ColorBasis::Sh(b) => sh::eval_basis(b, view),
        };

        let step = self.opts.step_size;
        let topology = self.grid.topology();
        let shape = self.grid.shape();
        let mut features = vec![0.0f32; shape.channels];
        let mut color = Vec3::ZERO;
        let mut transmittance = 1.0f32;

        let samples = ((t_far - t_near) / step).ceil().min(MAX_SAMPLES_PER_RAY as f32) as u32;
        for i in 0..samples {
            let t = t_near + (i as f32 + 0.5) * step;
            if t >= t_far {
                break;
            }

            let hit = descend(&topology, ray.at(t));
            let stencil = Stencil::new(&shape, hit.tile, hit.local);
            stencil.sample(&self.grid, &mut features);

            let sigma = features[0];
            let alpha = -(-sigma.max(0.0) * step).exp_m1();
            if alpha <= 0.0 {
                continue;
            }
            let rgb = self.decode(&features, &basis);
            let t_after = transmittance * (1.0 - alpha);
            visit(&Sample {
                stencil: &stencil,
                sigma,
                alpha,
                t_before: transmittance,
                t_after,
                rgb,
                basis: &basis,
            });
            color += transmittance * alpha * rgb;
            transmittance = t_after;
            if transmittance < self.opts.stop_thresh {
                break;
            }
        }

        RayResult {
            color: color + transmittance * background,
            transmittance,
        }
    }

    fn new(grid: GridRef<'_>, transform: Transform, opts: RenderOptions) -> Result<Marcher<'_>> {
        opts.validate()?;
        let basis = opts.data_format.resolve(grid.shape().channels)?;
        Ok(Marcher { grid, transform, basis, opts })
    }
}

/// Render a batch of rays. Returns `Q×3`, or `Q×4` with opacity when
/// `opts.output_alpha` is set.
pub fn volume_render(
    grid: &GridRef<'_>,
    transform: &Transform,
    rays: &RayBatch<'_>,
    opts: &RenderOptions,
) -> Result<Vec<f32>> {
    let marcher = Marcher::new(*grid, *transform, *opts)?;
    let channels = opts.output_channels();
    log::debug!(
        "volume_render: {} rays, step {}, basis {:?}",
        rays.len(), opts.step_size, marcher.basis
    );
    marcher.warn_degenerate("volume_render", rays);

    let mut out = vec![0.0f32; rays.len() * channels];
    out.par_chunks_mut(channels)
        .enumerate()
        .for_each(|(r, px)| {
            let result = marcher.march(rays.origins[r], rays.dirs[r], rays.vdirs[r], |_| {});
            px[..3].copy_from_slice(&result.color.to_array());
            if channels == 4 {
                px[3] = 1.0 - result.transmittance;
            }
        });
    Ok(out)
}

/// Gradient of [`volume_render`] with respect to `data`.
///
/// `grad_output` matches the forward output layout. Samples with a negative
/// density channel receive no density gradient, matching the clamp.
pub fn volume_render_backward(
    grid: &GridRef<'_>,
    transform: &Transform,
    rays: &RayBatch<'_>,
    opts: &RenderOptions,
    grad_output: &[f32],
) -> Result<Vec<f32>> {
    let marcher = Marcher::new(*grid, *transform, *opts)?;
    let channels = opts.output_channels();
    ensure!(
        grad_output.len() == rays.len() * channels,
        "grad_output has {} elements, expected {} x {}",
        grad_output.len(), rays.len(), channels
    );
    let k = grid.shape().channels;
    let step = opts.step_size;
    log::debug!("volume_render_backward: {} rays", rays.len());
    marcher.warn_degenerate("volume_render_backward", rays);

    let acc = AtomicAccumulator::zeros(grid.shape().data_len());
    grad_output
        .par_chunks(channels)
        .enumerate()
        .for_each(|(r, g)| {
            let (origin, dir, vdir) = (rays.origins[r], rays.dirs[r], rays.vdirs[r]);
            let g_rgb = Vec3::new(g[0], g[1], g[2]);
            let g_alpha = if channels == 4 { g[3] } else { 0.0 };
            if g_rgb == Vec3::ZERO && g_alpha == 0.0 {
                return;
            }

            let total = marcher.march(origin, dir, vdir, |_| {});
            let mut accumulated = Vec3::ZERO;
            let mut grad_features = vec![0.0f32; k];

            marcher.march(origin, dir, vdir, |s| {
                let weight = s.t_before * s.alpha;
                accumulated += weight * s.rgb;
                // Color contributed behind this sample, background included
                let behind = total.color - accumulated;

                grad_features.fill(0.0);
                if s.sigma > 0.0 {
                    grad_features[0] = step
                        * (g_rgb.dot(s.t_after * s.rgb - behind) + g_alpha * total.transmittance);
                }
                match marcher.basis {
                    ColorBasis::Rgb => {
                        for c in 0..3 {
                            grad_features[1 + c] = g_rgb[c] * weight;
                        }
                    }
                    ColorBasis::Sh(b) => {
                        for c in 0..3 {
                            let gc = g_rgb[c] * weight;
                            for j in 0..b {
                                grad_features[1 + c * b + j] = gc * s.basis[j];
                            }
                        }
                    }
                }
                s.stencil.scatter(k, &grad_features, &acc);
            });
        });
    Ok(acc.into_vec())
}

impl N3Tree {
    /// Render world-space rays through this tree
    pub fn render(&self, rays: &RayBatch<'_>, opts: &RenderOptions) -> Result<Vec<f32>> {
        volume_render(&self.view(), self.transform(), rays, opts)
    }

    /// Gradient of [`render`](Self::render) with respect to the feature data
    pub fn render_backward(
        &self,
        rays: &RayBatch<'_>,
        opts: &RenderOptions,
        grad_output: &[f32],
    ) -> Result<Vec<f32>> {
        volume_render_backward(&self.view(), self.transform(), rays, opts, grad_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Error, UVec3};
    use crate::tree::grid::GridShape;

    /// Single tile with every cell set to `features`
    fn uniform(n: usize, features: &[f32]) -> N3Tree {
        let mut tree = N3Tree::new(n, features.len(), Transform::default()).unwrap();
        for cell in tree.data_mut().chunks_exact_mut(features.len()) {
            cell.copy_from_slice(features);
        }
        tree
    }

    fn x_ray() -> (Vec<Vec3>, Vec<Vec3>) {
        (vec![Vec3::new(-1.0, 0.5, 0.5)], vec![Vec3::X])
    }

    fn opts(step: f32, stop: f32, bg: f32, alpha: bool) -> RenderOptions {
        RenderOptions {
            step_size: step,
            stop_thresh: stop,
            background_brightness: bg,
            data_format: DataFormat::Auto,
            output_alpha: alpha,
        }
    }

    #[test]
    fn test_rejects_too_few_channels() {
        let tree = uniform(2, &[1.0, 0.0, 0.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let err = tree.render(&rays, &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_rejects_bad_options() {
        let tree = uniform(2, &[1.0, 0.0, 0.0, 0.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        assert!(tree.render(&rays, &opts(0.0, 0.0, 1.0, false)).is_err());
        assert!(tree.render(&rays, &opts(0.1, -1.0, 1.0, false)).is_err());
        let sh = RenderOptions { data_format: DataFormat::Sh { basis_dim: 4 }, ..Default::default() };
        assert!(tree.render(&rays, &sh).is_err());
    }

    #[test]
    fn test_step_below_sample_cap_rejected() {
        let tree = uniform(2, &[1.0, 0.0, 0.0, 0.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        match tree.render(&rays, &opts(1e-10, 0.0, 1.0, false)) {
            Err(Error::Precondition(msg)) => assert!(msg.contains("too small"), "{msg}"),
            other => panic!("expected precondition error, got {other:?}"),
        }
        let grad = [1.0; 3];
        assert!(tree.render_backward(&rays, &opts(1e-10, 0.0, 1.0, false), &grad).is_err());
    }

    #[test]
    fn test_small_step_terminates() {
        // About a million samples across the root, all empty
        let tree = uniform(2, &[0.0, 1.0, 1.0, 1.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let out = tree.render(&rays, &opts(1e-6, 0.0, 0.25, true)).unwrap();
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.0]);
    }

    #[test]
    fn test_degenerate_directions_see_background() {
        crate::core::logging::try_init();
        let tree = uniform(2, &[5.0, 1.0, 0.0, 0.0]);
        let o = [Vec3::new(-1.0, 0.5, 0.5); 3];
        let d = [Vec3::ZERO, Vec3::new(f32::NAN, 0.0, 0.0), Vec3::X];
        let rays = RayBatch::primary(&o, &d).unwrap();
        let render_opts = opts(0.1, 0.0, 0.5, true);
        let marcher = Marcher::new(tree.view(), *tree.transform(), render_opts).unwrap();
        assert_eq!(marcher.count_degenerate(&rays), 2);

        let out = tree.render(&rays, &render_opts).unwrap();
        assert_eq!(&out[..8], &[0.5, 0.5, 0.5, 0.0, 0.5, 0.5, 0.5, 0.0]);
        assert!(out[11] > 0.9);

        let grad = tree.render_backward(&rays, &render_opts, &[1.0; 12]).unwrap();
        assert_eq!(grad.len(), tree.data().len());
    }

    #[test]
    fn test_ray_batch_lengths() {
        let o = [Vec3::ZERO; 2];
        let d = [Vec3::X; 1];
        assert!(RayBatch::primary(&o, &d).is_err());
    }

    #[test]
    fn test_miss_returns_background() {
        let tree = uniform(2, &[5.0, 1.0, 1.0, 1.0]);
        let o = [Vec3::new(-1.0, 3.0, 0.5)];
        let d = [Vec3::X];
        let rays = RayBatch::primary(&o, &d).unwrap();
        let out = tree.render(&rays, &opts(0.1, 0.0, 0.7, true)).unwrap();
        assert_eq!(out, vec![0.7, 0.7, 0.7, 0.0]);
    }

    #[test]
    fn test_uniform_density_matches_closed_form() {
        let sigma = 2.0;
        let tree = uniform(2, &[sigma, 0.2, 0.4, 0.6]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let out = tree.render(&rays, &opts(0.25, 0.0, 0.0, true)).unwrap();
        let opacity = 1.0 - (-sigma * 1.0f32).exp();
        assert!((out[3] - opacity).abs() < 1e-5);
        // Constant color: C = c * opacity on a black background
        assert!((out[0] - 0.2 * opacity).abs() < 1e-5);
        assert!((out[2] - 0.6 * opacity).abs() < 1e-5);
    }

    #[test]
    fn test_background_blend() {
        let sigma = 1.0;
        let tree = uniform(1, &[sigma, 0.0, 0.0, 0.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let out = tree.render(&rays, &opts(0.1, 0.0, 1.0, false)).unwrap();
        let remaining = (-sigma).exp();
        assert_eq!(out.len(), 3);
        assert!((out[1] - remaining).abs() < 1e-4);
    }

    #[test]
    fn test_linear_ramp_converges_to_integral() {
        // Density 1 in x-cells 0, 3 in x-cells 1. Along y = z = 0.5 the
        // interpolated density integrates to (d0 + d1) / 2 over the unit cube.
        let shape = GridShape::new(1, 2, 4);
        let mut data = vec![0.0; shape.data_len()];
        for x in 0..2u32 {
            for y in 0..2u32 {
                for z in 0..2u32 {
                    let c = shape.cell_index(0, UVec3::new(x, y, z));
                    data[c * 4] = if x == 0 { 1.0 } else { 3.0 };
                }
            }
        }
        let tree = N3Tree::from_parts(shape, data, vec![0; 8], Transform::default()).unwrap();
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let expected = 1.0 - (-2.0f32).exp();

        for (step, tolerance) in [(0.1, 5e-3), (0.01, 1e-3), (0.001, 1e-3)] {
            let out = tree.render(&rays, &opts(step, 0.0, 0.0, true)).unwrap();
            let err = (out[3] - expected).abs();
            assert!(err < tolerance, "step {step}: error {err}");
        }
    }

    #[test]
    fn test_two_level_occupied_cell() {
        // Root N = 2, the cell (0, 0, 0) is refined; only the child tile has density
        let mut tree = N3Tree::new(2, 4, Transform::default()).unwrap();
        let child = tree.refine(0, UVec3::ZERO).unwrap();
        let per_tile = tree.shape().cells_per_tile();
        for v in tree.data_mut()[child * per_tile * 4..].chunks_exact_mut(4) {
            v[0] = 1.0;
        }

        // Along x at y = z = 0.25, starting inside the occupied half-cube so
        // exactly `steps_inside` samples land in it before it ends at x = 0.5
        let step = 0.05f32;
        let d = [Vec3::X];
        let mut last = 0.0;
        for steps_inside in [1u32, 2, 4, 8] {
            let o = [Vec3::new(0.5 - steps_inside as f32 * step, 0.25, 0.25)];
            let rays = RayBatch::primary(&o, &d).unwrap();
            let out = tree.render(&rays, &opts(step, 0.0, 0.0, true)).unwrap();
            let expected = 1.0 - (-step * steps_inside as f32).exp();
            assert!((out[3] - expected).abs() < 1e-5, "{} vs {}", out[3], expected);
            assert!(out[3] > last);
            last = out[3];
        }
    }

    #[test]
    fn test_early_termination_is_idempotent() {
        // Dense red slab first, then green: once T < thresh green never shows
        let shape = GridShape::new(1, 2, 4);
        let mut data = vec![0.0; shape.data_len()];
        for c in 0..8 {
            let (_, cell) = shape.cell_coords(c);
            let v = if cell.x == 0 { [50.0, 1.0, 0.0, 0.0] } else { [50.0, 0.0, 1.0, 0.0] };
            data[c * 4..c * 4 + 4].copy_from_slice(&v);
        }
        let tree = N3Tree::from_parts(shape, data, vec![0; 8], Transform::default()).unwrap();
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();

        let out = tree.render(&rays, &opts(0.05, 0.01, 0.0, true)).unwrap();
        assert_eq!(out[1], 0.0, "samples past the threshold leaked in");

        // Changing everything after the termination point changes nothing
        let mut altered = tree.clone();
        for c in 0..8 {
            let (_, cell) = shape.cell_coords(c);
            if cell.x == 1 {
                altered.data_mut()[c * 4 + 3] = 9.0;
            }
        }
        assert_eq!(altered.render(&rays, &opts(0.05, 0.01, 0.0, true)).unwrap(), out);
    }

    #[test]
    fn test_negative_density_is_transparent() {
        let tree = uniform(2, &[-4.0, 1.0, 1.0, 1.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let out = tree.render(&rays, &opts(0.1, 0.0, 0.25, true)).unwrap();
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.0]);
    }

    #[test]
    fn test_transform_and_direction_scale() {
        // World cube [10, 14)^3; density 1 per grid unit
        let mut tree = uniform(2, &[1.0, 0.0, 0.0, 0.0]);
        tree.set_transform(Transform::from_bounds(Vec3::splat(12.0), Vec3::splat(2.0)));
        let o = [Vec3::new(0.0, 12.0, 12.0)];
        let d = [Vec3::new(3.0, 0.0, 0.0)];
        let rays = RayBatch::primary(&o, &d).unwrap();
        let out = tree.render(&rays, &opts(0.01, 0.0, 0.0, true)).unwrap();
        assert!((out[3] - (1.0 - (-1.0f32).exp())).abs() < 1e-4);
    }

    #[test]
    fn test_sh_degree_zero_matches_rgb_scaled() {
        let sigma = 3.0;
        let sh_tree = uniform(2, &[sigma, 1.0, 2.0, 3.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        let sh_opts = RenderOptions {
            data_format: DataFormat::Sh { basis_dim: 1 },
            ..opts(0.1, 0.0, 0.0, false)
        };
        let rgb = sh_tree.render(&rays, &opts(0.1, 0.0, 0.0, false)).unwrap();
        let sh = sh_tree.render(&rays, &sh_opts).unwrap();
        for c in 0..3 {
            assert!((sh[c] - rgb[c] * 0.282_094_79).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sh_view_dependence() {
        // Degree 1: Y_3 = -C1 * x, so red depends on the view's x component
        let mut features = vec![0.0; 1 + 3 * 4];
        features[0] = 10.0;
        features[1 + 3] = 1.0;
        let tree = uniform(2, &features);
        let o = [Vec3::new(0.5, 0.5, 0.5); 2];
        let d = [Vec3::Z; 2];
        let v = [Vec3::X, -Vec3::X];
        let rays = RayBatch::new(&o, &d, &v).unwrap();
        let out = tree.render(&rays, &opts(0.01, 0.0, 0.0, false)).unwrap();
        assert!(out[0] < 0.0 && out[3] > 0.0);
        assert!((out[0] + out[3]).abs() < 1e-5);
    }

    fn finite_difference_check(tree: &N3Tree, rays: &RayBatch<'_>, o: &RenderOptions, grad_out: &[f32]) {
        let grad = tree.render_backward(rays, o, grad_out).unwrap();
        let loss = |t: &N3Tree| -> f64 {
            let out = t.render(rays, o).unwrap();
            out.iter().zip(grad_out).map(|(a, b)| (*a as f64) * (*b as f64)).sum()
        };
        let eps = 1e-2f32;
        for i in 0..tree.data().len() {
            let mut plus = tree.clone();
            plus.data_mut()[i] += eps;
            let mut minus = tree.clone();
            minus.data_mut()[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps as f64);
            let analytic = grad[i] as f64;
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "element {i}: numeric {numeric} analytic {analytic}"
            );
        }
    }

    fn bumpy_tree(channels: usize) -> N3Tree {
        let mut tree = N3Tree::new(2, channels, Transform::default()).unwrap();
        for (i, v) in tree.data_mut().iter_mut().enumerate() {
            *v = 0.5 + 0.37 * ((i * 7919 % 13) as f32 / 13.0);
        }
        tree
    }

    #[test]
    fn test_backward_matches_finite_differences_rgb() {
        let tree = bumpy_tree(4);
        let o = [Vec3::new(-1.0, 0.3, 0.6), Vec3::new(0.2, -1.0, 0.7)];
        let d = [Vec3::new(1.0, 0.1, -0.05).normalize(), Vec3::new(0.1, 1.0, 0.2).normalize()];
        let rays = RayBatch::primary(&o, &d).unwrap();
        let o = opts(0.05, 0.0, 0.8, true);
        finite_difference_check(&tree, &rays, &o, &[0.3, -0.7, 1.1, 0.5, 1.0, 0.2, -0.4, -0.9]);
    }

    #[test]
    fn test_backward_matches_finite_differences_sh() {
        let tree = bumpy_tree(1 + 3 * 4);
        let o = [Vec3::new(-1.0, 0.4, 0.45)];
        let d = [Vec3::new(1.0, 0.2, 0.1).normalize()];
        let v = [Vec3::new(0.3, -0.5, 0.8)];
        let rays = RayBatch::new(&o, &d, &v).unwrap();
        let o = opts(0.05, 0.0, 0.5, false);
        finite_difference_check(&tree, &rays, &o, &[1.0, -0.5, 0.25]);
    }

    #[test]
    fn test_backward_rejects_bad_grad_len() {
        let tree = uniform(2, &[1.0, 0.0, 0.0, 0.0]);
        let (o, d) = x_ray();
        let rays = RayBatch::primary(&o, &d).unwrap();
        assert!(tree.render_backward(&rays, &opts(0.1, 0.0, 0.0, true), &[1.0; 3]).is_err());
    }
}
