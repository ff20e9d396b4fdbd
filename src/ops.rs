//! Array-level entry points
//!
//! Buffers arrive the way an array runtime describes them: element type,
//! shape, strides and device. Every check runs before any computation, so a
//! rejected call leaves its outputs untouched. `f64` inputs are narrowed to
//! `f32` and `i64` child pointers to `i32`.

use std::borrow::Cow;
use std::fmt;

use crate::core::error::ensure;
use crate::core::{Error, Result, Vec3};
use crate::render::{self, MIN_RENDER_CHANNELS, RayBatch, RenderOptions};
use crate::tree::{self, GridRef, GridShape, Topology, Transform};

/// Where a buffer lives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator ordinal. Such arrays can be described but not computed on.
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}

/// Element type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_integral(self) -> bool {
        !self.is_floating_point()
    }
}

/// Shape, element strides and device of an array
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub device: Device,
}

impl Layout {
    /// Row-major layout on the CPU. Shapes whose size overflows get empty
    /// strides and are rejected by every entry point.
    pub fn contiguous(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: row_major(shape).map(|(strides, _)| strides).unwrap_or_default(),
            device: Device::Cpu,
        }
    }

    /// Element count, or `None` when the shape's size overflows `usize`
    pub fn numel(&self) -> Option<usize> {
        row_major(&self.shape).map(|(_, count)| count)
    }

    /// Row-major with no gaps. Strides of size-1 dimensions are ignored.
    pub fn is_contiguous(&self) -> bool {
        let Some((expected, _)) = row_major(&self.shape) else { return false };
        self.strides.len() == self.shape.len()
            && expected
                .iter()
                .zip(&self.strides)
                .zip(&self.shape)
                .all(|((expected, actual), &size)| size == 1 || expected == actual)
    }
}

/// Row-major strides and element count. Every suffix product is checked,
/// so a zero-sized leading dimension cannot hide an overflowing stride.
fn row_major(shape: &[usize]) -> Option<(Vec<usize>, usize)> {
    let mut strides = vec![1; shape.len()];
    let mut count = 1usize;
    for d in (0..shape.len()).rev() {
        strides[d] = count;
        count = count.checked_mul(shape[d])?;
    }
    Some((strides, count))
}

/// Borrowed elements of an [`ArrayRef`]
#[derive(Clone, Copy, Debug)]
pub enum ArrayData<'a> {
    F32(&'a [f32]),
    F64(&'a [f64]),
    I32(&'a [i32]),
    I64(&'a [i64]),
}

impl<'a> ArrayData<'a> {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::F32(_) => DType::F32,
            ArrayData::F64(_) => DType::F64,
            ArrayData::I32(_) => DType::I32,
            ArrayData::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrowed when already `f32`
    fn to_f32(self) -> Cow<'a, [f32]> {
        match self {
            ArrayData::F32(v) => Cow::Borrowed(v),
            ArrayData::F64(v) => Cow::Owned(v.iter().map(|&x| x as f32).collect()),
            ArrayData::I32(v) => Cow::Owned(v.iter().map(|&x| x as f32).collect()),
            ArrayData::I64(v) => Cow::Owned(v.iter().map(|&x| x as f32).collect()),
        }
    }

    /// Borrowed when already `i32`; fails on floats and on values that overflow
    fn to_i32(self, name: &str) -> Result<Cow<'a, [i32]>> {
        match self {
            ArrayData::I32(v) => Ok(Cow::Borrowed(v)),
            ArrayData::I64(v) => v
                .iter()
                .map(|&x| {
                    i32::try_from(x).map_err(|_| {
                        Error::precondition(format!("{} value {} does not fit in i32", name, x))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Cow::Owned),
            ArrayData::F32(_) | ArrayData::F64(_) => {
                Err(Error::precondition(format!("{} must be integral", name)))
            }
        }
    }
}

/// Mutably borrowed elements of an [`ArrayMut`]
#[derive(Debug)]
pub enum ArrayDataMut<'a> {
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
}

impl ArrayDataMut<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayDataMut::F32(_) => DType::F32,
            ArrayDataMut::F64(_) => DType::F64,
            ArrayDataMut::I32(_) => DType::I32,
            ArrayDataMut::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayDataMut::F32(v) => v.len(),
            ArrayDataMut::F64(v) => v.len(),
            ArrayDataMut::I32(v) => v.len(),
            ArrayDataMut::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Float view for writing rows; integer buffers are a precondition error
    fn as_float_mut(&mut self, name: &str) -> Result<FloatSliceMut<'_>> {
        let dtype = self.dtype();
        match self {
            ArrayDataMut::F32(v) => Ok(FloatSliceMut::F32(&mut **v)),
            ArrayDataMut::F64(v) => Ok(FloatSliceMut::F64(&mut **v)),
            ArrayDataMut::I32(_) | ArrayDataMut::I64(_) => Err(Error::precondition(format!(
                "{} must be floating point, got {:?}",
                name, dtype
            ))),
        }
    }
}

/// Writable float elements
enum FloatSliceMut<'a> {
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
}

impl FloatSliceMut<'_> {
    fn write(&mut self, start: usize, row: &[f32]) {
        let end = start + row.len();
        match self {
            FloatSliceMut::F32(v) => v[start..end].copy_from_slice(row),
            FloatSliceMut::F64(v) => {
                for (dst, &src) in v[start..end].iter_mut().zip(row) {
                    *dst = src as f64;
                }
            }
        }
    }
}

/// Read-only strided array
#[derive(Clone, Debug)]
pub struct ArrayRef<'a> {
    pub data: ArrayData<'a>,
    pub layout: Layout,
}

impl<'a> ArrayRef<'a> {
    /// Contiguous CPU array
    pub fn new(data: ArrayData<'a>, shape: &[usize]) -> Self {
        Self { data, layout: Layout::contiguous(shape) }
    }

    pub fn f32(data: &'a [f32], shape: &[usize]) -> Self {
        Self::new(ArrayData::F32(data), shape)
    }

    pub fn f64(data: &'a [f64], shape: &[usize]) -> Self {
        Self::new(ArrayData::F64(data), shape)
    }

    pub fn i32(data: &'a [i32], shape: &[usize]) -> Self {
        Self::new(ArrayData::I32(data), shape)
    }

    pub fn i64(data: &'a [i64], shape: &[usize]) -> Self {
        Self::new(ArrayData::I64(data), shape)
    }

    pub fn with_strides(mut self, strides: &[usize]) -> Self {
        self.layout.strides = strides.to_vec();
        self
    }

    pub fn on(mut self, device: Device) -> Self {
        self.layout.device = device;
        self
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.layout.shape
    }

    fn arg(&self, name: &'static str) -> Arg<'_> {
        Arg { name, dtype: self.dtype(), len: self.data.len(), layout: &self.layout }
    }
}

/// Writable strided array, used for in-place assignment
#[derive(Debug)]
pub struct ArrayMut<'a> {
    pub data: ArrayDataMut<'a>,
    pub layout: Layout,
}

impl<'a> ArrayMut<'a> {
    pub fn new(data: ArrayDataMut<'a>, shape: &[usize]) -> Self {
        Self { data, layout: Layout::contiguous(shape) }
    }

    pub fn f32(data: &'a mut [f32], shape: &[usize]) -> Self {
        Self::new(ArrayDataMut::F32(data), shape)
    }

    pub fn f64(data: &'a mut [f64], shape: &[usize]) -> Self {
        Self::new(ArrayDataMut::F64(data), shape)
    }

    pub fn with_strides(mut self, strides: &[usize]) -> Self {
        self.layout.strides = strides.to_vec();
        self
    }

    pub fn on(mut self, device: Device) -> Self {
        self.layout.device = device;
        self
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.layout.shape
    }

    fn arg(&self, name: &'static str) -> Arg<'_> {
        Arg { name, dtype: self.dtype(), len: self.data.len(), layout: &self.layout }
    }
}

/// Contiguous `f32` result
#[derive(Clone, Debug, PartialEq)]
pub struct OwnedArray {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl OwnedArray {
    pub fn view(&self) -> ArrayRef<'_> {
        ArrayRef::f32(&self.data, &self.shape)
    }
}

/// What the checks need to know about one argument
#[derive(Clone, Copy)]
struct Arg<'s> {
    name: &'static str,
    dtype: DType,
    len: usize,
    layout: &'s Layout,
}

impl Arg<'_> {
    fn shape(&self) -> &[usize] {
        &self.layout.shape
    }
}

/// Same device, CPU, contiguous, buffer length matching the shape
fn check_placement(args: &[Arg<'_>]) -> Result<()> {
    let Some(first) = args.first() else { return Ok(()) };
    let device = first.layout.device;
    for arg in args {
        ensure!(
            arg.layout.device == device,
            "{} is on device {} but {} is on device {}",
            arg.name, arg.layout.device, first.name, device
        );
    }
    ensure!(device == Device::Cpu, "arrays are on device {}, only cpu is supported", device);
    for arg in args {
        let Some(numel) = arg.layout.numel() else {
            return Err(Error::precondition(format!(
                "{} shape {:?} is too large: element count overflows",
                arg.name,
                arg.shape()
            )));
        };
        ensure!(arg.layout.is_contiguous(), "{} must be contiguous", arg.name);
        ensure!(
            arg.len == numel,
            "{} holds {} elements but shape {:?} needs {}",
            arg.name, arg.len, arg.shape(), numel
        );
    }
    Ok(())
}

/// Rank 2 with `columns` columns when given; returns the row count
fn check_rows(arg: &Arg<'_>, columns: Option<usize>) -> Result<usize> {
    let shape = arg.shape();
    ensure!(shape.len() == 2, "{} must have rank 2, got shape {:?}", arg.name, shape);
    if let Some(columns) = columns {
        ensure!(
            shape[1] == columns,
            "{} must have {} columns, got shape {:?}",
            arg.name, columns, shape
        );
    }
    Ok(shape[0])
}

fn check_same_rows(arg: &Arg<'_>, rows: usize, other: &Arg<'_>) -> Result<()> {
    ensure!(
        arg.shape()[0] == rows,
        "{} has {} rows but {} has {}",
        arg.name, arg.shape()[0], other.name, rows
    );
    Ok(())
}

fn check_floating_point(args: &[Arg<'_>]) -> Result<()> {
    for arg in args {
        ensure!(
            arg.dtype.is_floating_point(),
            "{} must be floating point, got {:?}",
            arg.name, arg.dtype
        );
    }
    Ok(())
}

fn check_integral(arg: &Arg<'_>) -> Result<()> {
    ensure!(arg.dtype.is_integral(), "{} must be integral, got {:?}", arg.name, arg.dtype);
    Ok(())
}

/// `child (M, N, N, N)` with `channels` features per cell
fn topology_shape(child: &[usize], channels: usize) -> Result<GridShape> {
    ensure!(child.len() == 4, "child must have rank 4 (M, N, N, N), got shape {:?}", child);
    ensure!(
        child[1] == child[2] && child[2] == child[3],
        "child tiles must be cubic, got shape {:?}",
        child
    );
    ensure!(child[1] > 0, "tile side length must be positive");
    Ok(GridShape::new(child[0], child[1], channels))
}

/// `data (M, N, N, N, K)` against `child (M, N, N, N)`
fn grid_shape(data: &[usize], child: &[usize]) -> Result<GridShape> {
    ensure!(data.len() == 5, "data must have rank 5 (M, N, N, N, K), got shape {:?}", data);
    let shape = topology_shape(child, data[4])?;
    ensure!(
        data[..4] == child[..],
        "data shape {:?} does not match child shape {:?}",
        data, child
    );
    Ok(shape)
}

fn transform_of(offset: &ArrayRef<'_>, invradius: &ArrayRef<'_>) -> Result<Transform> {
    Transform::from_slices(&offset.data.to_f32(), &invradius.data.to_f32())
}

fn points_of(array: &ArrayRef<'_>) -> Vec<Vec3> {
    array.data.to_f32().chunks_exact(3).map(Vec3::from_slice).collect()
}

/// Interpolated features at world points.
///
/// `data (M, N, N, N, K)`, `child (M, N, N, N)`, `indices (Q, 3)`,
/// `offset (3)`, `invradius (3 | 1)`. Returns `(Q, K)`.
pub fn query_vertical(
    data: &ArrayRef<'_>,
    child: &ArrayRef<'_>,
    indices: &ArrayRef<'_>,
    offset: &ArrayRef<'_>,
    invradius: &ArrayRef<'_>,
) -> Result<OwnedArray> {
    let (d, c, i) = (data.arg("data"), child.arg("child"), indices.arg("indices"));
    let (o, r) = (offset.arg("offset"), invradius.arg("invradius"));
    check_placement(&[d, c, i, o, r])?;
    let q = check_rows(&i, Some(3))?;
    check_floating_point(&[i, d, o, r])?;
    check_integral(&c)?;
    let shape = grid_shape(d.shape(), c.shape())?;
    let transform = transform_of(offset, invradius)?;

    let features = data.data.to_f32();
    let children = child.data.to_i32("child")?;
    let grid = GridRef::new(shape, &features, &children)?;
    log::debug!("query_vertical: {} points, shape {:?}", q, shape.data_dims());
    let out = tree::query(&grid, &transform, &points_of(indices));
    Ok(OwnedArray { data: out, shape: vec![q, shape.channels] })
}

/// Gradient of [`query_vertical`] with respect to `data`.
///
/// `grad_output (Q, K)`. Returns `(M, N, N, N, K)`.
pub fn query_vertical_backward(
    child: &ArrayRef<'_>,
    indices: &ArrayRef<'_>,
    grad_output: &ArrayRef<'_>,
    offset: &ArrayRef<'_>,
    invradius: &ArrayRef<'_>,
) -> Result<OwnedArray> {
    let (c, i, g) = (child.arg("child"), indices.arg("indices"), grad_output.arg("grad_output"));
    let (o, r) = (offset.arg("offset"), invradius.arg("invradius"));
    check_placement(&[c, i, g, o, r])?;
    let q = check_rows(&i, Some(3))?;
    check_rows(&g, None)?;
    check_same_rows(&g, q, &i)?;
    check_floating_point(&[i, g, o, r])?;
    check_integral(&c)?;
    let shape = topology_shape(c.shape(), g.shape()[1])?;
    let transform = transform_of(offset, invradius)?;

    let children = child.data.to_i32("child")?;
    let topology = Topology::new(shape, &children)?;
    log::debug!("query_vertical_backward: {} points, shape {:?}", q, shape.data_dims());
    let grad = tree::query_backward(
        &topology,
        &transform,
        &points_of(indices),
        &grad_output.data.to_f32(),
    )?;
    Ok(OwnedArray { data: grad, shape: shape.data_dims().to_vec() })
}

/// Overwrite the leaf cell containing each of `indices (Q, 3)` with the
/// matching row of `values (Q, K)`, in place. Later rows win on conflicts.
pub fn assign_vertical(
    data: &mut ArrayMut<'_>,
    child: &ArrayRef<'_>,
    indices: &ArrayRef<'_>,
    values: &ArrayRef<'_>,
    offset: &ArrayRef<'_>,
    invradius: &ArrayRef<'_>,
) -> Result<()> {
    let targets = {
        let (d, c, i) = (data.arg("data"), child.arg("child"), indices.arg("indices"));
        let (v, o, r) = (values.arg("values"), offset.arg("offset"), invradius.arg("invradius"));
        check_placement(&[d, c, i, v, o, r])?;
        let q = check_rows(&i, Some(3))?;
        check_rows(&v, d.shape().last().copied())?;
        check_same_rows(&v, q, &i)?;
        check_floating_point(&[i, v, d, o, r])?;
        check_integral(&c)?;
        let shape = grid_shape(d.shape(), c.shape())?;
        let transform = transform_of(offset, invradius)?;

        let children = child.data.to_i32("child")?;
        let topology = Topology::new(shape, &children)?;
        log::debug!("assign_vertical: {} points, shape {:?}", q, shape.data_dims());
        tree::assign_targets(&topology, &transform, &points_of(indices))
    };

    let k = data.shape().last().copied().unwrap_or(0);
    if k == 0 {
        return Ok(());
    }
    let mut out = data.data.as_float_mut("data")?;
    let rows = values.data.to_f32();
    for (&cell, row) in targets.iter().zip(rows.chunks_exact(k)) {
        out.write(cell * k, row);
    }
    Ok(())
}

/// Validated rendering inputs, borrowed or narrowed
struct RenderInputs<'a> {
    shape: GridShape,
    transform: Transform,
    features: Cow<'a, [f32]>,
    children: Cow<'a, [i32]>,
    origins: Vec<Vec3>,
    dirs: Vec<Vec3>,
    vdirs: Vec<Vec3>,
}

impl<'a> RenderInputs<'a> {
    #[allow(clippy::too_many_arguments)]
    fn check(
        data: &ArrayRef<'a>,
        child: &ArrayRef<'a>,
        origins: &ArrayRef<'_>,
        dirs: &ArrayRef<'_>,
        vdirs: &ArrayRef<'_>,
        offset: &ArrayRef<'_>,
        invradius: &ArrayRef<'_>,
        grad_output: Option<(&ArrayRef<'_>, usize)>,
    ) -> Result<Self> {
        let (d, c) = (data.arg("data"), child.arg("child"));
        let (ro, rd, rv) = (origins.arg("origins"), dirs.arg("dirs"), vdirs.arg("vdirs"));
        let (o, r) = (offset.arg("offset"), invradius.arg("invradius"));
        let g = grad_output.map(|(array, _)| array.arg("grad_output"));

        let mut args = vec![d, c, ro, rd, rv, o, r];
        args.extend(g);
        check_placement(&args)?;

        let q = check_rows(&ro, Some(3))?;
        for arg in [&rd, &rv] {
            check_rows(arg, Some(3))?;
            check_same_rows(arg, q, &ro)?;
        }
        if let (Some(g), Some((_, channels))) = (&g, grad_output) {
            check_rows(g, Some(channels))?;
            check_same_rows(g, q, &ro)?;
        }

        let mut floats = vec![ro, rd, rv, d, o, r];
        floats.extend(g);
        check_floating_point(&floats)?;
        check_integral(&c)?;
        let shape = grid_shape(d.shape(), c.shape())?;
        let transform = transform_of(offset, invradius)?;
        ensure!(
            shape.channels >= MIN_RENDER_CHANNELS,
            "data must have at least {} channels to render, got {}",
            MIN_RENDER_CHANNELS, shape.channels
        );

        Ok(Self {
            shape,
            transform,
            features: data.data.to_f32(),
            children: child.data.to_i32("child")?,
            origins: points_of(origins),
            dirs: points_of(dirs),
            vdirs: points_of(vdirs),
        })
    }

    fn grid(&self) -> Result<GridRef<'_>> {
        GridRef::new(self.shape, &self.features, &self.children)
    }

    fn rays(&self) -> Result<RayBatch<'_>> {
        RayBatch::new(&self.origins, &self.dirs, &self.vdirs)
    }
}

/// Volume render rays `origins`, `dirs`, `vdirs` (each `(Q, 3)`, world space)
/// through the tree. `data` needs at least 4 channels. Returns `(Q, 3)`, or
/// `(Q, 4)` when `opts.output_alpha` is set.
#[allow(clippy::too_many_arguments)]
pub fn volume_render(
    data: &ArrayRef<'_>,
    child: &ArrayRef<'_>,
    origins: &ArrayRef<'_>,
    dirs: &ArrayRef<'_>,
    vdirs: &ArrayRef<'_>,
    offset: &ArrayRef<'_>,
    invradius: &ArrayRef<'_>,
    opts: &RenderOptions,
) -> Result<OwnedArray> {
    let inputs = RenderInputs::check(data, child, origins, dirs, vdirs, offset, invradius, None)?;
    let rays = inputs.rays()?;
    let out = render::volume_render(&inputs.grid()?, &inputs.transform, &rays, opts)?;
    Ok(OwnedArray { data: out, shape: vec![rays.len(), opts.output_channels()] })
}

/// Gradient of [`volume_render`] with respect to `data`.
///
/// `grad_output` has the forward output's shape. Returns `(M, N, N, N, K)`.
#[allow(clippy::too_many_arguments)]
pub fn volume_render_backward(
    data: &ArrayRef<'_>,
    child: &ArrayRef<'_>,
    origins: &ArrayRef<'_>,
    dirs: &ArrayRef<'_>,
    vdirs: &ArrayRef<'_>,
    offset: &ArrayRef<'_>,
    invradius: &ArrayRef<'_>,
    opts: &RenderOptions,
    grad_output: &ArrayRef<'_>,
) -> Result<OwnedArray> {
    let inputs = RenderInputs::check(
        data,
        child,
        origins,
        dirs,
        vdirs,
        offset,
        invradius,
        Some((grad_output, opts.output_channels())),
    )?;
    let grad = render::volume_render_backward(
        &inputs.grid()?,
        &inputs.transform,
        &inputs.rays()?,
        opts,
        &grad_output.data.to_f32(),
    )?;
    Ok(OwnedArray { data: grad, shape: inputs.shape.data_dims().to_vec() })
}
