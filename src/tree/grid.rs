//! Tile storage for the N³-tree
//!
//! A tree is an arena of `tiles` cubes of `n×n×n` cells. Every cell carries a
//! `channels`-wide feature vector in `data` and a child pointer in `child`.
//! Both buffers are flat and row-major with cell axes ordered `(x, y, z)`:
//!
//! ```text
//! data:  [tiles][n][n][n][channels]   f32
//! child: [tiles][n][n][n]             i32
//! ```
//!
//! A child value `<= 0` marks a leaf cell. A positive value is the index of the
//! tile subdividing that cell. Tile 0 is the root.

use crate::core::error::ensure;
use crate::core::{Result, UVec3};

/// Dimensions of a tree's buffers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GridShape {
    /// Number of tiles (`M`)
    pub tiles: usize,
    /// Tile side length in cells (`N`)
    pub n: usize,
    /// Feature channels per cell (`K`)
    pub channels: usize,
}

impl GridShape {
    pub fn new(tiles: usize, n: usize, channels: usize) -> Self {
        Self { tiles, n, channels }
    }

    /// Cells in one tile
    #[inline]
    pub fn cells_per_tile(&self) -> usize {
        self.n * self.n * self.n
    }

    /// Total number of cells (length of the `child` buffer)
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.tiles * self.cells_per_tile()
    }

    /// Length of the `data` buffer
    #[inline]
    pub fn data_len(&self) -> usize {
        self.cell_count() * self.channels
    }

    /// Flat cell index of `cell` inside `tile`
    #[inline]
    pub fn cell_index(&self, tile: usize, cell: UVec3) -> usize {
        let n = self.n;
        ((tile * n + cell.x as usize) * n + cell.y as usize) * n + cell.z as usize
    }

    /// Inverse of [`cell_index`](Self::cell_index)
    pub fn cell_coords(&self, index: usize) -> (usize, UVec3) {
        let n = self.n;
        let z = index % n;
        let y = (index / n) % n;
        let x = (index / (n * n)) % n;
        let tile = index / self.cells_per_tile();
        (tile, UVec3::new(x as u32, y as u32, z as u32))
    }

    /// `(cell_count, data_len)`, or `None` when either overflows `usize`
    pub fn checked_lens(&self) -> Option<(usize, usize)> {
        let cells = self.n.checked_mul(self.n)?.checked_mul(self.n)?.checked_mul(self.tiles)?;
        Some((cells, cells.checked_mul(self.channels)?))
    }

    /// Like [`checked_lens`](Self::checked_lens), failing on overflow
    fn buffer_lens(&self) -> Result<(usize, usize)> {
        self.checked_lens().ok_or_else(|| {
            crate::core::Error::precondition(format!(
                "shape {:?} is too large: buffer sizes overflow",
                self.data_dims()
            ))
        })
    }

    /// Shape as the `(M, N, N, N, K)` dims of the data buffer
    pub fn data_dims(&self) -> [usize; 5] {
        [self.tiles, self.n, self.n, self.n, self.channels]
    }

    fn check_buffers(&self, data_len: usize, child_len: usize) -> Result<()> {
        ensure!(self.tiles > 0, "tree must have at least the root tile");
        ensure!(self.n > 0, "tile side length must be positive");
        let (cells, expected_data) = self.buffer_lens()?;
        ensure!(
            data_len == expected_data,
            "data has {} elements, expected {} for shape {:?}",
            data_len, expected_data, self.data_dims()
        );
        ensure!(
            child_len == cells,
            "child has {} elements, expected {}",
            child_len, cells
        );
        Ok(())
    }
}

/// Check the child-pointer invariants: every positive pointer names a tile in
/// `1..tiles`, and no tile has more than one parent. Together these make
/// root-to-leaf descent terminate within `tiles` levels.
pub fn validate_children(shape: &GridShape, child: &[i32]) -> Result<()> {
    let mut has_parent = vec![false; shape.tiles];
    for (index, &c) in child.iter().enumerate() {
        if c <= 0 {
            continue;
        }
        let target = c as usize;
        if target >= shape.tiles {
            let (tile, cell) = shape.cell_coords(index);
            return Err(crate::core::Error::precondition(format!(
                "child pointer {} at tile {} cell {:?} is out of range (tiles = {})",
                c, tile, cell, shape.tiles
            )));
        }
        ensure!(
            !has_parent[target],
            "tile {} is referenced by more than one cell",
            target
        );
        has_parent[target] = true;
    }
    Ok(())
}

/// Read-only view of a tree's buffers
#[derive(Clone, Copy, Debug)]
pub struct GridRef<'a> {
    shape: GridShape,
    data: &'a [f32],
    child: &'a [i32],
}

impl<'a> GridRef<'a> {
    /// Wrap existing buffers, validating lengths and child pointers
    pub fn new(shape: GridShape, data: &'a [f32], child: &'a [i32]) -> Result<Self> {
        shape.check_buffers(data.len(), child.len())?;
        validate_children(&shape, child)?;
        Ok(Self { shape, data, child })
    }

    /// Wrap buffers already known to satisfy the invariants
    pub(crate) fn new_unchecked(shape: GridShape, data: &'a [f32], child: &'a [i32]) -> Self {
        debug_assert_eq!(data.len(), shape.data_len());
        debug_assert_eq!(child.len(), shape.cell_count());
        Self { shape, data, child }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    pub fn child(&self) -> &'a [i32] {
        self.child
    }

    /// Feature vector stored at a flat cell index
    #[inline]
    pub fn features(&self, cell_index: usize) -> &'a [f32] {
        let k = self.shape.channels;
        &self.data[cell_index * k..(cell_index + 1) * k]
    }

    /// Child tile of a cell, or `None` for a leaf
    #[inline]
    pub fn child_of(&self, cell_index: usize) -> Option<usize> {
        let c = self.child[cell_index];
        (c > 0).then_some(c as usize)
    }

    /// Child buffer paired with the shape, for passes that never read `data`
    pub fn topology(&self) -> Topology<'a> {
        Topology { shape: self.shape, child: self.child }
    }
}

/// Mutable view used by scatter assignment. `child` stays read-only.
#[derive(Debug)]
pub struct GridMut<'a> {
    shape: GridShape,
    data: &'a mut [f32],
    child: &'a [i32],
}

impl<'a> GridMut<'a> {
    pub fn new(shape: GridShape, data: &'a mut [f32], child: &'a [i32]) -> Result<Self> {
        shape.check_buffers(data.len(), child.len())?;
        validate_children(&shape, child)?;
        Ok(Self { shape, data, child })
    }

    pub(crate) fn new_unchecked(shape: GridShape, data: &'a mut [f32], child: &'a [i32]) -> Self {
        debug_assert_eq!(data.len(), shape.data_len());
        debug_assert_eq!(child.len(), shape.cell_count());
        Self { shape, data, child }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn topology(&self) -> Topology<'_> {
        Topology { shape: self.shape, child: self.child }
    }

    /// Mutable feature vector at a flat cell index
    #[inline]
    pub fn features_mut(&mut self, cell_index: usize) -> &mut [f32] {
        let k = self.shape.channels;
        &mut self.data[cell_index * k..(cell_index + 1) * k]
    }

    pub fn view(&self) -> GridRef<'_> {
        GridRef::new_unchecked(self.shape, self.data, self.child)
    }
}

/// Shape plus child pointers: everything traversal needs.
///
/// The gradient pass only has the tree structure, never the feature data.
#[derive(Clone, Copy, Debug)]
pub struct Topology<'a> {
    shape: GridShape,
    child: &'a [i32],
}

impl<'a> Topology<'a> {
    pub fn new(shape: GridShape, child: &'a [i32]) -> Result<Self> {
        ensure!(shape.tiles > 0 && shape.n > 0, "empty tree shape {:?}", shape);
        // Gradient passes allocate a full data buffer, so its length must fit too
        let (cells, _) = shape.buffer_lens()?;
        ensure!(
            child.len() == cells,
            "child has {} elements, expected {}",
            child.len(), cells
        );
        validate_children(&shape, child)?;
        Ok(Self { shape, child })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    #[inline]
    pub fn child_of(&self, cell_index: usize) -> Option<usize> {
        let c = self.child[cell_index];
        (c > 0).then_some(c as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;

    #[test]
    fn test_shape_sizes() {
        let shape = GridShape::new(3, 2, 4);
        assert_eq!(shape.cells_per_tile(), 8);
        assert_eq!(shape.cell_count(), 24);
        assert_eq!(shape.data_len(), 96);
        assert_eq!(shape.data_dims(), [3, 2, 2, 2, 4]);
    }

    #[test]
    fn test_cell_index_is_row_major() {
        let shape = GridShape::new(2, 4, 1);
        assert_eq!(shape.cell_index(0, UVec3::new(0, 0, 1)), 1);
        assert_eq!(shape.cell_index(0, UVec3::new(0, 1, 0)), 4);
        assert_eq!(shape.cell_index(0, UVec3::new(1, 0, 0)), 16);
        assert_eq!(shape.cell_index(1, UVec3::ZERO), 64);
        for index in [0, 5, 17, 63, 64, 127] {
            let (tile, cell) = shape.cell_coords(index);
            assert_eq!(shape.cell_index(tile, cell), index);
        }
    }

    #[test]
    fn test_grid_ref_rejects_bad_lengths() {
        let shape = GridShape::new(1, 2, 3);
        let data = vec![0.0; 23];
        let child = vec![0; 8];
        assert!(matches!(GridRef::new(shape, &data, &child), Err(Error::Precondition(_))));

        let data = vec![0.0; 24];
        let child = vec![0; 7];
        assert!(GridRef::new(shape, &data, &child).is_err());
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        // n³ wraps to 0 in release, which would match empty buffers
        let shape = GridShape::new(1, 1 << 22, 1);
        assert_eq!(shape.checked_lens(), None);
        let err = GridRef::new(shape, &[], &[]).unwrap_err();
        assert!(matches!(&err, Error::Precondition(msg) if msg.contains("too large")));
        assert!(matches!(GridMut::new(shape, &mut [], &[]), Err(Error::Precondition(_))));
        assert!(matches!(Topology::new(shape, &[]), Err(Error::Precondition(_))));

        // Cell count fits, the data length does not
        let wide = GridShape::new(1, 2, usize::MAX);
        assert_eq!(wide.checked_lens(), None);
        assert!(matches!(Topology::new(wide, &[0; 8]), Err(Error::Precondition(_))));
    }

    #[test]
    fn test_child_out_of_range() {
        let shape = GridShape::new(2, 2, 1);
        let mut child = vec![0; 16];
        child[3] = 2;
        let err = validate_children(&shape, &child).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_child_shared_parent_rejected() {
        let shape = GridShape::new(2, 2, 1);
        let mut child = vec![0; 16];
        child[0] = 1;
        child[1] = 1;
        assert!(validate_children(&shape, &child).is_err());
    }

    #[test]
    fn test_negative_child_is_leaf() {
        let shape = GridShape::new(2, 2, 1);
        let mut child = vec![-1; 16];
        child[2] = 1;
        let data = vec![0.0; 16];
        let grid = GridRef::new(shape, &data, &child).unwrap();
        assert_eq!(grid.child_of(0), None);
        assert_eq!(grid.child_of(2), Some(1));
    }

    #[test]
    fn test_features_slices() {
        let shape = GridShape::new(1, 1, 3);
        let mut data = vec![1.0, 2.0, 3.0];
        let child = vec![0];
        {
            let mut grid = GridMut::new(shape, &mut data, &child).unwrap();
            grid.features_mut(0)[1] = 5.0;
            assert_eq!(grid.view().features(0), &[1.0, 5.0, 3.0]);
        }
        assert_eq!(data, vec![1.0, 5.0, 3.0]);
    }
}
