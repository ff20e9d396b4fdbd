//! Owned N³-tree container

use crate::core::error::ensure;
use crate::core::{Error, Result, UVec3, Vec3};
use super::grid::{GridMut, GridRef, GridShape, Topology};
use super::query;
use super::transform::Transform;

/// Grid-space placement of one reachable tile
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileGeometry {
    /// Minimum corner in grid space
    pub origin: Vec3,
    /// Edge length in grid space
    pub size: f32,
    /// Child pointers followed from the root
    pub depth: u32,
}

impl TileGeometry {
    /// Edge length of one cell
    pub fn cell_size(&self, n: usize) -> f32 {
        self.size / n as f32
    }

    /// Grid-space center of `cell`
    pub fn cell_center(&self, n: usize, cell: UVec3) -> Vec3 {
        self.origin + (cell.as_vec3() + 0.5) * self.cell_size(n)
    }
}

/// A leaf cell with its grid-space placement
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LeafCell {
    pub tile: usize,
    pub cell: UVec3,
    pub cell_index: usize,
    pub center: Vec3,
    pub size: f32,
    pub depth: u32,
}

/// Sparse tree of `n×n×n` tiles with per-cell feature vectors.
///
/// Tile 0 is the root and covers grid space `[0, 1)^3`; the [`Transform`]
/// places that cube in world space.
#[derive(Debug, Clone, PartialEq)]
pub struct N3Tree {
    shape: GridShape,
    /// `tiles × n³ × channels` features
    data: Vec<f32>,
    /// `tiles × n³` child pointers, `<= 0` for leaves
    child: Vec<i32>,
    transform: Transform,
}

impl N3Tree {
    /// Create a tree holding only a zeroed root tile
    pub fn new(n: usize, channels: usize, transform: Transform) -> Result<Self> {
        ensure!(n > 0, "tile side length must be positive");
        let shape = GridShape::new(1, n, channels);
        let Some((cells, data_len)) = shape.checked_lens() else {
            return Err(Error::precondition(format!("tile shape {:?} is too large", shape.data_dims())));
        };
        Ok(Self {
            shape,
            data: vec![0.0; data_len],
            child: vec![0; cells],
            transform,
        })
    }

    /// Take ownership of existing buffers after validating them
    pub fn from_parts(
        shape: GridShape,
        data: Vec<f32>,
        child: Vec<i32>,
        transform: Transform,
    ) -> Result<Self> {
        GridRef::new(shape, &data, &child)?;
        Ok(Self { shape, data, child, transform })
    }

    /// Give the buffers back
    pub fn into_parts(self) -> (GridShape, Vec<f32>, Vec<i32>, Transform) {
        (self.shape, self.data, self.child, self.transform)
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Tile side length
    pub fn n(&self) -> usize {
        self.shape.n
    }

    /// Feature channels per cell
    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    pub fn tile_count(&self) -> usize {
        self.shape.tiles
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable feature data. The child structure cannot be edited this way.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn child(&self) -> &[i32] {
        &self.child
    }

    pub fn view(&self) -> GridRef<'_> {
        GridRef::new_unchecked(self.shape, &self.data, &self.child)
    }

    pub fn view_mut(&mut self) -> GridMut<'_> {
        GridMut::new_unchecked(self.shape, &mut self.data, &self.child)
    }

    pub fn topology(&self) -> Topology<'_> {
        self.view().topology()
    }

    /// Feature vector of a cell
    pub fn features(&self, tile: usize, cell: UVec3) -> &[f32] {
        self.view().features(self.shape.cell_index(tile, cell))
    }

    /// Approximate heap usage in bytes
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<f32>() * self.data.len() + std::mem::size_of::<i32>() * self.child.len()
    }

    /// Interpolated features at world-space points (`Q×K`)
    pub fn query(&self, points: &[Vec3]) -> Vec<f32> {
        query::query(&self.view(), &self.transform, points)
    }

    /// Gradient of [`query`](Self::query) with respect to the feature data
    pub fn query_backward(&self, points: &[Vec3], grad_output: &[f32]) -> Result<Vec<f32>> {
        query::query_backward(&self.topology(), &self.transform, points, grad_output)
    }

    /// Overwrite the leaf cells containing `points`
    pub fn assign(&mut self, points: &[Vec3], values: &[f32]) -> Result<()> {
        let transform = self.transform;
        query::assign(&mut self.view_mut(), &transform, points, values)
    }

    /// Subdivide a leaf cell with a new tile whose cells all start with the
    /// parent cell's features. Returns the new tile index.
    pub fn refine(&mut self, tile: usize, cell: UVec3) -> Result<usize> {
        let n = self.shape.n as u32;
        if tile >= self.shape.tiles || cell.max_element() >= n {
            return Err(Error::Refine(format!(
                "cell {:?} of tile {} does not exist ({} tiles, n = {})",
                cell, tile, self.shape.tiles, n
            )));
        }
        let cell_index = self.shape.cell_index(tile, cell);
        if self.child[cell_index] > 0 {
            return Err(Error::Refine(format!(
                "cell {:?} of tile {} is already refined",
                cell, tile
            )));
        }
        let new_tile = self.shape.tiles;
        let pointer = i32::try_from(new_tile)
            .map_err(|_| Error::Refine("tile index exceeds i32 range".into()))?;

        let k = self.shape.channels;
        let parent = self.data[cell_index * k..(cell_index + 1) * k].to_vec();
        let cells = self.shape.cells_per_tile();
        self.data.reserve(cells * k);
        for _ in 0..cells {
            self.data.extend_from_slice(&parent);
        }
        self.child.resize(self.child.len() + cells, 0);
        self.child[cell_index] = pointer;
        self.shape.tiles += 1;

        log::trace!("refined tile {} cell {:?} -> tile {}", tile, cell, new_tile);
        Ok(new_tile)
    }

    /// Refine every current leaf cell once. Returns the number of new tiles.
    pub fn refine_all(&mut self) -> Result<usize> {
        let leaves = self.leaves();
        for leaf in &leaves {
            self.refine(leaf.tile, leaf.cell)?;
        }
        Ok(leaves.len())
    }

    /// Placement of every tile reachable from the root, indexed by tile
    pub fn tile_geometry(&self) -> Vec<Option<TileGeometry>> {
        let n = self.shape.n;
        let mut geometry = vec![None; self.shape.tiles];
        geometry[0] = Some(TileGeometry { origin: Vec3::ZERO, size: 1.0, depth: 0 });
        let mut stack = vec![0usize];
        while let Some(tile) = stack.pop() {
            let Some(geom) = geometry[tile] else { continue };
            let cell_size = geom.cell_size(n);
            for i in 0..self.shape.cells_per_tile() {
                let index = tile * self.shape.cells_per_tile() + i;
                let c = self.child[index];
                if c <= 0 {
                    continue;
                }
                let (_, cell) = self.shape.cell_coords(index);
                geometry[c as usize] = Some(TileGeometry {
                    origin: geom.origin + cell.as_vec3() * cell_size,
                    size: cell_size,
                    depth: geom.depth + 1,
                });
                stack.push(c as usize);
            }
        }
        geometry
    }

    /// All leaf cells reachable from the root
    pub fn leaves(&self) -> Vec<LeafCell> {
        let n = self.shape.n;
        let per_tile = self.shape.cells_per_tile();
        let mut out = Vec::new();
        for (tile, geom) in self.tile_geometry().into_iter().enumerate() {
            let Some(geom) = geom else { continue };
            for i in 0..per_tile {
                let cell_index = tile * per_tile + i;
                if self.child[cell_index] > 0 {
                    continue;
                }
                let (_, cell) = self.shape.cell_coords(cell_index);
                out.push(LeafCell {
                    tile,
                    cell,
                    cell_index,
                    center: geom.cell_center(n, cell),
                    size: geom.cell_size(n),
                    depth: geom.depth,
                });
            }
        }
        out
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Deepest level reached (0 for a root-only tree)
    pub fn depth(&self) -> u32 {
        self.tile_geometry()
            .iter()
            .flatten()
            .map(|g| g.depth)
            .max()
            .unwrap_or(0)
    }
}
