//! Sparse N³-tree: storage, coordinate mapping and vertical queries

pub mod accumulator;
pub mod builder;
pub mod grid;
pub mod interp;
pub mod n3tree;
pub mod query;
pub mod transform;
pub mod traversal;

pub use accumulator::AtomicAccumulator;
pub use builder::{TreeBuilder, create_test_sphere};
pub use grid::{GridMut, GridRef, GridShape, Topology};
pub use interp::Stencil;
pub use n3tree::{LeafCell, N3Tree, TileGeometry};
pub use query::{assign, assign_targets, query, query_backward, query_backward_into};
pub use transform::Transform;
pub use traversal::{LeafHit, descend};
