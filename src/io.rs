//! Tree serialization and disk I/O
//!
//! Files are an rkyv archive of [`TreeData`], LZ4 compressed with the
//! uncompressed size prepended. Loading re-validates the child pointers, so a
//! corrupted or hand-edited file cannot produce a tree that fails to descend.

use std::fs;
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::{Error, Result, Vec3};
use crate::tree::{GridShape, N3Tree, Transform};

/// Bumped whenever [`TreeData`] changes layout
pub const FORMAT_VERSION: u32 = 1;

/// Conventional file extension
pub const TREE_EXTENSION: &str = "n3t";

/// Serializable tree contents
#[derive(Archive, Deserialize, Serialize)]
pub struct TreeData {
    pub version: u32,
    pub tiles: u64,
    pub n: u64,
    pub channels: u64,
    pub offset: [f32; 3],
    pub invradius: [f32; 3],
    pub data: Vec<f32>,
    pub child: Vec<i32>,
}

impl TreeData {
    fn from_tree(tree: &N3Tree) -> Self {
        let shape = tree.shape();
        let transform = tree.transform();
        Self {
            version: FORMAT_VERSION,
            tiles: shape.tiles as u64,
            n: shape.n as u64,
            channels: shape.channels as u64,
            offset: transform.offset.to_array(),
            invradius: transform.invradius.to_array(),
            data: tree.data().to_vec(),
            child: tree.child().to_vec(),
        }
    }

    fn into_tree(self) -> Result<N3Tree> {
        if self.version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported tree format version {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        let dim = |value: u64| {
            usize::try_from(value)
                .map_err(|_| Error::Serialization(format!("dimension {} does not fit in usize", value)))
        };
        let shape = GridShape::new(dim(self.tiles)?, dim(self.n)?, dim(self.channels)?);
        if shape.checked_lens().is_none() {
            return Err(Error::Serialization(format!(
                "tree shape {:?} is too large",
                shape.data_dims()
            )));
        }
        let transform = Transform::new(Vec3::from_array(self.offset), Vec3::from_array(self.invradius));
        N3Tree::from_parts(shape, self.data, self.child, transform)
    }
}

/// Serialize a tree to bytes (uncompressed)
pub fn serialize_tree(tree: &N3Tree) -> Result<Vec<u8>> {
    let data = TreeData::from_tree(tree);
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(bytes.to_vec())
}

/// Deserialize a tree from bytes (uncompressed)
pub fn deserialize_tree(bytes: &[u8]) -> Result<N3Tree> {
    // The archive root must be aligned; decompressed buffers carry no guarantee
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::access::<ArchivedTreeData, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let data: TreeData = rkyv::deserialize::<TreeData, rkyv::rancor::Error>(archived)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    data.into_tree()
}

/// Serialize and LZ4-compress a tree
pub fn compress_tree(tree: &N3Tree) -> Result<Vec<u8>> {
    let serialized = serialize_tree(tree)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress and deserialize a tree
pub fn decompress_tree(bytes: &[u8]) -> Result<N3Tree> {
    let decompressed = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| Error::Serialization(format!("LZ4 decompression failed: {}", e)))?;
    deserialize_tree(&decompressed)
}

/// Save a tree to disk (compressed), creating parent directories
pub fn save_tree(path: &Path, tree: &N3Tree) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let compressed = compress_tree(tree)?;
    fs::write(path, &compressed)?;
    log::info!(
        "saved tree to {} ({} tiles, {} bytes)",
        path.display(),
        tree.tile_count(),
        compressed.len()
    );
    Ok(())
}

/// Load a tree from disk
pub fn load_tree(path: &Path) -> Result<N3Tree> {
    let compressed = fs::read(path)?;
    let tree = decompress_tree(&compressed)?;
    log::info!("loaded tree from {} ({} tiles)", path.display(), tree.tile_count());
    Ok(tree)
}
