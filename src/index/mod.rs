//! The two on-disk indices of a bbi file: the chromosome B+ tree and the
//! R-tree over data blocks.

mod bptree;
mod rtree;

pub use bptree::{BPlusTree, ChromInfo, ChromTable, ChromTree, NameIndex};
pub use rtree::{Block, RTree};
