use std::collections::HashSet;

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::constructs::FieldReader;
use crate::{read_header, BbiError, ByteSource, RTreeHeader, Result};

const NODE_HEADER_SIZE: usize = 4;

/// Location of one data block, as recorded in an R-tree leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    pub offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawLeafItem {
    start_chrom_ix: u32,
    start_base: u32,
    end_chrom_ix: u32,
    end_base: u32,
    data_offset: u64,
    data_size: u64,
}

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawInternalItem {
    start_chrom_ix: u32,
    start_base: u32,
    end_chrom_ix: u32,
    end_base: u32,
    child_offset: u64,
}

const LEAF_ITEM_SIZE: usize = std::mem::size_of::<RawLeafItem>();
const INTERNAL_ITEM_SIZE: usize = std::mem::size_of::<RawInternalItem>();

/// Bounds of a node item on the (chromosome, base) ordinal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Bounds {
    start: (u32, u32),
    end: (u32, u32),
}
impl Bounds {
    fn overlaps(&self, chrom_id: u32, start: u32, end: u32) -> bool {
        self.start < (chrom_id, end) && self.end > (chrom_id, start)
    }
}

enum Node {
    Leaf(Vec<(Bounds, Block)>),
    Internal(Vec<(Bounds, u64)>),
}

/// Spatial index over the data blocks of a file.
#[derive(Copy, Clone, Debug)]
pub struct RTree {
    header: RTreeHeader,
}
impl RTree {
    /// Opens the R-tree at `offset`, or `Ok(None)` when its magic is invalid.
    pub fn open<S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<Option<Self>> {
        let Some(header) = read_header::<RTreeHeader, S>(source, offset)? else {
            return Ok(None);
        };
        if header.block_size == 0 {
            return Err(BbiError::structural(offset, "R-tree block size is 0"));
        }
        debug!(
            offset,
            block_size = header.block_size,
            item_count = header.item_count,
            "opened R-tree"
        );
        Ok(Some(Self { header }))
    }

    pub fn header(&self) -> &RTreeHeader {
        &self.header
    }

    fn read_node<S: ByteSource + ?Sized>(&self, source: &S, offset: u64) -> Result<Node> {
        let mut head = [0u8; NODE_HEADER_SIZE];
        source.read_exact_at(offset, &mut head)?;
        let mut fields = FieldReader::new(&head, self.header.endianness);
        let (Some(is_leaf), Some(_reserved), Some(count)) = (fields.u8(), fields.u8(), fields.u16())
        else {
            return Err(BbiError::structural(offset, "short node header"));
        };
        if count as u32 > self.header.block_size {
            return Err(BbiError::structural(
                offset,
                format!(
                    "node holds {} items, block size is {}",
                    count, self.header.block_size
                ),
            ));
        }

        let e = self.header.endianness;
        let items_at = offset + NODE_HEADER_SIZE as u64;
        match is_leaf {
            1 => {
                let mut bytes = vec![0u8; count as usize * LEAF_ITEM_SIZE];
                source.read_exact_at(items_at, &mut bytes)?;
                Ok(Node::Leaf(
                    bytes
                        .chunks_exact(LEAF_ITEM_SIZE)
                        .map(|chunk| {
                            let raw: RawLeafItem = bytemuck::pod_read_unaligned(chunk);
                            let bounds = Bounds {
                                start: (e.u32(raw.start_chrom_ix), e.u32(raw.start_base)),
                                end: (e.u32(raw.end_chrom_ix), e.u32(raw.end_base)),
                            };
                            let block = Block {
                                offset: e.u64(raw.data_offset),
                                size: e.u64(raw.data_size),
                            };
                            (bounds, block)
                        })
                        .collect(),
                ))
            }
            0 if count == 0 => Err(BbiError::structural(offset, "empty internal node")),
            0 => {
                let mut bytes = vec![0u8; count as usize * INTERNAL_ITEM_SIZE];
                source.read_exact_at(items_at, &mut bytes)?;
                Ok(Node::Internal(
                    bytes
                        .chunks_exact(INTERNAL_ITEM_SIZE)
                        .map(|chunk| {
                            let raw: RawInternalItem = bytemuck::pod_read_unaligned(chunk);
                            let bounds = Bounds {
                                start: (e.u32(raw.start_chrom_ix), e.u32(raw.start_base)),
                                end: (e.u32(raw.end_chrom_ix), e.u32(raw.end_base)),
                            };
                            (bounds, e.u64(raw.child_offset))
                        })
                        .collect(),
                ))
            }
            flag => Err(BbiError::structural(
                offset,
                format!("invalid leaf flag {flag}"),
            )),
        }
    }

    /// Collects every leaf block whose bounds overlap `[start, end)` on
    /// `chrom_id`.
    ///
    /// Blocks come back sorted by file offset with duplicates removed. A node
    /// reached twice is a cycle and reported as structural corruption.
    pub fn find_blocks<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        chrom_id: u32,
        start: u32,
        end: u32,
    ) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![self.header.root_offset()];

        while let Some(offset) = stack.pop() {
            if !visited.insert(offset) {
                return Err(BbiError::structural(offset, "R-tree node visited twice"));
            }
            match self.read_node(source, offset)? {
                Node::Leaf(items) => blocks.extend(
                    items
                        .into_iter()
                        .filter(|(bounds, _)| bounds.overlaps(chrom_id, start, end))
                        .map(|(_, block)| block),
                ),
                Node::Internal(items) => stack.extend(
                    items
                        .into_iter()
                        .rev()
                        .filter(|(bounds, _)| bounds.overlaps(chrom_id, start, end))
                        .map(|(_, child)| child),
                ),
            }
        }

        blocks.sort_unstable();
        blocks.dedup();
        Ok(blocks)
    }
}
