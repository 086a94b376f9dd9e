//! On-disk B+ tree used for chromosome name lookup and bigBed name indices.
//!
//! Nodes are never cached: each visit reads the node at its file offset and
//! decodes it into a plain value, and child links stay file offsets.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::Block;
use crate::constructs::{require_header, FieldReader};
use crate::{read_header, BPlusTreeHeader, BbiError, ByteSource, Result};

/// Upper bound on key and value widths accepted from a header.
const MAX_FIELD_WIDTH: u32 = 1024;

/// Trees with a fan-out of at least two and at most `u64::MAX` items cannot
/// be deeper than this.
const MAX_DEPTH: usize = 64;

const NODE_HEADER_SIZE: usize = 4;
const CHILD_OFFSET_SIZE: u32 = 8;

/// A chromosome (or contig) entry of the chromosome tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChromInfo {
    /// Name with trailing NUL padding removed.
    pub name: String,
    pub id: u32,
    pub length: u32,
}

enum Node {
    Leaf(Vec<(Vec<u8>, Vec<u8>)>),
    Internal(Vec<(Vec<u8>, u64)>),
}

/// A B+ tree rooted directly after its header.
#[derive(Copy, Clone, Debug)]
pub struct BPlusTree {
    header: BPlusTreeHeader,
}
impl BPlusTree {
    /// Opens the tree whose header sits at `offset`.
    ///
    /// Returns `Ok(None)` when the header magic is not recognized.
    pub fn open<S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<Option<Self>> {
        read_header(source, offset)?.map(Self::from_header).transpose()
    }

    fn from_header(header: BPlusTreeHeader) -> Result<Self> {
        if header.block_size == 0 {
            return Err(BbiError::structural(header.offset, "B+ tree block size is 0"));
        }
        if header.key_size == 0 || header.key_size > MAX_FIELD_WIDTH {
            return Err(BbiError::structural(
                header.offset,
                format!("B+ tree key size {} out of range", header.key_size),
            ));
        }
        if header.val_size > MAX_FIELD_WIDTH {
            return Err(BbiError::structural(
                header.offset,
                format!("B+ tree value size {} out of range", header.val_size),
            ));
        }
        debug!(
            offset = header.offset,
            block_size = header.block_size,
            key_size = header.key_size,
            val_size = header.val_size,
            item_count = header.item_count,
            "opened B+ tree"
        );
        Ok(Self { header })
    }

    pub fn header(&self) -> &BPlusTreeHeader {
        &self.header
    }

    /// Pads `key` to the fixed key width, or `None` if it cannot fit.
    fn padded_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let width = self.header.key_size as usize;
        if key.len() > width {
            return None;
        }
        let mut padded = key.to_vec();
        padded.resize(width, 0);
        Some(padded)
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
        let value_size = match is_leaf {
            1 => self.header.val_size,
            0 if count == 0 => return Err(BbiError::structural(offset, "empty internal node")),
            0 => CHILD_OFFSET_SIZE,
            flag => {
                return Err(BbiError::structural(
                    offset,
                    format!("invalid leaf flag {flag}"),
                ))
            }
        };

        let key_size = self.header.key_size as usize;
        let item_size = key_size + value_size as usize;
        let mut bytes = vec![0u8; item_size * count as usize];
        source.read_exact_at(offset + NODE_HEADER_SIZE as u64, &mut bytes)?;

        let mut keys = Vec::with_capacity(count as usize);
        let mut values = Vec::with_capacity(count as usize);
        for item in bytes.chunks_exact(item_size) {
            let (key, value) = item.split_at(key_size);
            if keys.last().is_some_and(|prev: &Vec<u8>| prev.as_slice() >= key) {
                return Err(BbiError::structural(offset, "node keys out of order"));
            }
            keys.push(key.to_vec());
            values.push(value);
        }

        if is_leaf == 1 {
            Ok(Node::Leaf(
                keys.into_iter()
                    .zip(values.into_iter().map(<[u8]>::to_vec))
                    .collect(),
            ))
        } else {
            let children = values.into_iter().map(|v| {
                FieldReader::new(v, self.header.endianness)
                    .u64()
                    .unwrap_or_default()
            });
            Ok(Node::Internal(keys.into_iter().zip(children).collect()))
        }
    }

    /// Descends from the root to the leaf that may hold `key` and returns the
    /// value stored under an exact match.
    pub fn find<S: ByteSource + ?Sized>(&self, source: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(key) = self.padded_key(key) else {
            return Ok(None);
        };

        let mut offset = self.header.root_offset();
        for _ in 0..MAX_DEPTH {
            match self.read_node(source, offset)? {
                Node::Leaf(items) => {
                    return Ok(items
                        .binary_search_by(|(k, _)| k.as_slice().cmp(&key))
                        .ok()
                        .map(|i| items[i].1.clone()));
                }
                Node::Internal(items) => {
                    // each child key is the smallest key of its subtree
                    let idx = items.partition_point(|(k, _)| k.as_slice() <= key.as_slice());
                    if idx == 0 {
                        return Ok(None);
                    }
                    offset = items[idx - 1].1;
                }
            }
        }
        Err(BbiError::structural(
            offset,
            format!("B+ tree deeper than {MAX_DEPTH} levels"),
        ))
    }

    /// Returns every leaf item in key order.
    pub fn items<S: ByteSource + ?Sized>(&self, source: &S) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut items = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![self.header.root_offset()];

        while let Some(offset) = stack.pop() {
            if !visited.insert(offset) {
                return Err(BbiError::structural(offset, "B+ tree node visited twice"));
            }
            match self.read_node(source, offset)? {
                Node::Leaf(leaf) => items.extend(leaf),
                Node::Internal(children) => {
                    stack.extend(children.into_iter().rev().map(|(_, child)| child))
                }
            }
        }

        if items.len() as u64 != self.header.item_count {
            warn!(
                offset = self.header.offset,
                declared = self.header.item_count,
                found = items.len(),
                "B+ tree item count disagrees with header"
            );
        }
        Ok(items)
    }
}

fn trim_key(key: &[u8]) -> &[u8] {
    let end = key.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &key[..end]
}

/// Chromosome name index: B+ tree keyed by padded name, valued by id and size.
#[derive(Copy, Clone, Debug)]
pub struct ChromTree {
    tree: BPlusTree,
}
impl ChromTree {
    const VALUE_SIZE: u32 = 8;

    /// Opens the chromosome tree at `offset`. The tree is mandatory, so an
    /// unrecognized magic is an error here.
    pub fn open<S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<Self> {
        let header: BPlusTreeHeader = require_header(source, offset)?;
        if header.val_size != Self::VALUE_SIZE {
            return Err(BbiError::structural(
                offset,
                format!(
                    "chromosome tree value size is {}, expected {}",
                    header.val_size,
                    Self::VALUE_SIZE
                ),
            ));
        }
        Ok(Self {
            tree: BPlusTree::from_header(header)?,
        })
    }

    pub fn header(&self) -> &BPlusTreeHeader {
        self.tree.header()
    }

    fn entry(&self, key: &[u8], value: &[u8]) -> Result<ChromInfo> {
        let offset = self.tree.header.offset;
        let name = std::str::from_utf8(trim_key(key))
            .map_err(|_| BbiError::structural(offset, "chromosome name is not UTF-8"))?;
        let mut fields = FieldReader::new(value, self.tree.header.endianness);
        let (Some(id), Some(length)) = (fields.u32(), fields.u32()) else {
            return Err(BbiError::structural(offset, "short chromosome value"));
        };
        Ok(ChromInfo {
            name: name.to_owned(),
            id,
            length,
        })
    }

    /// Looks up a chromosome by exact (case-sensitive) name.
    pub fn lookup<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        name: &str,
    ) -> Result<Option<ChromInfo>> {
        match self.tree.find(source, name.as_bytes())? {
            Some(value) => self.entry(name.as_bytes(), &value).map(Some),
            None => Ok(None),
        }
    }

    /// Reads every chromosome, in name order.
    pub fn all<S: ByteSource + ?Sized>(&self, source: &S) -> Result<Vec<ChromInfo>> {
        self.tree
            .items(source)?
            .iter()
            .map(|(key, value)| self.entry(key, value))
            .collect()
    }
}

/// In-memory id lookup over the chromosome tree's entries.
#[derive(Clone, Debug, Default)]
pub struct ChromTable {
    chroms: Vec<ChromInfo>,
    by_id: HashMap<u32, usize>,
}
impl ChromTable {
    /// Builds the table, rejecting duplicate names or ids.
    ///
    /// `offset` locates the chromosome tree the entries were read from and is
    /// reported with any duplicate.
    pub fn new(offset: u64, chroms: Vec<ChromInfo>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(chroms.len());
        let mut names = HashSet::with_capacity(chroms.len());
        for (i, chrom) in chroms.iter().enumerate() {
            if by_id.insert(chrom.id, i).is_some() || !names.insert(chrom.name.as_str()) {
                return Err(BbiError::structural(
                    offset,
                    format!("duplicate chromosome {} (id {})", chrom.name, chrom.id),
                ));
            }
        }
        Ok(Self { chroms, by_id })
    }

    pub fn get(&self, id: u32) -> Option<&ChromInfo> {
        self.by_id.get(&id).map(|&i| &self.chroms[i])
    }

    pub fn as_slice(&self) -> &[ChromInfo] {
        &self.chroms
    }

    pub fn len(&self) -> usize {
        self.chroms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chroms.is_empty()
    }
}

/// bigBed extra index: B+ tree from a BED column value to the data block
/// holding the matching rows.
#[derive(Copy, Clone, Debug)]
pub struct NameIndex {
    tree: BPlusTree,
    column: u16,
}
impl NameIndex {
    const VALUE_SIZE: u32 = 16;

    /// Opens the index tree at `offset`.
    ///
    /// Returns `Ok(None)` when the header magic or value width is not that of
    /// a name index; the file is then treated as having no such index.
    pub fn open<S: ByteSource + ?Sized>(
        source: &S,
        offset: u64,
        column: u16,
    ) -> Result<Option<Self>> {
        let Some(tree) = BPlusTree::open(source, offset)? else {
            return Ok(None);
        };
        if tree.header.val_size != Self::VALUE_SIZE {
            warn!(
                offset,
                val_size = tree.header.val_size,
                "ignoring extra index with unexpected value size"
            );
            return Ok(None);
        }
        Ok(Some(Self { tree, column }))
    }

    /// BED column covered by this index.
    pub fn column(&self) -> usize {
        self.column as usize
    }

    /// Finds the data block holding rows whose column equals `name`.
    pub fn find_block<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        name: &str,
    ) -> Result<Option<Block>> {
        let Some(value) = self.tree.find(source, name.as_bytes())? else {
            return Ok(None);
        };
        let mut fields = FieldReader::new(&value, self.tree.header.endianness);
        match (fields.u64(), fields.u64()) {
            (Some(offset), Some(size)) => Ok(Some(Block { offset, size })),
            _ => Err(BbiError::structural(
                self.tree.header.offset,
                "short name index value",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{write_bptree, ByteWriter};
    use crate::{Endianness, SeekSource};
    use std::io::Cursor;

    fn build_tree(
        chroms: &[(&str, u32, u32)],
        block_size: u32,
        endianness: Endianness,
        prefix: usize,
    ) -> SeekSource<Cursor<Vec<u8>>> {
        let key_size = chroms.iter().map(|c| c.0.len()).max().unwrap_or(1);
        let mut items: Vec<_> = chroms
            .iter()
            .map(|&(name, id, len)| {
                let mut value = ByteWriter::new(endianness);
                value.u32(id);
                value.u32(len);
                (name.as_bytes().to_vec(), value.into_inner())
            })
            .collect();
        items.sort();

        let mut w = ByteWriter::new(endianness);
        w.zeros(prefix);
        write_bptree(&mut w, key_size as u32, 8, block_size, &items);
        SeekSource::new(Cursor::new(w.into_inner()))
    }

    fn many_chroms(n: u32) -> Vec<(String, u32, u32)> {
        (0..n)
            .map(|i| (format!("chr{}", i + 1), i, 1_000_000 + i * 7))
            .collect()
    }

    #[test]
    fn test_lookup_single_leaf() {
        let chroms = [("chr1", 0, 248956422), ("chr11", 5, 135006516), ("chrX", 9, 156040895)];
        let source = build_tree(&chroms, 256, Endianness::Little, 0);
        let tree = ChromTree::open(&source, 0).unwrap();

        let chr11 = tree.lookup(&source, "chr11").unwrap().unwrap();
        assert_eq!(chr11.id, 5);
        assert_eq!(chr11.length, 135006516);
        assert_eq!(chr11.name, "chr11");

        assert!(tree.lookup(&source, "chrZZ").unwrap().is_none());
        assert!(tree.lookup(&source, "CHR11").unwrap().is_none());
        assert!(tree.lookup(&source, "chr1_too_long_for_key").unwrap().is_none());
        assert!(tree.lookup(&source, "chr").unwrap().is_none());
        assert!(tree.lookup(&source, "a").unwrap().is_none());
    }

    #[test]
    fn test_multi_level_descent_round_trips() {
        let owned = many_chroms(200);
        let chroms: Vec<_> = owned.iter().map(|(n, i, l)| (n.as_str(), *i, *l)).collect();

        for endianness in [Endianness::Little, Endianness::Big] {
            let source = build_tree(&chroms, 4, endianness, 17);
            let tree = ChromTree::open(&source, 17).unwrap();
            assert_eq!(tree.header().endianness, endianness);

            let all = tree.all(&source).unwrap();
            assert_eq!(all.len(), 200);
            let table = ChromTable::new(17, all.clone()).unwrap();

            for (name, id, len) in &chroms {
                let found = tree.lookup(&source, name).unwrap().unwrap();
                assert_eq!(found.id, *id);
                assert_eq!(found.length, *len);
                assert_eq!(table.get(found.id).unwrap().name, *name);
            }

            let mut names: Vec<_> = all.iter().map(|c| c.name.clone()).collect();
            let sorted = {
                let mut s = names.clone();
                s.sort();
                s
            };
            assert_eq!(names, sorted);
            names.dedup();
            assert_eq!(names.len(), 200);
        }
    }

    #[test]
    fn test_invalid_magic_is_absent_for_generic_tree() {
        let source = SeekSource::new(Cursor::new(vec![0u8; 64]));
        assert!(BPlusTree::open(&source, 0).unwrap().is_none());
        assert!(matches!(
            ChromTree::open(&source, 0),
            Err(BbiError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_node_exceeding_block_size_is_corruption() {
        let chroms = [("chr1", 0, 10), ("chr2", 1, 20), ("chr3", 2, 30)];
        let source = build_tree(&chroms, 256, Endianness::Little, 0);
        let mut bytes = source.into_inner().into_inner();
        // shrink the declared block size below the root's item count
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        let source = SeekSource::new(Cursor::new(bytes));

        let tree = ChromTree::open(&source, 0).unwrap();
        assert!(matches!(
            tree.lookup(&source, "chr2"),
            Err(BbiError::StructuralCorruption { .. })
        ));
        assert!(matches!(
            tree.all(&source),
            Err(BbiError::StructuralCorruption { .. })
        ));
    }

    #[test]
    fn test_invalid_leaf_flag_is_corruption() {
        let chroms = [("chr1", 0, 10)];
        let source = build_tree(&chroms, 256, Endianness::Big, 0);
        let mut bytes = source.into_inner().into_inner();
        bytes[32] = 7;
        let source = SeekSource::new(Cursor::new(bytes));

        let tree = ChromTree::open(&source, 0).unwrap();
        assert!(matches!(
            tree.lookup(&source, "chr1"),
            Err(BbiError::StructuralCorruption { .. })
        ));
    }

    #[test]
    fn test_wrong_value_size_rejected() {
        let mut w = ByteWriter::new(Endianness::Little);
        write_bptree(&mut w, 4, 12, 8, &[(b"chr1".to_vec(), vec![0; 12])]);
        let source = SeekSource::new(Cursor::new(w.into_inner()));
        assert!(matches!(
            ChromTree::open(&source, 0),
            Err(BbiError::StructuralCorruption { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let chroms = vec![
            ChromInfo {
                name: "chr1".into(),
                id: 0,
                length: 10,
            },
            ChromInfo {
                name: "chr2".into(),
                id: 0,
                length: 20,
            },
        ];
        assert!(matches!(
            ChromTable::new(4096, chroms),
            Err(BbiError::StructuralCorruption { offset: 4096, .. })
        ));
    }

    #[test]
    fn test_name_index_block_lookup() {
        let mut w = ByteWriter::new(Endianness::Big);
        let items: Vec<_> = ["geneA", "geneB", "geneC"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut v = ByteWriter::new(Endianness::Big);
                v.u64(1000 + i as u64 * 100);
                v.u64(50);
                (name.as_bytes().to_vec(), v.into_inner())
            })
            .collect();
        write_bptree(&mut w, 5, 16, 2, &items);
        let source = SeekSource::new(Cursor::new(w.into_inner()));

        let index = NameIndex::open(&source, 0, 3).unwrap().unwrap();
        assert_eq!(index.column(), 3);
        assert_eq!(
            index.find_block(&source, "geneB").unwrap(),
            Some(Block {
                offset: 1100,
                size: 50
            })
        );
        assert_eq!(index.find_block(&source, "geneZ").unwrap(), None);
    }

    #[test]
    fn test_trim_key() {
        assert_eq!(trim_key(b"chr1\0\0"), b"chr1");
        assert_eq!(trim_key(b"\0\0"), b"");
        assert_eq!(trim_key(b"chrX"), b"chrX");
    }
}
