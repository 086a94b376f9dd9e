//! Writes complete bigBed and bigWig files for tests and benchmarks.
//!
//! Only std and flate2 are used here so the module can be compiled into the
//! library's unit tests, the integration tests, and the bench alike. The
//! including crate must have `Endianness` in scope at its root.
#![allow(dead_code)]

use std::io::Write;

use flate2::{write::ZlibEncoder, Compression};

use super::Endianness;

const BIGWIG_MAGIC: u32 = 0x888F_FC26;
const BIGBED_MAGIC: u32 = 0x8789_F2EB;
const BPLUS_TREE_MAGIC: u32 = 0x78CA_8C91;
const RTREE_MAGIC: u32 = 0x2468_ACE0;

const MAIN_HEADER_SIZE: u64 = 64;
const NODE_HEADER_SIZE: u64 = 4;

/// Growable byte buffer that encodes numbers in a fixed byte order.
pub struct ByteWriter {
    buf: Vec<u8>,
    endianness: Endianness,
}
impl ByteWriter {
    pub fn new(endianness: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            endianness,
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Current write position.
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        match self.endianness {
            Endianness::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endianness::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub fn u32(&mut self, v: u32) {
        let bytes = self.encode_u32(v);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn u64(&mut self, v: u64) {
        let bytes = self.encode_u64(v);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }

    pub fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    pub fn patch_u32(&mut self, at: u64, v: u32) {
        let bytes = self.encode_u32(v);
        self.buf[at as usize..at as usize + 4].copy_from_slice(&bytes);
    }

    pub fn patch_u64(&mut self, at: u64, v: u64) {
        let bytes = self.encode_u64(v);
        self.buf[at as usize..at as usize + 8].copy_from_slice(&bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn encode_u32(&self, v: u32) -> [u8; 4] {
        match self.endianness {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        }
    }

    fn encode_u64(&self, v: u64) -> [u8; 8] {
        match self.endianness {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        }
    }
}

/// Splits `n` items into chunk sizes of at most `per`, always yielding at
/// least one (possibly empty) chunk.
fn chunk_sizes(n: usize, per: usize) -> Vec<usize> {
    if n == 0 {
        return vec![0];
    }
    (0..n).step_by(per).map(|i| per.min(n - i)).collect()
}

/// Writes a B+ tree (header plus nodes, root first) at the writer's position.
///
/// `items` must be sorted by key; keys are NUL-padded to `key_size`.
pub fn write_bptree(
    w: &mut ByteWriter,
    key_size: u32,
    val_size: u32,
    block_size: u32,
    items: &[(Vec<u8>, Vec<u8>)],
) {
    let per = block_size as usize;
    let pad = |key: &[u8]| {
        let mut key = key.to_vec();
        key.resize(key_size as usize, 0);
        key
    };

    // per level (leaves first): node item counts and the first key of each node
    let mut counts = vec![chunk_sizes(items.len(), per)];
    let mut first_keys = vec![counts[0]
        .iter()
        .scan(0, |at, &n| {
            let key = items.get(*at).map_or(vec![0; key_size as usize], |(k, _)| pad(k));
            *at += n;
            Some(key)
        })
        .collect::<Vec<_>>()];
    while counts.last().map_or(0, Vec::len) > 1 {
        let below = counts.len() - 1;
        let level = chunk_sizes(counts[below].len(), per);
        let keys = (0..level.len())
            .map(|j| first_keys[below][j * per].clone())
            .collect();
        counts.push(level);
        first_keys.push(keys);
    }

    let item_size = |level: usize| key_size as u64 + if level == 0 { val_size as u64 } else { 8 };
    let root = w.len() + 32;
    let mut offsets = vec![Vec::new(); counts.len()];
    let mut at = root;
    for level in (0..counts.len()).rev() {
        for &n in &counts[level] {
            offsets[level].push(at);
            at += NODE_HEADER_SIZE + n as u64 * item_size(level);
        }
    }

    w.u32(BPLUS_TREE_MAGIC);
    w.u32(block_size);
    w.u32(key_size);
    w.u32(val_size);
    w.u64(items.len() as u64);
    w.zeros(8);

    for level in (0..counts.len()).rev() {
        for (j, &n) in counts[level].iter().enumerate() {
            assert_eq!(w.len(), offsets[level][j]);
            w.u8(u8::from(level == 0));
            w.u8(0);
            w.u16(n as u16);
            for i in j * per..j * per + n {
                if level == 0 {
                    let (key, value) = &items[i];
                    assert_eq!(value.len(), val_size as usize);
                    w.bytes(&pad(key));
                    w.bytes(value);
                } else {
                    w.bytes(&first_keys[level - 1][i]);
                    w.u64(offsets[level - 1][i]);
                }
            }
        }
    }
}

/// One R-tree leaf item: block bounds and block location.
#[derive(Copy, Clone, Debug)]
pub struct LeafEntry {
    pub start: (u32, u32),
    pub end: (u32, u32),
    /// (offset, size)
    pub block: (u64, u64),
}

/// Writes an R-tree (header plus nodes, root first) at the writer's position.
pub fn write_rtree(w: &mut ByteWriter, fan_out: u32, entries: &[LeafEntry]) {
    let per = fan_out as usize;

    // per level (leaves first): node item counts and each node's bounds
    let mut counts = vec![chunk_sizes(entries.len(), per)];
    let leaf_bounds = {
        let mut at = 0;
        counts[0]
            .iter()
            .map(|&n| {
                let node = &entries[at..at + n];
                at += n;
                span(node.iter().map(|e| (e.start, e.end)))
            })
            .collect::<Vec<_>>()
    };
    let mut bounds = vec![leaf_bounds];
    while counts.last().map_or(0, Vec::len) > 1 {
        let below = counts.len() - 1;
        let level = chunk_sizes(counts[below].len(), per);
        let mut at = 0;
        let level_bounds = level
            .iter()
            .map(|&n| {
                let node = &bounds[below][at..at + n];
                at += n;
                span(node.iter().copied())
            })
            .collect();
        counts.push(level);
        bounds.push(level_bounds);
    }

    let item_size = |level: usize| if level == 0 { 32 } else { 24 };
    let header_at = w.len();
    let mut offsets = vec![Vec::new(); counts.len()];
    let mut at = header_at + 48;
    for level in (0..counts.len()).rev() {
        for &n in &counts[level] {
            offsets[level].push(at);
            at += NODE_HEADER_SIZE + n as u64 * item_size(level);
        }
    }

    let (start, end) = span(entries.iter().map(|e| (e.start, e.end)));
    w.u32(RTREE_MAGIC);
    w.u32(fan_out);
    w.u64(entries.len() as u64);
    w.u32(start.0);
    w.u32(start.1);
    w.u32(end.0);
    w.u32(end.1);
    w.u64(header_at);
    w.u32(1);
    w.u32(0);

    for level in (0..counts.len()).rev() {
        for (j, &n) in counts[level].iter().enumerate() {
            assert_eq!(w.len(), offsets[level][j]);
            w.u8(u8::from(level == 0));
            w.u8(0);
            w.u16(n as u16);
            for i in j * per..j * per + n {
                if level == 0 {
                    let entry = entries[i];
                    for v in [entry.start.0, entry.start.1, entry.end.0, entry.end.1] {
                        w.u32(v);
                    }
                    w.u64(entry.block.0);
                    w.u64(entry.block.1);
                } else {
                    let (start, end) = bounds[level - 1][i];
                    for v in [start.0, start.1, end.0, end.1] {
                        w.u32(v);
                    }
                    w.u64(offsets[level - 1][i]);
                }
            }
        }
    }
}

type Bounds = ((u32, u32), (u32, u32));

fn span(items: impl Iterator<Item = Bounds>) -> Bounds {
    items
        .reduce(|(s0, e0), (s1, e1)| (s0.min(s1), e0.max(e1)))
        .unwrap_or(((0, 0), (0, 0)))
}

#[derive(Clone, Debug, PartialEq)]
enum Payload {
    Bed(String),
    Wig(f32),
}

/// One input row of a fixture file.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub chrom_id: u32,
    pub start: u32,
    pub end: u32,
    payload: Payload,
}
impl Row {
    /// A bigBed row; `rest` holds the BED columns after `end`, tab-separated.
    pub fn bed(chrom_id: u32, start: u32, end: u32, rest: &str) -> Self {
        Self {
            chrom_id,
            start,
            end,
            payload: Payload::Bed(rest.to_string()),
        }
    }

    /// A bigWig bedGraph item.
    pub fn wig(chrom_id: u32, start: u32, end: u32, value: f32) -> Self {
        Self {
            chrom_id,
            start,
            end,
            payload: Payload::Wig(value),
        }
    }

    pub fn rest(&self) -> &str {
        match &self.payload {
            Payload::Bed(rest) => rest,
            Payload::Wig(_) => "",
        }
    }

    pub fn value(&self) -> f32 {
        match &self.payload {
            Payload::Bed(rest) => rest
                .split('\t')
                .nth(1)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            Payload::Wig(value) => *value,
        }
    }

    fn name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Bed(rest) => rest.split('\t').next().filter(|n| !n.is_empty()),
            Payload::Wig(_) => None,
        }
    }
}

/// Location of one written data block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockSpan {
    pub offset: u64,
    pub size: u64,
}

/// Offsets of the sections of a built file.
#[derive(Clone, Debug, Default)]
pub struct Layout {
    pub blocks: Vec<BlockSpan>,
    pub chrom_tree_offset: u64,
    pub full_data_offset: u64,
    pub full_index_offset: u64,
    pub name_index_offset: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Bed,
    Wig,
}

/// Builder for a complete bigBed or bigWig file.
pub struct BbiBuilder {
    kind: Kind,
    chroms: Vec<(String, u32, u32)>,
    rows: Vec<Row>,
    endianness: Endianness,
    compressed: bool,
    items_per_block: usize,
    chrom_block_size: u32,
    rtree_fan_out: u32,
    zoom_levels: u16,
    summary: bool,
    name_index: bool,
    corrupt_data_index: bool,
    corrupt_chrom_tree: bool,
}
impl BbiBuilder {
    fn new(kind: Kind, chroms: Vec<(&str, u32, u32)>) -> Self {
        Self {
            kind,
            chroms: chroms
                .into_iter()
                .map(|(name, id, len)| (name.to_string(), id, len))
                .collect(),
            rows: Vec::new(),
            endianness: Endianness::Little,
            compressed: false,
            items_per_block: 64,
            chrom_block_size: 256,
            rtree_fan_out: 256,
            zoom_levels: 0,
            summary: false,
            name_index: false,
            corrupt_data_index: false,
            corrupt_chrom_tree: false,
        }
    }

    /// bigBed file over `(name, id, length)` chromosomes.
    pub fn bed(chroms: Vec<(&str, u32, u32)>) -> Self {
        Self::new(Kind::Bed, chroms)
    }

    /// bigWig file over `(name, id, length)` chromosomes.
    pub fn wig(chroms: Vec<(&str, u32, u32)>) -> Self {
        Self::new(Kind::Wig, chroms)
    }

    pub fn push(&mut self, row: Row) -> &mut Self {
        self.rows.push(row);
        self
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn endianness(&mut self, endianness: Endianness) -> &mut Self {
        self.endianness = endianness;
        self
    }

    pub fn compressed(&mut self, compressed: bool) -> &mut Self {
        self.compressed = compressed;
        self
    }

    pub fn items_per_block(&mut self, n: usize) -> &mut Self {
        self.items_per_block = n.max(1);
        self
    }

    pub fn chrom_block_size(&mut self, n: u32) -> &mut Self {
        self.chrom_block_size = n;
        self
    }

    pub fn rtree_fan_out(&mut self, n: u32) -> &mut Self {
        self.rtree_fan_out = n;
        self
    }

    pub fn zoom_levels(&mut self, n: u16) -> &mut Self {
        self.zoom_levels = n;
        self
    }

    pub fn summary(&mut self) -> &mut Self {
        self.summary = true;
        self
    }

    pub fn name_index(&mut self) -> &mut Self {
        self.name_index = true;
        self
    }

    pub fn corrupt_data_index(&mut self) -> &mut Self {
        self.corrupt_data_index = true;
        self
    }

    pub fn corrupt_chrom_tree(&mut self) -> &mut Self {
        self.corrupt_chrom_tree = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_with_layout().0
    }

    /// Rows grouped into blocks: sorted by position, split at chromosome
    /// changes and at `items_per_block`.
    fn blocks(&self) -> Vec<Vec<Row>> {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| (r.chrom_id, r.start, r.end));

        let mut blocks: Vec<Vec<Row>> = Vec::new();
        for row in rows {
            match blocks.last_mut() {
                Some(block)
                    if block.len() < self.items_per_block
                        && block[0].chrom_id == row.chrom_id =>
                {
                    block.push(row)
                }
                _ => blocks.push(vec![row]),
            }
        }
        blocks
    }

    fn encode_block(&self, rows: &[Row]) -> Vec<u8> {
        let mut w = ByteWriter::new(self.endianness);
        match self.kind {
            Kind::Bed => {
                for row in rows {
                    w.u32(row.chrom_id);
                    w.u32(row.start);
                    w.u32(row.end);
                    w.bytes(row.rest().as_bytes());
                    w.u8(0);
                }
            }
            Kind::Wig => {
                w.u32(rows[0].chrom_id);
                w.u32(rows[0].start);
                w.u32(rows.iter().map(|r| r.end).max().unwrap_or_default());
                w.u32(0);
                w.u32(0);
                w.u8(1);
                w.u8(0);
                w.u16(rows.len() as u16);
                for row in rows {
                    w.u32(row.start);
                    w.u32(row.end);
                    w.f32(row.value());
                }
            }
        }
        w.into_inner()
    }

    pub fn build_with_layout(&self) -> (Vec<u8>, Layout) {
        let e = self.endianness;
        let mut layout = Layout::default();
        let mut w = ByteWriter::new(e);
        w.zeros(MAIN_HEADER_SIZE as usize);

        for level in 0..self.zoom_levels {
            w.u32(10u32.pow(u32::from(level) + 1));
            w.u32(0);
            w.u64(0);
            w.u64(0);
        }

        let summary_offset = if self.summary {
            let at = w.len();
            let values = self.rows.iter().map(Row::value);
            w.u64(self.rows.iter().map(|r| u64::from(r.end - r.start)).sum());
            w.f64(values.clone().fold(f64::INFINITY, |m, v| m.min(f64::from(v))));
            w.f64(values.clone().fold(f64::NEG_INFINITY, |m, v| m.max(f64::from(v))));
            w.f64(values.clone().map(f64::from).sum());
            w.f64(values.map(|v| f64::from(v) * f64::from(v)).sum());
            at
        } else {
            0
        };

        let extension_offset = if self.name_index && self.kind == Kind::Bed {
            let at = w.len();
            w.u16(64);
            w.u16(1);
            w.u64(at + 64);
            w.zeros(52);
            w.u16(0);
            w.u16(1);
            w.u64(0); // patched once the index is written
            w.u32(0);
            w.u16(3);
            w.u16(0);
            at
        } else {
            0
        };

        layout.chrom_tree_offset = w.len();
        let mut chroms = self.chroms.clone();
        chroms.sort();
        let key_size = chroms.iter().map(|c| c.0.len()).max().unwrap_or(1) as u32;
        let items: Vec<_> = chroms
            .iter()
            .map(|(name, id, len)| {
                let mut value = ByteWriter::new(e);
                value.u32(*id);
                value.u32(*len);
                (name.as_bytes().to_vec(), value.into_inner())
            })
            .collect();
        write_bptree(&mut w, key_size, 8, self.chrom_block_size, &items);

        layout.full_data_offset = w.len();
        let blocks = self.blocks();
        w.u64(match self.kind {
            Kind::Bed => self.rows.len() as u64,
            Kind::Wig => blocks.len() as u64,
        });

        let mut entries = Vec::with_capacity(blocks.len());
        let mut names: Vec<(Vec<u8>, BlockSpan)> = Vec::new();
        let mut max_block = 0;
        for rows in &blocks {
            let plain = self.encode_block(rows);
            max_block = max_block.max(plain.len());
            let bytes = if self.compressed {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&plain).expect("in-memory write");
                encoder.finish().expect("in-memory write")
            } else {
                plain
            };

            let span = BlockSpan {
                offset: w.len(),
                size: bytes.len() as u64,
            };
            w.bytes(&bytes);
            layout.blocks.push(span);

            let chrom = rows[0].chrom_id;
            entries.push(LeafEntry {
                start: (chrom, rows.iter().map(|r| r.start).min().unwrap_or_default()),
                end: (chrom, rows.iter().map(|r| r.end).max().unwrap_or_default()),
                block: (span.offset, span.size),
            });
            names.extend(
                rows.iter()
                    .filter_map(Row::name)
                    .map(|name| (name.as_bytes().to_vec(), span)),
            );
        }

        layout.full_index_offset = w.len();
        write_rtree(&mut w, self.rtree_fan_out, &entries);

        if extension_offset > 0 {
            // the first block holding a name wins
            names.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.offset.cmp(&b.1.offset)));
            names.dedup_by(|later, first| later.0 == first.0);
            let key_size = names.iter().map(|n| n.0.len()).max().unwrap_or(1) as u32;
            let items: Vec<_> = names
                .iter()
                .map(|(name, span)| {
                    let mut value = ByteWriter::new(e);
                    value.u64(span.offset);
                    value.u64(span.size);
                    (name.clone(), value.into_inner())
                })
                .collect();

            let at = w.len();
            write_bptree(&mut w, key_size, 16, 4, &items);
            w.patch_u64(extension_offset + 64 + 4, at);
            layout.name_index_offset = Some(at);
        }

        if self.corrupt_data_index {
            w.patch_u32(layout.full_index_offset, 0);
        }
        if self.corrupt_chrom_tree {
            w.patch_u32(layout.chrom_tree_offset, 0);
        }

        let field_count = match self.kind {
            Kind::Bed => self
                .rows
                .first()
                .map_or(3, |r| 3 + r.rest().split('\t').count() as u16),
            Kind::Wig => 0,
        };

        let mut header = ByteWriter::new(e);
        header.u32(match self.kind {
            Kind::Bed => BIGBED_MAGIC,
            Kind::Wig => BIGWIG_MAGIC,
        });
        header.u16(4);
        header.u16(self.zoom_levels);
        header.u64(layout.chrom_tree_offset);
        header.u64(layout.full_data_offset);
        header.u64(layout.full_index_offset);
        header.u16(field_count);
        header.u16(field_count);
        header.u64(0);
        header.u64(summary_offset);
        header.u32(if self.compressed { max_block.max(1) as u32 } else { 0 });
        header.u64(extension_offset);

        let mut bytes = w.into_inner();
        bytes[..MAIN_HEADER_SIZE as usize].copy_from_slice(&header.into_inner());
        (bytes, layout)
    }
}
