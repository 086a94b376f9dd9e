//! The query engine over one open bbi file.
//!
//! A [`BbiReader`] reads the main header and the chromosome table once when it
//! is opened. Everything else (index nodes and data blocks) is read lazily for
//! each query and released as soon as the query's iterator moves past it.

use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use super::{ByteSource, MmapSource};
use crate::constructs::require_header;
use crate::decode::BlockDecoder;
use crate::index::{Block, ChromInfo, ChromTable, ChromTree, NameIndex, RTree};
use crate::{
    read_extra_indices, read_summary, read_zoom_headers, BbiError, BbiHeader, BedLayout,
    Endianness, FileKind, RangeQuery, Record, RecordFormat, Result, Summary, ZoomHeader,
};

/// BED column holding the feature name.
const NAME_COLUMN: u16 = 3;

/// Random-access reader for bigBed and bigWig files.
///
/// The reader owns its [`ByteSource`] and is `Send + Sync`, so one instance
/// can serve queries from many threads. Whether those reads run in parallel
/// depends on the source: [`MmapSource`] needs no lock, while a
/// [`SeekSource`](crate::SeekSource) serializes every read.
///
/// # Examples
///
/// ```rust,no_run
/// use bbix::{BbiReader, BedLayout, RecordFormat};
///
/// # fn main() -> bbix::Result<()> {
/// let reader = BbiReader::from_path("methylation.bb")?
///     .with_format(RecordFormat::Bed(BedLayout::methylation()));
///
/// for record in reader.query("chr11", 10_001_000, 10_002_000)? {
///     let record = record?;
///     println!(
///         "{}\t{}\t{}\t{}\t{:?}",
///         reader.chrom_name(record.chrom_id).unwrap_or("?"),
///         record.start,
///         record.end,
///         record.score,
///         record.count,
///     );
/// }
/// # Ok(())
/// # }
/// ```
///
/// Unknown chromosomes are not an error:
///
/// ```rust,no_run
/// use bbix::BbiReader;
///
/// # fn main() -> bbix::Result<()> {
/// let reader = BbiReader::from_path("signal.bw")?;
/// assert_eq!(reader.query("chrZZ", 0, 1_000)?.count(), 0);
/// # Ok(())
/// # }
/// ```
pub struct BbiReader<S: ByteSource> {
    /// Backing bytes of the file
    source: S,

    /// Main header, including the detected byte order
    header: BbiHeader,

    zoom_headers: Vec<ZoomHeader>,
    summary: Option<Summary>,

    /// Chromosome B+ tree, kept for on-disk name lookups
    chrom_tree: ChromTree,

    /// Id-keyed copy of the chromosome tree's entries
    chroms: ChromTable,

    /// Data block R-tree; absent when its magic is invalid
    data_index: Option<RTree>,

    /// bigBed name index, when the file carries one
    name_index: Option<NameIndex>,

    format: RecordFormat,
}
impl<S: ByteSource> BbiReader<S> {
    /// Opens a bigBed or bigWig file, detecting its type and byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The main header or the chromosome tree has an unrecognized magic
    ///   ([`BbiError::InvalidMagic`])
    /// - The chromosome tree is malformed or disagrees with the main header's
    ///   byte order ([`BbiError::StructuralCorruption`])
    /// - The source cannot be read
    pub fn open(source: S) -> Result<Self> {
        let header: BbiHeader = require_header(&source, 0)?;
        debug!(
            kind = ?header.kind,
            endianness = ?header.endianness,
            version = header.version,
            zoom_levels = header.zoom_levels,
            chrom_tree_offset = header.chrom_tree_offset,
            full_data_offset = header.full_data_offset,
            full_index_offset = header.full_index_offset,
            field_count = header.field_count,
            defined_field_count = header.defined_field_count,
            uncompress_buf_size = header.uncompress_buf_size,
            extension_offset = header.extension_offset,
            "read bbi header"
        );

        let zoom_headers = read_zoom_headers(&source, &header)?;
        let summary = read_summary(&source, &header)?;

        let chrom_tree = ChromTree::open(&source, header.chrom_tree_offset)?;
        same_byte_order(&header, chrom_tree.header().endianness, header.chrom_tree_offset)?;
        let chroms = ChromTable::new(header.chrom_tree_offset, chrom_tree.all(&source)?)?;
        debug!(count = chroms.len(), "read chromosome table");

        let data_index = RTree::open(&source, header.full_index_offset)?;
        match &data_index {
            Some(index) => {
                same_byte_order(&header, index.header().endianness, header.full_index_offset)?
            }
            None => warn!(
                offset = header.full_index_offset,
                "data index has an invalid magic; range queries will be empty"
            ),
        }

        let name_index = match header.kind {
            FileKind::BigBed => Self::open_name_index(&source, &header)?,
            FileKind::BigWig => None,
        };

        let format = match header.kind {
            FileKind::BigWig => RecordFormat::Wig,
            FileKind::BigBed => RecordFormat::Bed(BedLayout::standard()),
        };

        Ok(Self {
            source,
            header,
            zoom_headers,
            summary,
            chrom_tree,
            chroms,
            data_index,
            name_index,
            format,
        })
    }

    fn open_name_index(source: &S, header: &BbiHeader) -> Result<Option<NameIndex>> {
        let extras = read_extra_indices(source, header)?;
        let Some(extra) = extras
            .iter()
            .find(|extra| extra.field_ids.contains(&NAME_COLUMN))
        else {
            return Ok(None);
        };
        let index = NameIndex::open(source, extra.offset, NAME_COLUMN)?;
        if index.is_none() {
            debug!(offset = extra.offset, "name index tree has an invalid magic");
        }
        Ok(index)
    }

    /// Sets the record schema used to decode data blocks.
    ///
    /// bigWig files always decode as [`RecordFormat::Wig`] and bigBed files
    /// only accept [`RecordFormat::Bed`]; a mismatched format is ignored with
    /// a warning.
    pub fn with_format(mut self, format: RecordFormat) -> Self {
        match (self.header.kind, format) {
            (FileKind::BigBed, RecordFormat::Bed(_)) | (FileKind::BigWig, RecordFormat::Wig) => {
                self.format = format
            }
            (kind, format) => warn!(?kind, ?format, "ignoring record format for this file type"),
        }
        self
    }

    pub fn kind(&self) -> FileKind {
        self.header.kind
    }

    pub fn header(&self) -> &BbiHeader {
        &self.header
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn zoom_headers(&self) -> &[ZoomHeader] {
        &self.zoom_headers
    }

    /// Whole-file summary, when the file records one.
    pub fn summary(&self) -> Option<&Summary> {
        self.summary.as_ref()
    }

    /// All chromosomes, in name order.
    pub fn chroms(&self) -> &[ChromInfo] {
        self.chroms.as_slice()
    }

    /// Looks up a chromosome by exact name through the on-disk B+ tree.
    pub fn chrom(&self, name: &str) -> Result<Option<ChromInfo>> {
        self.chrom_tree.lookup(&self.source, name)
    }

    pub fn chrom_name(&self, id: u32) -> Option<&str> {
        self.chroms.get(id).map(|chrom| chrom.name.as_str())
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    fn decoder(&self) -> BlockDecoder<'_> {
        BlockDecoder::new(
            self.header.endianness,
            self.header.uncompress_buf_size,
            self.format,
            &self.chroms,
        )
    }

    /// Streams the records on `chrom` overlapping the half-open window
    /// `[start, end)`.
    ///
    /// The index is searched up front; data blocks are read and decoded one
    /// at a time as the returned iterator advances. Records come back in file
    /// order, which is ascending start order for a well-formed file.
    ///
    /// # Errors
    ///
    /// Returns [`BbiError::InvalidRange`] when `start > end`, or any error
    /// raised while walking the R-tree. Errors in individual data blocks are
    /// yielded by the iterator, after which it continues with the next block.
    pub fn query(&self, chrom: &str, start: u32, end: u32) -> Result<Records<'_, S>> {
        if start > end {
            return Err(BbiError::InvalidRange { start, end });
        }
        let Some(info) = self.chrom(chrom)? else {
            debug!(chrom, "unknown chromosome");
            return Ok(Records::new(self, 0, start, end, Vec::new()));
        };
        let blocks = match &self.data_index {
            Some(index) => index.find_blocks(&self.source, info.id, start, end)?,
            None => Vec::new(),
        };
        debug!(
            chrom,
            start,
            end,
            blocks = blocks.len(),
            "resolved query blocks"
        );
        Ok(Records::new(self, info.id, start, end, blocks))
    }

    /// Finds bigBed records by the value of their name column.
    ///
    /// Files without a name index (including every bigWig file) return an
    /// empty list.
    pub fn search_name(&self, name: &str) -> Result<Vec<Record>> {
        let Some(index) = &self.name_index else {
            debug!(name, "file has no name index");
            return Ok(Vec::new());
        };
        let Some(block) = index.find_block(&self.source, name)? else {
            return Ok(Vec::new());
        };
        let decoded = self.decoder().read(&self.source, block)?;
        Ok(decoded
            .records
            .into_iter()
            .filter(|record| record.bed_field(index.column()) == Some(name))
            .collect())
    }
}
impl<S: ByteSource> fmt::Debug for BbiReader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BbiReader")
            .field("header", &self.header)
            .field("chroms", &self.chroms.len())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
impl BbiReader<MmapSource> {
    /// Memory-maps and opens the file at `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(MmapSource::new(path)?)
    }
}

impl<S: ByteSource> RangeQuery for BbiReader<S> {
    type Records<'a> = Records<'a, S> where Self: 'a;

    fn query(&self, chrom: &str, start: u32, end: u32) -> Result<Self::Records<'_>> {
        BbiReader::query(self, chrom, start, end)
    }
}

fn same_byte_order(header: &BbiHeader, found: Endianness, offset: u64) -> Result<()> {
    if found == header.endianness {
        Ok(())
    } else {
        Err(BbiError::structural(
            offset,
            format!(
                "section is {found:?}-endian but the file is {:?}-endian",
                header.endianness
            ),
        ))
    }
}

/// Lazy iterator over the records of one query.
///
/// Holds the candidate blocks sorted by file offset and decodes one block at
/// a time. Records outside the query window or on other chromosomes are
/// dropped as they are decoded.
pub struct Records<'a, S: ByteSource> {
    reader: &'a BbiReader<S>,
    chrom_id: u32,
    start: u32,
    end: u32,

    /// Candidate blocks, ascending by offset
    blocks: Vec<Block>,

    /// Index of the next block to decode
    next_block: usize,

    /// Decoded records of the current block
    current: std::vec::IntoIter<Record>,

    /// Start of the last record handed out
    last_start: Option<u32>,
}
impl<'a, S: ByteSource> Records<'a, S> {
    fn new(
        reader: &'a BbiReader<S>,
        chrom_id: u32,
        start: u32,
        end: u32,
        blocks: Vec<Block>,
    ) -> Self {
        Self {
            reader,
            chrom_id,
            start,
            end,
            blocks,
            next_block: 0,
            current: Vec::new().into_iter(),
            last_start: None,
        }
    }

    /// Number of data blocks this query still has to decode.
    pub fn blocks_remaining(&self) -> usize {
        self.blocks.len() - self.next_block
    }
}
impl<S: ByteSource> Iterator for Records<'_, S> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                if record.chrom_id != self.chrom_id || !record.overlaps(self.start, self.end) {
                    continue;
                }
                if self.last_start.is_some_and(|last| record.start < last) {
                    warn!(
                        chrom_id = record.chrom_id,
                        start = record.start,
                        previous = self.last_start,
                        "record starts before its predecessor"
                    );
                }
                self.last_start = Some(record.start);
                return Some(Ok(record));
            }

            let block = *self.blocks.get(self.next_block)?;
            self.next_block += 1;
            match self.reader.decoder().read(&self.reader.source, block) {
                Ok(decoded) => self.current = decoded.records.into_iter(),
                Err(e) => {
                    warn!(offset = block.offset, error = %e, "failed to decode data block");
                    return Some(Err(e));
                }
            }
        }
    }
}
