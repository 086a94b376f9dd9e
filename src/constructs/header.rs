//! Fixed-size section headers and the byte-order-detecting header reader.
//!
//! Every indexed section of a bbi file starts with a magic number that is
//! written in the byte order of the machine that produced the file. Readers
//! compare the first four bytes against the magic in both orders and decode
//! the remaining fields accordingly.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use super::endian::{Endianness, FieldReader};
use crate::{BbiError, ByteSource, Result};

pub const BIGWIG_MAGIC: u32 = 0x888F_FC26;
pub const BIGBED_MAGIC: u32 = 0x8789_F2EB;
pub const BPLUS_TREE_MAGIC: u32 = 0x78CA_8C91;
pub const RTREE_MAGIC: u32 = 0x2468_ACE0;

pub const BBI_HEADER_SIZE: usize = 64;
pub const BPLUS_TREE_HEADER_SIZE: usize = size_of::<RawBPlusTreeHeader>();
pub const RTREE_HEADER_SIZE: usize = size_of::<RawRTreeHeader>();
pub const ZOOM_HEADER_SIZE: usize = size_of::<RawZoomHeader>();
pub const SUMMARY_SIZE: usize = size_of::<RawSummary>();
pub const EXTENSION_HEADER_SIZE: usize = 64;

/// A section header that begins with a magic number.
///
/// Implementors describe their fixed size and accepted magics; decoding is
/// only attempted once the byte order has been established.
pub trait SectionHeader: Sized {
    /// Human-readable section name used in diagnostics.
    const NAME: &'static str;

    /// Number of bytes occupied by the header on disk.
    const SIZE: usize;

    /// Accepted magic numbers, in canonical order.
    const MAGICS: &'static [u32];

    /// Decodes the header from exactly [`Self::SIZE`] bytes.
    fn decode(bytes: &[u8], offset: u64, endianness: Endianness) -> Option<Self>;
}

/// Reads a section header at `offset`.
///
/// Returns `Ok(None)` when the magic matches none of [`SectionHeader::MAGICS`]
/// in either byte order: an absent or malformed section is an expected
/// outcome that the caller must handle. I/O faults are returned as errors.
///
/// # Examples
///
/// ```rust
/// use bbix::{read_header, BPlusTreeHeader, SeekSource, BPLUS_TREE_MAGIC};
/// use std::io::Cursor;
///
/// # fn main() -> bbix::Result<()> {
/// let mut bytes = Vec::new();
/// bytes.extend_from_slice(&BPLUS_TREE_MAGIC.to_be_bytes());
/// for v in [256u32, 5, 8] {
///     bytes.extend_from_slice(&v.to_be_bytes());
/// }
/// bytes.extend_from_slice(&25u64.to_be_bytes());
/// bytes.extend_from_slice(&[0; 8]);
///
/// let source = SeekSource::new(Cursor::new(bytes));
/// let header: BPlusTreeHeader = read_header(&source, 0)?.expect("valid magic");
/// assert_eq!(header.block_size, 256);
/// assert_eq!(header.item_count, 25);
///
/// let garbage = SeekSource::new(Cursor::new(vec![0xAB; 32]));
/// assert!(read_header::<BPlusTreeHeader, _>(&garbage, 0)?.is_none());
/// # Ok(())
/// # }
/// ```
pub fn read_header<H, S>(source: &S, offset: u64) -> Result<Option<H>>
where
    H: SectionHeader,
    S: ByteSource + ?Sized,
{
    let mut bytes = vec![0u8; H::SIZE];
    source.read_exact_at(offset, &mut bytes)?;

    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let Some(endianness) = H::MAGICS
        .iter()
        .find_map(|&expected| Endianness::detect(magic, expected))
    else {
        debug!(
            section = H::NAME,
            offset,
            found = u32::from_le_bytes(magic),
            "section magic not recognized"
        );
        return Ok(None);
    };

    H::decode(&bytes, offset, endianness)
        .map(Some)
        .ok_or_else(|| BbiError::structural(offset, format!("short {} header", H::NAME)))
}

/// Reads a section header that the file cannot do without.
///
/// A magic mismatch becomes [`BbiError::InvalidMagic`].
pub(crate) fn require_header<H, S>(source: &S, offset: u64) -> Result<H>
where
    H: SectionHeader,
    S: ByteSource + ?Sized,
{
    if let Some(header) = read_header(source, offset)? {
        return Ok(header);
    }
    let mut magic = [0u8; 4];
    source.read_exact_at(offset, &mut magic)?;
    Err(BbiError::InvalidMagic {
        section: H::NAME,
        offset,
        expected: H::MAGICS[0],
        actual: u32::from_le_bytes(magic),
    })
}

/// The two flavours of bbi file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FileKind {
    BigWig,
    BigBed,
}

/// 64-byte main header at the start of every bbi file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BbiHeader {
    pub kind: FileKind,
    pub endianness: Endianness,
    pub version: u16,
    pub zoom_levels: u16,
    pub chrom_tree_offset: u64,
    pub full_data_offset: u64,
    pub full_index_offset: u64,
    pub field_count: u16,
    pub defined_field_count: u16,
    pub auto_sql_offset: u64,
    pub total_summary_offset: u64,
    /// Upper bound on an inflated data block; zero when blocks are stored raw.
    pub uncompress_buf_size: u32,
    pub extension_offset: u64,
}
impl BbiHeader {
    pub fn is_compressed(&self) -> bool {
        self.uncompress_buf_size > 0
    }
}
impl SectionHeader for BbiHeader {
    const NAME: &'static str = "bbi";
    const SIZE: usize = BBI_HEADER_SIZE;
    const MAGICS: &'static [u32] = &[BIGBED_MAGIC, BIGWIG_MAGIC];

    fn decode(bytes: &[u8], _offset: u64, endianness: Endianness) -> Option<Self> {
        let mut fields = FieldReader::new(bytes, endianness);
        let kind = match fields.u32()? {
            BIGWIG_MAGIC => FileKind::BigWig,
            BIGBED_MAGIC => FileKind::BigBed,
            _ => return None,
        };
        Some(Self {
            kind,
            endianness,
            version: fields.u16()?,
            zoom_levels: fields.u16()?,
            chrom_tree_offset: fields.u64()?,
            full_data_offset: fields.u64()?,
            full_index_offset: fields.u64()?,
            field_count: fields.u16()?,
            defined_field_count: fields.u16()?,
            auto_sql_offset: fields.u64()?,
            total_summary_offset: fields.u64()?,
            uncompress_buf_size: fields.u32()?,
            extension_offset: fields.u64()?,
        })
    }
}

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawBPlusTreeHeader {
    magic: u32,
    block_size: u32,
    key_size: u32,
    val_size: u32,
    item_count: u64,
    reserved: [u8; 8],
}

/// 32-byte B+ tree header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BPlusTreeHeader {
    /// File offset of the header itself.
    pub offset: u64,
    pub endianness: Endianness,
    /// Maximum number of items per node.
    pub block_size: u32,
    /// Width of every key, in bytes, including padding.
    pub key_size: u32,
    /// Width of every leaf value, in bytes.
    pub val_size: u32,
    pub item_count: u64,
    pub reserved: [u8; 8],
}
impl BPlusTreeHeader {
    /// Offset of the root node, which directly follows the header.
    pub fn root_offset(&self) -> u64 {
        self.offset + BPLUS_TREE_HEADER_SIZE as u64
    }
}
impl SectionHeader for BPlusTreeHeader {
    const NAME: &'static str = "B+ tree";
    const SIZE: usize = BPLUS_TREE_HEADER_SIZE;
    const MAGICS: &'static [u32] = &[BPLUS_TREE_MAGIC];

    fn decode(bytes: &[u8], offset: u64, endianness: Endianness) -> Option<Self> {
        let raw: RawBPlusTreeHeader = bytemuck::pod_read_unaligned(bytes.get(..Self::SIZE)?);
        Some(Self {
            offset,
            endianness,
            block_size: endianness.u32(raw.block_size),
            key_size: endianness.u32(raw.key_size),
            val_size: endianness.u32(raw.val_size),
            item_count: endianness.u64(raw.item_count),
            reserved: raw.reserved,
        })
    }
}

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawRTreeHeader {
    magic: u32,
    block_size: u32,
    item_count: u64,
    start_chrom_ix: u32,
    start_base: u32,
    end_chrom_ix: u32,
    end_base: u32,
    end_file_offset: u64,
    items_per_slot: u32,
    reserved: u32,
}

/// 48-byte R-tree (cir tree) header of the data index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RTreeHeader {
    pub offset: u64,
    pub endianness: Endianness,
    pub block_size: u32,
    pub item_count: u64,
    pub start_chrom_ix: u32,
    pub start_base: u32,
    pub end_chrom_ix: u32,
    pub end_base: u32,
    pub end_file_offset: u64,
    pub items_per_slot: u32,
}
impl RTreeHeader {
    pub fn root_offset(&self) -> u64 {
        self.offset + RTREE_HEADER_SIZE as u64
    }
}
impl SectionHeader for RTreeHeader {
    const NAME: &'static str = "R-tree";
    const SIZE: usize = RTREE_HEADER_SIZE;
    const MAGICS: &'static [u32] = &[RTREE_MAGIC];

    fn decode(bytes: &[u8], offset: u64, endianness: Endianness) -> Option<Self> {
        let raw: RawRTreeHeader = bytemuck::pod_read_unaligned(bytes.get(..Self::SIZE)?);
        Some(Self {
            offset,
            endianness,
            block_size: endianness.u32(raw.block_size),
            item_count: endianness.u64(raw.item_count),
            start_chrom_ix: endianness.u32(raw.start_chrom_ix),
            start_base: endianness.u32(raw.start_base),
            end_chrom_ix: endianness.u32(raw.end_chrom_ix),
            end_base: endianness.u32(raw.end_base),
            end_file_offset: endianness.u64(raw.end_file_offset),
            items_per_slot: endianness.u32(raw.items_per_slot),
        })
    }
}

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawZoomHeader {
    reduction_level: u32,
    reserved: u32,
    data_offset: u64,
    index_offset: u64,
}

/// Location of one precomputed zoom level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ZoomHeader {
    pub reduction_level: u32,
    pub data_offset: u64,
    pub index_offset: u64,
}

/// Reads the zoom headers that follow the main header.
pub fn read_zoom_headers<S: ByteSource + ?Sized>(
    source: &S,
    header: &BbiHeader,
) -> Result<Vec<ZoomHeader>> {
    let mut bytes = vec![0u8; header.zoom_levels as usize * ZOOM_HEADER_SIZE];
    source.read_exact_at(BBI_HEADER_SIZE as u64, &mut bytes)?;

    let e = header.endianness;
    Ok(bytes
        .chunks_exact(ZOOM_HEADER_SIZE)
        .map(|chunk| {
            let raw: RawZoomHeader = bytemuck::pod_read_unaligned(chunk);
            ZoomHeader {
                reduction_level: e.u32(raw.reduction_level),
                data_offset: e.u64(raw.data_offset),
                index_offset: e.u64(raw.index_offset),
            }
        })
        .collect())
}

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawSummary {
    bases_covered: u64,
    min_val: f64,
    max_val: f64,
    sum_data: f64,
    sum_squares: f64,
}

/// Whole-file summary statistics.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Summary {
    pub bases_covered: u64,
    pub min_val: f64,
    pub max_val: f64,
    pub sum_data: f64,
    pub sum_squares: f64,
}
impl Summary {
    pub fn mean(&self) -> f64 {
        if self.bases_covered == 0 {
            0.0
        } else {
            self.sum_data / self.bases_covered as f64
        }
    }

    /// Sample standard deviation over covered bases.
    pub fn std_dev(&self) -> f64 {
        if self.bases_covered <= 1 {
            return 0.0;
        }
        let n = self.bases_covered as f64;
        let var = (self.sum_squares - self.sum_data * self.sum_data / n) / (n - 1.0);
        var.max(0.0).sqrt()
    }
}

/// Reads the total summary, if the file records one.
pub fn read_summary<S: ByteSource + ?Sized>(
    source: &S,
    header: &BbiHeader,
) -> Result<Option<Summary>> {
    if header.total_summary_offset == 0 {
        return Ok(None);
    }
    let mut bytes = [0u8; SUMMARY_SIZE];
    source.read_exact_at(header.total_summary_offset, &mut bytes)?;

    let e = header.endianness;
    let raw: RawSummary = bytemuck::pod_read_unaligned(&bytes);
    Ok(Some(Summary {
        bases_covered: e.u64(raw.bases_covered),
        min_val: e.f64(raw.min_val),
        max_val: e.f64(raw.max_val),
        sum_data: e.f64(raw.sum_data),
        sum_squares: e.f64(raw.sum_squares),
    }))
}

/// bigBed extension header pointing at the extra (name) indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtensionHeader {
    pub size: u16,
    pub extra_index_count: u16,
    pub extra_index_list_offset: u64,
}

/// One entry of the extra-index list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraIndex {
    pub index_type: u16,
    /// File offset of the index's B+ tree header.
    pub offset: u64,
    /// BED columns covered by the index (3 is the name column).
    pub field_ids: Vec<u16>,
}

/// Reads the extension header and its extra-index list.
///
/// Files without an extension section yield an empty list.
pub fn read_extra_indices<S: ByteSource + ?Sized>(
    source: &S,
    header: &BbiHeader,
) -> Result<Vec<ExtraIndex>> {
    if header.extension_offset == 0 {
        return Ok(Vec::new());
    }
    let e = header.endianness;
    let at = header.extension_offset;

    let mut bytes = [0u8; EXTENSION_HEADER_SIZE];
    source.read_exact_at(at, &mut bytes)?;
    let mut fields = FieldReader::new(&bytes, e);
    let (Some(size), Some(extra_index_count), Some(extra_index_list_offset)) =
        (fields.u16(), fields.u16(), fields.u64())
    else {
        return Err(BbiError::structural(at, "short extension header"));
    };
    let extension = ExtensionHeader {
        size,
        extra_index_count,
        extra_index_list_offset,
    };
    debug!(?extension, "read extension header");

    let mut indices = Vec::with_capacity(extension.extra_index_count as usize);
    let mut at = extension.extra_index_list_offset;
    for _ in 0..extension.extra_index_count {
        let mut entry = [0u8; 16];
        source.read_exact_at(at, &mut entry)?;
        let mut fields = FieldReader::new(&entry, e);
        let (Some(index_type), Some(field_count), Some(offset)) =
            (fields.u16(), fields.u16(), fields.u64())
        else {
            return Err(BbiError::structural(at, "short extra index entry"));
        };
        at += entry.len() as u64;

        let mut ids = vec![0u8; field_count as usize * 4];
        source.read_exact_at(at, &mut ids)?;
        at += ids.len() as u64;
        let mut fields = FieldReader::new(&ids, e);
        let field_ids = (0..field_count)
            .filter_map(|_| {
                let id = fields.u16();
                fields.u16();
                id
            })
            .collect();

        indices.push(ExtraIndex {
            index_type,
            offset,
            field_ids,
        });
    }
    Ok(indices)
}
