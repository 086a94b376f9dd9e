//! Data block decoding for bigBed rows and bigWig sections.
//!
//! A block is first inflated (when the file is compressed) and then walked
//! record by record. Problems confined to one record skip that record and
//! keep going; problems that leave the rest of the block unreadable fail the
//! whole block with [`BbiError::BlockCorruption`].

use std::io::Read;

use bytemuck::{Pod, Zeroable};
use flate2::read::ZlibDecoder;
use tracing::warn;

use crate::constructs::FieldReader;
use crate::index::{Block, ChromTable};
use crate::{BbiError, BedLayout, ByteSource, Endianness, Record, RecordFormat, Result, Strand};

/// Largest on-disk block the decoder will read.
const MAX_BLOCK_SIZE: u64 = 1 << 30;

const BED_FIXED_SIZE: usize = 12;

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RawWigSection {
    chrom_id: u32,
    start: u32,
    end: u32,
    item_step: u32,
    item_span: u32,
    kind: u8,
    reserved: u8,
    item_count: u16,
}

const WIG_SECTION_SIZE: usize = std::mem::size_of::<RawWigSection>();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WigKind {
    BedGraph,
    VariableStep,
    FixedStep,
}
impl WigKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::BedGraph),
            2 => Some(Self::VariableStep),
            3 => Some(Self::FixedStep),
            _ => None,
        }
    }

    fn item_size(self) -> usize {
        match self {
            Self::BedGraph => 12,
            Self::VariableStep => 8,
            Self::FixedStep => 4,
        }
    }
}

/// Records recovered from one block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedBlock {
    pub records: Vec<Record>,
    /// Number of records dropped as individually corrupt.
    pub skipped: usize,
}

/// Decodes blocks of one file.
#[derive(Copy, Clone, Debug)]
pub struct BlockDecoder<'a> {
    endianness: Endianness,
    uncompress_buf_size: u32,
    format: RecordFormat,
    chroms: &'a ChromTable,
}
impl<'a> BlockDecoder<'a> {
    pub fn new(
        endianness: Endianness,
        uncompress_buf_size: u32,
        format: RecordFormat,
        chroms: &'a ChromTable,
    ) -> Self {
        Self {
            endianness,
            uncompress_buf_size,
            format,
            chroms,
        }
    }

    /// Reads, inflates and decodes `block`.
    pub fn read<S: ByteSource + ?Sized>(&self, source: &S, block: Block) -> Result<DecodedBlock> {
        if block.size > MAX_BLOCK_SIZE {
            return Err(BbiError::block(
                block.offset,
                format!("block size {} is implausible", block.size),
            ));
        }
        let mut raw = vec![0u8; block.size as usize];
        source.read_exact_at(block.offset, &mut raw)?;

        if self.uncompress_buf_size > 0 {
            let data = inflate(&raw, block.offset, self.uncompress_buf_size as usize)?;
            self.decode(block.offset, &data)
        } else {
            self.decode(block.offset, &raw)
        }
    }

    /// Decodes an already inflated block located at `offset`.
    pub fn decode(&self, offset: u64, data: &[u8]) -> Result<DecodedBlock> {
        match self.format {
            RecordFormat::Bed(layout) => self.decode_bed(offset, data, layout),
            RecordFormat::Wig => self.decode_wig(offset, data),
        }
    }

    fn decode_bed(&self, offset: u64, data: &[u8], layout: BedLayout) -> Result<DecodedBlock> {
        let mut decoded = DecodedBlock::default();
        let mut fields = FieldReader::new(data, self.endianness);
        let mut previous = None;

        while fields.remaining() > 0 {
            let (Some(chrom_id), Some(start), Some(end)) =
                (fields.u32(), fields.u32(), fields.u32())
            else {
                return Err(BbiError::block(
                    offset,
                    format!("record shorter than {BED_FIXED_SIZE} bytes"),
                ));
            };
            let Some(text) = fields.cstr() else {
                return Err(BbiError::block(offset, "record text is not NUL-terminated"));
            };

            let record = self
                .check(previous, chrom_id, start, end)
                .and_then(|()| parse_bed(chrom_id, start, end, text, layout));
            match record {
                Ok(record) => {
                    previous = Some((chrom_id, start));
                    decoded.records.push(record)
                }
                Err(reason) => skip(&mut decoded, offset, chrom_id, start, &reason),
            }
        }
        Ok(decoded)
    }

    fn decode_wig(&self, offset: u64, data: &[u8]) -> Result<DecodedBlock> {
        let e = self.endianness;
        let mut decoded = DecodedBlock::default();
        let mut fields = FieldReader::new(data, e);
        let mut previous = None;

        while fields.remaining() > 0 {
            let Some(head) = fields.bytes(WIG_SECTION_SIZE) else {
                return Err(BbiError::block(offset, "short wig section header"));
            };
            let raw: RawWigSection = bytemuck::pod_read_unaligned(head);
            let chrom_id = e.u32(raw.chrom_id);
            let section_start = e.u32(raw.start);
            let step = e.u32(raw.item_step);
            let span = e.u32(raw.item_span);
            let count = e.u16(raw.item_count) as usize;

            let Some(kind) = WigKind::from_code(raw.kind) else {
                return Err(BbiError::block(
                    offset,
                    format!("unknown wig section type {}", raw.kind),
                ));
            };
            let Some(items) = fields.bytes(count * kind.item_size()) else {
                return Err(BbiError::block(
                    offset,
                    format!("wig section of {count} items overruns the block"),
                ));
            };

            let mut items = FieldReader::new(items, e);
            for i in 0..count {
                // item widths were bounds-checked above
                let (start, end, value) = match kind {
                    WigKind::BedGraph => {
                        let start = items.u32().unwrap_or_default();
                        let end = items.u32().unwrap_or_default();
                        (Some(start), Some(end), items.f32().unwrap_or_default())
                    }
                    WigKind::VariableStep => {
                        let start = items.u32().unwrap_or_default();
                        (Some(start), start.checked_add(span), items.f32().unwrap_or_default())
                    }
                    WigKind::FixedStep => {
                        let start = (i as u32)
                            .checked_mul(step)
                            .and_then(|d| section_start.checked_add(d));
                        let end = start.and_then(|s| s.checked_add(span));
                        (start, end, items.f32().unwrap_or_default())
                    }
                };

                let (Some(start), Some(end)) = (start, end) else {
                    skip(&mut decoded, offset, chrom_id, section_start, "coordinate overflow");
                    continue;
                };
                match self.check(previous, chrom_id, start, end) {
                    Ok(()) => {
                        previous = Some((chrom_id, start));
                        decoded
                            .records
                            .push(Record::scored(chrom_id, start, end, value))
                    }
                    Err(reason) => skip(&mut decoded, offset, chrom_id, start, &reason),
                }
            }
        }
        Ok(decoded)
    }

    /// Validates one record's coordinates against the last accepted record
    /// of the block and the chromosome table.
    fn check(
        &self,
        previous: Option<(u32, u32)>,
        chrom_id: u32,
        start: u32,
        end: u32,
    ) -> std::result::Result<(), String> {
        if end < start {
            return Err(format!("end {end} before start {start}"));
        }
        let Some(chrom) = self.chroms.get(chrom_id) else {
            return Err(format!("unknown chromosome id {chrom_id}"));
        };
        if previous.is_some_and(|prev| prev > (chrom_id, start)) {
            return Err("start goes backwards within the block".to_string());
        }
        if end > chrom.length {
            return Err(format!(
                "end {end} past the end of {} ({})",
                chrom.name, chrom.length
            ));
        }
        Ok(())
    }
}

fn skip(decoded: &mut DecodedBlock, offset: u64, chrom_id: u32, start: u32, reason: &str) {
    warn!(block = offset, chrom_id, start, reason, "skipping corrupt record");
    decoded.skipped += 1;
}

fn parse_bed(
    chrom_id: u32,
    start: u32,
    end: u32,
    text: &[u8],
    layout: BedLayout,
) -> std::result::Result<Record, String> {
    let rest = std::str::from_utf8(text).map_err(|_| "record text is not UTF-8".to_string())?;
    let mut record = Record::scored(chrom_id, start, end, 0.0);
    record.rest = rest.to_owned();

    let column = |column: Option<usize>| {
        column
            .and_then(|c| record.bed_field(c))
            .filter(|field| !field.is_empty() && *field != ".")
    };
    let score = column(layout.score_column)
        .map(|field| field.parse::<f32>().map_err(|_| format!("bad score {field:?}")))
        .transpose()?;
    let strand = column(layout.strand_column).map(Strand::from_field);
    let count = column(layout.count_column)
        .map(|field| field.parse::<u32>().map_err(|_| format!("bad count {field:?}")))
        .transpose()?;

    record.score = score.unwrap_or_default();
    record.strand = strand.unwrap_or_default();
    record.count = count;
    Ok(record)
}

/// Inflates a zlib block, refusing to grow past `limit` bytes.
fn inflate(raw: &[u8], offset: u64, limit: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(limit.min(raw.len() * 4));
    ZlibDecoder::new(raw)
        .take(limit as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| BbiError::block(offset, format!("zlib: {e}")))?;
    if data.len() > limit {
        return Err(BbiError::block(
            offset,
            format!("block inflates past {limit} bytes"),
        ));
    }
    Ok(data)
}
