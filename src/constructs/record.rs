/// Strand of a feature, when the record format carries one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Strand {
    Forward,
    Reverse,
    #[default]
    None,
}
impl Strand {
    pub fn from_field(field: &str) -> Self {
        match field {
            "+" => Self::Forward,
            "-" => Self::Reverse,
            _ => Self::None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Forward => '+',
            Self::Reverse => '-',
            Self::None => '.',
        }
    }
}

/// A decoded interval with its value payload.
///
/// Coordinates are 0-based and half-open. Records are always handed out by
/// value; nothing returned to a caller borrows from reader or cache storage.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    pub chrom_id: u32,
    pub start: u32,
    pub end: u32,
    pub score: f32,
    pub strand: Strand,
    pub count: Option<u32>,
    /// BED columns after `end`, tab-separated. Empty for bigWig data.
    pub rest: String,
}
impl Record {
    /// A bare scored interval, as produced by bigWig sections.
    pub fn scored(chrom_id: u32, start: u32, end: u32, score: f32) -> Self {
        Self {
            chrom_id,
            start,
            end,
            score,
            strand: Strand::None,
            count: None,
            rest: String::new(),
        }
    }

    /// Whether the record intersects the half-open window `[start, end)`.
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start < end && self.end > start
    }

    /// Returns BED column `column` (0-based over the full BED row) when it
    /// lives in the trailing text.
    pub fn bed_field(&self, column: usize) -> Option<&str> {
        column
            .checked_sub(3)
            .and_then(|i| self.rest.split('\t').nth(i))
    }
}

/// Which BED columns carry the score, strand and count of a bigBed file.
///
/// Column numbers are 0-based over the full BED row, so the name column is 3.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BedLayout {
    pub score_column: Option<usize>,
    pub strand_column: Option<usize>,
    pub count_column: Option<usize>,
}
impl BedLayout {
    /// Plain BED6: score in column 4, strand in column 5.
    pub fn standard() -> Self {
        Self {
            score_column: Some(4),
            strand_column: Some(5),
            count_column: None,
        }
    }

    /// Methylation bigBed: percent methylated in column 6, read count in column 7.
    pub fn methylation() -> Self {
        Self {
            score_column: Some(6),
            strand_column: Some(5),
            count_column: Some(7),
        }
    }
}
impl Default for BedLayout {
    fn default() -> Self {
        Self::standard()
    }
}

/// Record schema of a file's data blocks.
///
/// The schema is not stored per record, so it is communicated out-of-band
/// when the reader is configured.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordFormat {
    /// bigWig sections (bedGraph, variableStep, fixedStep).
    Wig,
    /// bigBed rows interpreted through a column layout.
    Bed(BedLayout),
}
