use crate::{Record, Result};

/// Answers half-open range queries over one chromosome.
///
/// Implemented by [`BbiReader`](crate::BbiReader), which reads the file
/// directly, and by [`TileCache`](crate::TileCache), which wraps any other
/// implementation. Callers can therefore swap a cached source for an uncached
/// one without changing their code.
///
/// Queries for a chromosome the source does not know yield no records.
pub trait RangeQuery: Send + Sync {
    /// Iterator over the records of one query.
    type Records<'a>: Iterator<Item = Result<Record>>
    where
        Self: 'a;

    /// Streams every record on `chrom` overlapping `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`BbiError::InvalidRange`](crate::BbiError::InvalidRange) when
    /// `start > end`. Errors while walking the index surface here; errors
    /// confined to one data block surface as items of the iterator.
    fn query(&self, chrom: &str, start: u32, end: u32) -> Result<Self::Records<'_>>;
}

