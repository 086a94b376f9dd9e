mod endian;
mod header;
mod record;

pub(crate) use endian::FieldReader;
pub use endian::Endianness;
pub(crate) use header::require_header;
pub use header::{
    read_extra_indices, read_header, read_summary, read_zoom_headers, BPlusTreeHeader, BbiHeader,
    ExtensionHeader, ExtraIndex, FileKind, RTreeHeader, SectionHeader, Summary, ZoomHeader,
    BBI_HEADER_SIZE, BIGBED_MAGIC, BIGWIG_MAGIC, BPLUS_TREE_HEADER_SIZE, BPLUS_TREE_MAGIC,
    RTREE_HEADER_SIZE, RTREE_MAGIC,
};
pub use record::{BedLayout, Record, RecordFormat, Strand};
