//! Archive extraction and per-retailer record normalization.

mod extract;
mod normalize;

use std::path::Path;

use sepa_storage::FetchedArchive;

pub use extract::{
    chain_hint_from_name, extract_archive, ArchiveEntries, ExtractError, ExtractOptions,
    ExtractStats, RawFile,
};
pub use normalize::{
    is_plausible_barcode, FieldMapping, FileOutcome, FileRole, MappingTable, NormalizeError,
    NormalizeStats, Normalizer, RecordReader, RejectReason, RowOutcome, BARCODE_LENGTHS,
};

pub const CRATE_NAME: &str = "sepa-adapters";

/// Open a fetched archive under the retailer group its source was resolved with.
pub fn extract_fetched(
    fetched: &FetchedArchive,
    out_dir: &Path,
    options: ExtractOptions,
) -> Result<ArchiveEntries, ExtractError> {
    extract_archive(
        &fetched.path,
        fetched.source.retailer_group.clone(),
        out_dir,
        options,
    )
}
