//! Polarity-specific reference libraries.
//!
//! A [`ReferenceCatalog`] is filtered down to the entries whose precursor is
//! within tolerance of a precursor observed somewhere in the batch, and the
//! survivors are indexed once per resolution tier.
mod builder;
mod cache;
mod catalog;
mod index;
mod neighbors;

pub use builder::{build_reference_library, LibraryBuilder, ReferenceLibrary, TierRequest};
pub use cache::{IndexCache, LibraryKey};
pub use catalog::{
    open_catalog, EntryKey, MSPCatalog, MoleculeMetadata, PrecursorEntry, ReferenceCatalog,
    ReferenceRecord, ReferenceSpectrum,
};
pub use index::{QuerySpectrum, ReferenceIndex, SpectrumHit};
pub use neighbors::{
    filter_by_nearest_query, nearest_index, ppm_error, prepare_query_masses, NeighborMatch,
};
