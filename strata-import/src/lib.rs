//! Legacy data import and the topic taxonomy cache.

pub mod legacy;
pub mod taxonomy;

pub use legacy::{run_import, ImportOptions, ImportReport, ImportSource};
pub use taxonomy::{Taxonomy, TaxonomyCache, TaxonomyOrigin, TaxonomySnapshot, TaxonomyTopic};
