pub mod catalog;
pub mod fetcher;
pub mod source;

pub use catalog::{CatalogError, EntityFilings, FilingsCatalog, Resolution};
pub use fetcher::{FetchOutcome, FilingFetcher, RetryPolicy, SkipReason};
pub use source::{DocumentSource, HttpDocumentSource, SourceError};
