pub mod http;
pub mod traits;

pub use http::HttpDocumentSource;
pub use traits::{DocumentSource, SourceError};
