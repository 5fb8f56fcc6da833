pub mod http;
pub mod types;

pub use http::{HttpDatasetSource, SourceConfig};
pub use types::{DatasetSource, ExportStream, SourceInstance};
