pub mod error;
pub mod time;
pub mod types;

pub use error::{ArchivistError, Result};
pub use types::{
    ArchiveMetadata, ArchiveOutput, ArchiveRecord, ArchiveStatus, DatasetRecord, JobId,
};
