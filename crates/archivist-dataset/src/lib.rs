pub mod store;
pub mod tracker;

pub use store::{ArchiveUpdate, DatasetStore, JsonDatasetStore, MemoryDatasetStore};
pub use tracker::{CompletionOutcome, StatusTracker};
