pub mod local;
pub mod traits;
pub mod uploader;

pub use local::LocalObjectLayer;
pub use traits::{CompletePart, ObjectInfo, ObjectLayer, PutOptions, StorageClass};
pub use uploader::{ArchiveUploader, UploadedObject, UploaderConfig};
