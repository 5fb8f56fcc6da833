pub mod assembler;
pub mod converter;
pub mod naming;
pub mod pipeline;

pub use assembler::{
    AssembledArchive, ArchiveAssembler, AssemblerConfig, AssemblyMode, ConversionFailure,
};
pub use converter::{InstanceConverter, Part10Converter};
pub use naming::{archive_file_name, archive_object_key};
pub use pipeline::ArchivePipeline;
