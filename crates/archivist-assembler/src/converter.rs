use archivist_common::error::{ArchivistError, Result};
use archivist_source::SourceInstance;
use bytes::Bytes;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

/// Converts one source instance into the archive's target format.
pub trait InstanceConverter: Send + Sync {
    fn target_format(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    fn convert(&self, instance: &SourceInstance, data: Bytes) -> Result<Bytes>;
}

/// Emits DICOM Part 10 files. Input must already carry the 128 byte preamble
/// and `DICM` prefix; anything else is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct Part10Converter;

impl InstanceConverter for Part10Converter {
    fn target_format(&self) -> &'static str {
        "dicom-part10"
    }

    fn extension(&self) -> &'static str {
        "dcm"
    }

    fn convert(&self, instance: &SourceInstance, data: Bytes) -> Result<Bytes> {
        let header_len = PREAMBLE_LEN + MAGIC.len();
        if data.len() <= header_len {
            return Err(ArchivistError::Conversion {
                instance: instance.instance_id.clone(),
                reason: format!("file too short ({} bytes)", data.len()),
            });
        }
        if &data[PREAMBLE_LEN..header_len] != MAGIC {
            return Err(ArchivistError::Conversion {
                instance: instance.instance_id.clone(),
                reason: "missing DICM prefix".to_string(),
            });
        }
        Ok(data)
    }
}
