use archivist_common::{time, types::DatasetRecord};
use chrono::{DateTime, Utc};
use uuid::Uuid;

const MAX_COMPONENT_LEN: usize = 64;

/// `{patient}_{study}_{YYYYMMDD}_{suffix}.zip`. The prefix is stable for a
/// dataset and day; the random suffix keeps names unique.
pub fn archive_file_name(dataset: &DatasetRecord, now: DateTime<Utc>) -> String {
    let patient = component(&dataset.patient_id, "unknown");
    let study = component(&dataset.study_instance_uid, &dataset.dataset_id);
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{patient}_{study}_{}_{}.zip",
        time::date_stamp(&now),
        &suffix[..8]
    )
}

pub fn archive_object_key(dataset_id: &str, file_name: &str) -> String {
    format!("{}/{file_name}", component(dataset_id, "dataset"))
}

pub(crate) fn component(value: &str, fallback: &str) -> String {
    let value = if value.trim().is_empty() { fallback } else { value.trim() };
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_COMPONENT_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}
