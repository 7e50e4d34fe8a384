//! Artifact metadata and file naming.

use std::path::PathBuf;

use time::OffsetDateTime;
use url::Url;

use super::jobs::{JobLabel, RecordId};

pub const ARTIFACT_EXTENSION: &str = "pdf";

/// A rendered PDF persisted in the serving directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub file_name: String,
    pub path: PathBuf,
    pub url: Url,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: OffsetDateTime,
    /// Set once deferred deletion has been armed.
    pub delete_after: Option<OffsetDateTime>,
}

/// Inputs that identify an artifact's owner.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactNaming<'a> {
    pub record_id: &'a RecordId,
    pub label: Option<&'a JobLabel>,
}

/// Build a unique file name for an artifact.
///
/// Names combine the record id, the label slug (when present), a
/// nanosecond-resolution UTC timestamp and a per-process sequence number, so
/// two jobs for the same record and label submitted within the same clock
/// tick still receive distinct names.
pub fn artifact_file_name(naming: ArtifactNaming<'_>, at: OffsetDateTime, sequence: u64) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    let stamp = format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}{:09}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.nanosecond()
    );

    match naming.label {
        Some(label) => format!(
            "{}-{}-{stamp}-{sequence:06}.{ARTIFACT_EXTENSION}",
            naming.record_id,
            label.slug()
        ),
        None => format!(
            "{}-{stamp}-{sequence:06}.{ARTIFACT_EXTENSION}",
            naming.record_id
        ),
    }
}

/// Whether `name` is a plain artifact file name (no separators, expected extension).
pub fn is_artifact_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        && !name.contains("..")
        && name
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext == ARTIFACT_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn name_includes_record_label_and_timestamp() {
        let record = RecordId::parse("rec1").expect("record");
        let label = JobLabel::parse(Some("North Depot"))
            .expect("label")
            .expect("present");
        let name = artifact_file_name(
            ArtifactNaming {
                record_id: &record,
                label: Some(&label),
            },
            datetime!(2026-03-04 05:06:07.123456789 UTC),
            7,
        );

        assert_eq!(name, "rec1-north-depot-20260304T050607123456789Z-000007.pdf");
        assert!(is_artifact_file_name(&name));
    }

    #[test]
    fn name_without_label_skips_segment() {
        let record = RecordId::parse("rec1").expect("record");
        let name = artifact_file_name(
            ArtifactNaming {
                record_id: &record,
                label: None,
            },
            datetime!(2026-03-04 05:06:07 +02:00),
            1,
        );

        assert_eq!(name, "rec1-20260304T030607000000000Z-000001.pdf");
    }

    #[test]
    fn same_instant_different_sequence_never_collides() {
        let record = RecordId::parse("rec1").expect("record");
        let at = datetime!(2026-03-04 05:06:07.5 UTC);
        let naming = ArtifactNaming {
            record_id: &record,
            label: None,
        };

        assert_ne!(
            artifact_file_name(naming, at, 1),
            artifact_file_name(naming, at, 2)
        );
    }

    #[test]
    fn traversal_and_foreign_names_are_not_artifacts() {
        assert!(!is_artifact_file_name("../secret.pdf"));
        assert!(!is_artifact_file_name("nested/file.pdf"));
        assert!(!is_artifact_file_name(".hidden.pdf"));
        assert!(!is_artifact_file_name("report.txt"));
        assert!(!is_artifact_file_name(".pdf"));
        assert!(is_artifact_file_name("rec1-20260304T030607000000000Z-000001.pdf"));
    }
}
