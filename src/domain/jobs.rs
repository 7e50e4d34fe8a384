//! Validated inputs for a render job.

use std::fmt;

use slug::slugify;

use super::error::DomainError;

const MAX_RECORD_ID_LEN: usize = 64;
const MAX_LABEL_LEN: usize = 120;
const MAX_LABEL_SLUG_LEN: usize = 48;

/// Identifier of the record that receives the rendered file.
///
/// Record identifiers end up inside artifact file names and URLs, so only
/// ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId(String);

impl RecordId {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("recordId", "must not be empty"));
        }
        if trimmed.len() > MAX_RECORD_ID_LEN {
            return Err(DomainError::validation(
                "recordId",
                format!("must be at most {MAX_RECORD_ID_LEN} characters"),
            ));
        }
        if !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
        {
            return Err(DomainError::validation(
                "recordId",
                "may only contain ASCII letters, digits, `-` and `_`",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional classification attached to a job, e.g. a location name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLabel {
    raw: String,
    slug: String,
}

impl JobLabel {
    /// Returns `Ok(None)` for absent or blank labels.
    pub fn parse(value: Option<&str>) -> Result<Option<Self>, DomainError> {
        let Some(trimmed) = value.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };
        if trimmed.chars().count() > MAX_LABEL_LEN {
            return Err(DomainError::validation(
                "label",
                format!("must be at most {MAX_LABEL_LEN} characters"),
            ));
        }

        let mut slug = slugify(trimmed);
        slug.truncate(MAX_LABEL_SLUG_LEN);
        let slug = slug.trim_end_matches('-').to_string();
        if slug.is_empty() {
            return Err(DomainError::validation(
                "label",
                "must contain at least one letter or digit",
            ));
        }

        Ok(Some(Self {
            raw: trimmed.to_string(),
            slug,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// File-name-safe form of the label.
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

/// A submitted job after shape validation. Construction never touches any
/// shared resource.
#[derive(Debug, Clone)]
pub struct RenderJobInput {
    pub html: String,
    pub record_id: RecordId,
    pub label: Option<JobLabel>,
}

impl RenderJobInput {
    pub fn new(
        html: String,
        record_id: &str,
        label: Option<&str>,
        max_html_bytes: usize,
    ) -> Result<Self, DomainError> {
        if html.trim().is_empty() {
            return Err(DomainError::validation("htmlContent", "must not be empty"));
        }
        if html.len() > max_html_bytes {
            return Err(DomainError::validation(
                "htmlContent",
                format!("exceeds the {max_html_bytes} byte limit"),
            ));
        }

        Ok(Self {
            record_id: RecordId::parse(record_id)?,
            label: JobLabel::parse(label)?,
            html,
        })
    }
}
