//! crates/cv_pipeline_core/src/domain.rs
//!
//! Defines the pure, core data structures of the CV pipeline.
//! The `Document` record is the single source of truth a polling client
//! observes; `StructuredData` is the fixed-shape output of the analysis stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Document Status (state machine)
//=========================================================================================

/// The lifecycle state of a document run.
///
/// `uploading → extracting → processing → completed`, with `error` reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Extracting,
    Processing,
    Completed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
        }
    }

    /// `completed` and `error` end a run; nothing moves out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `extracting → extracting` is the per-page progress self-loop. A run
    /// resumed from an interrupted `extracting` document may also jump
    /// straight to `processing` once the stored text is long enough.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Uploading, Extracting) => true,
            (Extracting, Extracting) => true,
            (Extracting, Processing) => true,
            (Processing, Completed) => true,
            (current, Error) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted status string is not one of the known states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown document status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for DocumentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(DocumentStatus::Uploading),
            "extracting" => Ok(DocumentStatus::Extracting),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "error" => Ok(DocumentStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

//=========================================================================================
// Document
//=========================================================================================

/// A scanned CV under processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    /// Ordered page image references (page 1..N). Immutable after creation.
    pub page_image_refs: Vec<String>,
    pub aggregated_text: String,
    pub structured_data: Option<StructuredData>,
    pub status: DocumentStatus,
    /// 0-100, non-decreasing within a single run.
    pub progress: f64,
    pub error_message: Option<String>,
    /// The last page handled in the current run.
    #[serde(default)]
    pub page_cursor: PageCursor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly uploaded document, before any run has started.
    pub fn new(page_image_refs: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            page_image_refs,
            aggregated_text: String::new(),
            structured_data: None,
            status: DocumentStatus::Uploading,
            progress: 0.0,
            error_message: None,
            page_cursor: PageCursor::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Where page-by-page extraction stands: the last page handled (`0` before
/// the first) and the byte offset in `aggregated_text` where that page's
/// contribution begins. Pages must arrive as `page + 1`, or as `page` again
/// to replace the last one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCursor {
    pub page: usize,
    pub offset: usize,
}

impl PageCursor {
    pub fn new(page: usize, offset: usize) -> Self {
        Self { page, offset }
    }

    pub fn next_page(&self) -> usize {
        self.page + 1
    }
}

//=========================================================================================
// Structured Data (analysis output)
//=========================================================================================

/// The structured candidate record produced by the language model.
///
/// Missing optional values are always `None` (never `""` or `"null"`) and are
/// omitted when serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredData {
    pub personal_info: PersonalInfo,
    #[serde(default, deserialize_with = "text_or_empty")]
    pub summary: String,
    #[serde(default, deserialize_with = "list_or_empty")]
    pub experience: Vec<Experience>,
    #[serde(default, deserialize_with = "list_or_empty")]
    pub education: Vec<Education>,
    #[serde(default, deserialize_with = "text_list")]
    pub skills: Vec<String>,
    #[serde(default, deserialize_with = "list_or_empty")]
    pub languages: Vec<Language>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalInfo {
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(
        default,
        rename = "linkedIn",
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub linked_in: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experience {
    #[serde(default, deserialize_with = "text_or_empty")]
    pub company: String,
    #[serde(default, deserialize_with = "text_or_empty")]
    pub position: String,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "text_list", skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Education {
    #[serde(default, deserialize_with = "text_or_empty")]
    pub institution: String,
    #[serde(default, deserialize_with = "text_or_empty")]
    pub degree: String,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Language {
    #[serde(default, deserialize_with = "text_or_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl StructuredData {
    /// Drops blank entries and exact duplicates left behind by the model.
    ///
    /// Entries compare equal when their identifying fields match after
    /// lower-casing and whitespace collapsing. First occurrence wins, so
    /// source-document order is kept.
    pub fn deduplicated(mut self) -> Self {
        let mut seen = HashSet::new();
        self.experience.retain(|e| {
            let key = identity_key(&[
                Some(e.company.as_str()),
                Some(e.position.as_str()),
                e.start_date.as_deref(),
                e.end_date.as_deref(),
            ]);
            !(e.company.is_empty() && e.position.is_empty()) && seen.insert(key)
        });

        let mut seen = HashSet::new();
        self.education.retain(|e| {
            let key = identity_key(&[
                Some(e.institution.as_str()),
                Some(e.degree.as_str()),
                e.start_date.as_deref(),
                e.end_date.as_deref(),
            ]);
            !(e.institution.is_empty() && e.degree.is_empty()) && seen.insert(key)
        });

        let mut seen = HashSet::new();
        self.languages
            .retain(|l| !l.name.is_empty() && seen.insert(identity_key(&[Some(l.name.as_str())])));

        let mut seen = HashSet::new();
        self.skills
            .retain(|s| !s.is_empty() && seen.insert(identity_key(&[Some(s.as_str())])));

        self
    }
}

fn identity_key(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .map(|p| {
            p.unwrap_or_default()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

//=========================================================================================
// Lenient field decoding for model output
//=========================================================================================

/// Maps a loose JSON scalar to a cleaned string. Empty strings and the
/// literal `null` (any case) become `None`.
fn clean_scalar(value: serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(clean_scalar(serde_json::Value::deserialize(deserializer)?))
}

fn text_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(clean_scalar(serde_json::Value::deserialize(deserializer)?).unwrap_or_default())
}

fn text_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => Ok(items.into_iter().filter_map(clean_scalar).collect()),
        other => Ok(clean_scalar(other).into_iter().collect()),
    }
}

fn list_or_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
