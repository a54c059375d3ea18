use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum number of auxiliary (prop) images forwarded to the provider.
pub const MAX_PROP_IMAGES: usize = 3;

/// Lifecycle of a row in `jobs`. Mirrors the `job_status` Postgres enum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Snapshot of a `jobs` row as seen by the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub auth_user_id: Option<Uuid>,
    pub status: JobStatus,
    /// Raw column value; normalize with [`InputUrls::from_json`].
    pub input_urls: Value,
    pub output_urls: Option<Value>,
    pub error_msg: Option<String>,
    pub priority: i32,
    pub attempts: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical ordered list of input image references.
///
/// The first entry is the face photo; the next (up to three) are prop
/// images. Rows written by different versions of the web app store either a
/// JSON array or a JSON string holding a serialized array, so both collapse
/// to this one form here and nowhere else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputUrls(Vec<String>);

impl InputUrls {
    pub fn new(urls: Vec<String>) -> Self {
        Self(urls)
    }

    pub fn from_json(value: &Value) -> Result<Self, InputUrlsError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_owned)
                        .ok_or(InputUrlsError::NonStringEntry)
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self),
            Value::String(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(Self::default());
                }
                match serde_json::from_str::<Value>(text)? {
                    inner @ Value::Array(_) => Self::from_json(&inner),
                    _ => Err(InputUrlsError::NotASequence),
                }
            }
            _ => Err(InputUrlsError::NotASequence),
        }
    }

    /// The face photo, if any image was uploaded.
    pub fn main_image(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Entries 2..=4. Anything past the third prop is dropped.
    pub fn prop_images(&self) -> &[String] {
        match self.0.len() {
            0 | 1 => &[],
            n => &self.0[1..n.min(1 + MAX_PROP_IMAGES)],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InputUrlsError {
    #[error("input_urls is not a sequence")]
    NotASequence,

    #[error("input_urls contains a non-string entry")]
    NonStringEntry,

    #[error("input_urls text is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}
