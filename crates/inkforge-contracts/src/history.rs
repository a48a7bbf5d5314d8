use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::providers::ProviderKind;
use crate::request::{GenerationRequest, Mode};
use crate::store::{read_json_value, write_json_atomic, JsonReadError};

pub const HISTORY_FILENAME: &str = "ai_image_history.json";

/// One completed or failed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: String,
    pub mode: Mode,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub image_count: usize,
}

impl HistoryEntry {
    fn from_request(request: &GenerationRequest, model: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_utc_iso(),
            mode: request.mode,
            provider: request.provider,
            model,
            prompt: request.prompt.clone(),
            settings: request.settings_snapshot(),
            success: false,
            error_kind: None,
            error: None,
            image_count: 0,
        }
    }

    pub fn succeeded(request: &GenerationRequest, model_used: &str, image_count: usize) -> Self {
        Self {
            success: true,
            image_count,
            ..Self::from_request(request, Some(model_used.to_string()))
        }
    }

    pub fn failed(request: &GenerationRequest, error_kind: &str, message: String) -> Self {
        Self {
            error_kind: Some(error_kind.to_string()),
            error: Some(message),
            ..Self::from_request(request, request.model.clone())
        }
    }
}

/// Append-only JSON array of [`HistoryEntry`] rows.
///
/// Rows written by older plugin versions are kept verbatim; only new rows are
/// appended. A file that is not a JSON array is moved aside rather than
/// overwritten; a file that cannot be read at all is left in place.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        let mut rows = match read_json_value(&self.path) {
            Ok(Some(Value::Array(rows))) => rows,
            Ok(None) => Vec::new(),
            Err(err @ JsonReadError::Io { .. }) => return Err(err.into()),
            Ok(Some(_)) | Err(JsonReadError::Parse { .. }) => {
                let backup = self.quarantine()?;
                tracing::warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    "history file unreadable; moved aside and starting a new one"
                );
                Vec::new()
            }
        };
        rows.push(serde_json::to_value(entry)?);
        write_json_atomic(&self.path, &Value::Array(rows))
    }

    /// Entries in append order. Rows that do not match the current schema are skipped.
    pub fn entries(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        let rows = match read_json_value(&self.path)? {
            Some(Value::Array(rows)) => rows,
            Some(_) => anyhow::bail!("{} is not a JSON array", self.path.display()),
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect())
    }

    fn quarantine(&self) -> anyhow::Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or(HISTORY_FILENAME);
        let backup = self.path.with_file_name(format!(
            "{file_name}.corrupt-{}",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        std::fs::rename(&self.path, &backup)?;
        Ok(backup)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
