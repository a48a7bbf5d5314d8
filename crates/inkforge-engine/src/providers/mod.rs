//! Provider adapters: one per [`ProviderKind`], each translating a
//! [`PreparedRequest`] into that service's HTTP calls and back into image bytes.

mod local;
mod openai;
mod replicate;
mod stability;

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use inkforge_contracts::{GenerationRequest, Mode, ProviderKind};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use serde_json::{json, Value};

use crate::error::{GenerationError, Result};
use crate::http::HttpTransport;
use crate::mask::Mask;
use crate::source::{self, PreparedImage};

pub use local::LocalAdapter;
pub use openai::OpenAiAdapter;
pub use replicate::ReplicateAdapter;
pub use stability::StabilityAdapter;

/// Fixed prompt and strength used when a provider without a native variation
/// endpoint serves `variation` through img2img.
pub(crate) const VARIATION_PROMPT: &str = "same image with slight variations";
pub(crate) const VARIATION_STRENGTH: f64 = 0.3;

/// Everything an adapter needs for one dispatch. Built once, never mutated.
#[derive(Clone)]
pub struct PreparedRequest {
    pub request: GenerationRequest,
    /// Model the provider is actually called with.
    pub model: String,
    pub api_key: Option<String>,
    pub source: Option<PreparedImage>,
    pub mask: Option<Mask>,
}

impl fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("mode", &self.request.mode)
            .field("provider", &self.request.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .field("mask", &self.mask.as_ref().map(Mask::dimensions))
            .finish()
    }
}

impl PreparedRequest {
    pub fn new(request: GenerationRequest, model: impl Into<String>) -> Self {
        Self {
            request,
            model: model.into(),
            api_key: None,
            source: None,
            mask: None,
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Seed for the `call`-th submission of a batch; consecutive calls get consecutive seeds.
    pub fn seed_for(&self, call: u32) -> Option<i64> {
        self.request
            .seed
            .map(|seed| seed.saturating_add(i64::from(call)))
    }

    pub(crate) fn require_source(&self) -> Result<&PreparedImage> {
        self.source.as_ref().ok_or_else(|| {
            GenerationError::Validation(format!(
                "{} requests need a selected image",
                self.request.mode
            ))
        })
    }

    pub(crate) fn require_mask(&self) -> Result<&Mask> {
        self.mask
            .as_ref()
            .ok_or_else(|| GenerationError::Validation("edit requests need a mask".to_string()))
    }
}

/// Handle for a job the provider finishes asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub id: String,
    pub poll_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Ready(Value),
    Pending(PendingJob),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Succeeded(Value),
    Pending,
    Failed(String),
}

pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Model actually sent for `mode` when the user asked for `requested`.
    fn resolve_model(&self, _mode: Mode, requested: &str) -> String {
        requested.to_string()
    }

    fn prepare_source(&self, _request: &GenerationRequest, raw: &[u8]) -> Result<PreparedImage> {
        source::rgba_png(raw)
    }

    /// Number of submissions needed to produce `batch_count` images.
    fn calls_for(&self, _prepared: &PreparedRequest) -> u32 {
        1
    }

    fn submit_generate(&self, _prepared: &PreparedRequest, _call: u32) -> Result<Submission> {
        Err(self.unsupported(Mode::Generate))
    }

    fn submit_edit(&self, _prepared: &PreparedRequest, _call: u32) -> Result<Submission> {
        Err(self.unsupported(Mode::Edit))
    }

    fn submit_variation(&self, _prepared: &PreparedRequest, _call: u32) -> Result<Submission> {
        Err(self.unsupported(Mode::Variation))
    }

    fn submit_img2img(&self, _prepared: &PreparedRequest, _call: u32) -> Result<Submission> {
        Err(self.unsupported(Mode::Img2Img))
    }

    fn submit(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        match prepared.request.mode {
            Mode::Generate => self.submit_generate(prepared, call),
            Mode::Edit => self.submit_edit(prepared, call),
            Mode::Variation => self.submit_variation(prepared, call),
            Mode::Img2Img => self.submit_img2img(prepared, call),
        }
    }

    fn poll_status(&self, _prepared: &PreparedRequest, job: &PendingJob) -> Result<PollStatus> {
        Err(GenerationError::decode(
            self.kind(),
            format!("unexpected asynchronous job {}", job.id),
        ))
    }

    fn decode_result(&self, prepared: &PreparedRequest, raw: &Value) -> Result<Vec<Vec<u8>>>;

    fn extract_seed(&self, prepared: &PreparedRequest, _raw: &Value) -> Option<i64> {
        prepared.request.seed
    }

    fn unsupported(&self, mode: Mode) -> GenerationError {
        GenerationError::UnsupportedMode {
            provider: self.kind(),
            mode,
        }
    }
}

/// One adapter per provider kind. Registering a kind again replaces the previous adapter.
#[derive(Default)]
pub struct AdapterSet {
    adapters: BTreeMap<ProviderKind, Box<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(transport: HttpTransport) -> Self {
        let mut adapters = Self::new();
        adapters.register(OpenAiAdapter::new(transport.clone()));
        adapters.register(StabilityAdapter::new(transport.clone()));
        adapters.register(ReplicateAdapter::new(transport.clone()));
        adapters.register(LocalAdapter::new(transport));
        adapters
    }

    pub fn register<A: ProviderAdapter + 'static>(&mut self, adapter: A) {
        self.adapters.insert(adapter.kind(), Box::new(adapter));
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&dyn ProviderAdapter> {
        self.adapters.get(&kind).map(|adapter| adapter.as_ref())
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.adapters.keys().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FormValue {
    Text(String),
    Png { file_name: &'static str, bytes: Vec<u8> },
}

/// Ordered multipart fields. Kept inspectable so payloads can be logged and tested
/// before they become an opaque `reqwest` form.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MultipartFields {
    fields: Vec<(String, FormValue)>,
}

impl MultipartFields {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn text(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields
            .push((name.into(), FormValue::Text(value.to_string())));
        self
    }

    pub(crate) fn png(mut self, name: impl Into<String>, file_name: &'static str, bytes: &[u8]) -> Self {
        self.fields.push((
            name.into(),
            FormValue::Png {
                file_name,
                bytes: bytes.to_vec(),
            },
        ));
        self
    }

    pub(crate) fn get_text(&self, name: &str) -> Option<&str> {
        self.fields.iter().find_map(|(field, value)| match value {
            FormValue::Text(text) if field == name => Some(text.as_str()),
            _ => None,
        })
    }

    pub(crate) fn has_file(&self, name: &str) -> bool {
        self.fields
            .iter()
            .any(|(field, value)| field == name && matches!(value, FormValue::Png { .. }))
    }

    /// Text fields verbatim, files as name and size.
    pub(crate) fn manifest(&self) -> Value {
        Value::Array(
            self.fields
                .iter()
                .map(|(field, value)| match value {
                    FormValue::Text(text) => json!({"field": field, "value": text}),
                    FormValue::Png { file_name, bytes } => json!({
                        "field": field,
                        "file_name": file_name,
                        "bytes": bytes.len(),
                    }),
                })
                .collect(),
        )
    }

    pub(crate) fn into_form(self) -> Result<MultipartForm> {
        let mut form = MultipartForm::new();
        for (field, value) in self.fields {
            form = match value {
                FormValue::Text(text) => form.text(field, text),
                FormValue::Png { file_name, bytes } => {
                    let part = MultipartPart::bytes(bytes)
                        .file_name(file_name)
                        .mime_str("image/png")
                        .map_err(|err| {
                            GenerationError::Validation(format!("invalid multipart part: {err}"))
                        })?;
                    form.part(field, part)
                }
            };
        }
        Ok(form)
    }
}

pub(crate) fn decode_base64(provider: ProviderKind, raw: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(raw.trim().as_bytes())
        .map_err(|err| GenerationError::decode(provider, format!("image base64 decode failed: {err}")))
}

pub(crate) fn parse_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|raw| i64::try_from(raw).ok()))
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
}

/// Replaces long base64 strings so raw responses can be logged and kept for diagnostics.
pub fn redact_payloads(value: &Value) -> Value {
    const KEYS: [&str; 4] = ["b64_json", "base64", "images", "image"];
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let redacted = if KEYS.contains(&key.as_str()) {
                        redact_strings(item)
                    } else {
                        redact_payloads(item)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(rows) => Value::Array(rows.iter().map(redact_payloads).collect()),
        other => other.clone(),
    }
}

fn redact_strings(value: &Value) -> Value {
    match value {
        Value::String(text) if text.len() > 128 => {
            Value::String(format!("<{} base64 chars>", text.len()))
        }
        Value::Array(rows) => Value::Array(rows.iter().map(redact_strings).collect()),
        other => redact_payloads(other),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap_or_default();
        out
    }
}
