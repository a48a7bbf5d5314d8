use inkforge_contracts::{ProviderConfig, ProviderKind};
use serde_json::{json, Map, Value};

use super::{parse_i64, PendingJob, PollStatus, PreparedRequest, ProviderAdapter, Submission};
use crate::error::{GenerationError, Result};
use crate::http::HttpTransport;
use crate::map_object;

const DEFAULT_MODEL: &str = "stability-ai/sdxl";

/// Pinned model versions for the models offered in the dialog.
const MODEL_VERSIONS: [(&str, &str); 3] = [
    (
        "stability-ai/sdxl",
        "da77bc59ee60423279fd632efb4795ab731d9e3ca9705ef3341091fb989b7eaf",
    ),
    (
        "black-forest-labs/flux-schnell",
        "f2ab8a5bfe79f02f0789a146cf5e73d2a4ff2684a98c2b303d1e1ff3814271db",
    ),
    (
        "black-forest-labs/flux-pro",
        "4f6c0f2a74f7f5e43c6e2e3e3f0e8b6d2a4c8f0e2b4a6c8d0e2f4a6b8c0d2e4f6",
    ),
];

pub(crate) fn model_version(model: &str) -> &'static str {
    let lookup = |name: &str| {
        MODEL_VERSIONS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, version)| *version)
    };
    lookup(model.trim())
        .or_else(|| lookup(DEFAULT_MODEL))
        .unwrap_or_default()
}

pub struct ReplicateAdapter {
    http: HttpTransport,
    config: &'static ProviderConfig,
}

impl ReplicateAdapter {
    pub fn new(http: HttpTransport) -> Self {
        Self {
            http,
            config: ProviderKind::Replicate.config(),
        }
    }

    fn status_of(&self, prediction: &Value) -> Result<Submission> {
        let status = prediction_status(prediction);
        match status.as_str() {
            "succeeded" => Ok(Submission::Ready(prediction.clone())),
            "failed" | "canceled" => Err(GenerationError::JobFailed {
                provider: self.kind(),
                message: prediction_error(prediction),
            }),
            _ => {
                let id = prediction
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        GenerationError::decode(self.kind(), "prediction response has no id")
                    })?;
                let poll_url = prediction
                    .pointer("/urls/get")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}/{id}", self.config.generate_endpoint));
                Ok(Submission::Pending(PendingJob {
                    id: id.to_string(),
                    poll_url,
                }))
            }
        }
    }
}

pub(crate) fn prediction_payload(prepared: &PreparedRequest, call: u32) -> Map<String, Value> {
    let request = &prepared.request;
    let mut input = map_object(json!({
        "prompt": request.prompt,
        "width": request.size.width,
        "height": request.size.height,
    }));
    let negative = request.negative_prompt.trim();
    if !negative.is_empty() {
        input.insert(
            "negative_prompt".to_string(),
            Value::String(negative.to_string()),
        );
    }
    if let Some(seed) = prepared.seed_for(call) {
        input.insert("seed".to_string(), Value::from(seed));
    }
    map_object(json!({
        "version": model_version(&prepared.model),
        "input": input,
    }))
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_error(prediction: &Value) -> String {
    prediction
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("prediction {}", prediction_status(prediction)))
}

/// Collects every http(s) URL from a prediction `output`, in order, without duplicates.
pub(crate) fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if trimmed.starts_with("http") && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_output_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

impl ProviderAdapter for ReplicateAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Replicate
    }

    fn calls_for(&self, prepared: &PreparedRequest) -> u32 {
        prepared.request.batch_count.max(1)
    }

    fn submit_generate(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let payload = Value::Object(prediction_payload(prepared, call));
        tracing::debug!(
            provider = "replicate",
            call,
            model = %prepared.model,
            "creating prediction"
        );
        let prediction = self.http.post_json_wait(
            self.kind(),
            self.config.generate_endpoint,
            prepared.api_key(),
            &payload,
        )?;
        self.status_of(&prediction)
    }

    fn poll_status(&self, prepared: &PreparedRequest, job: &PendingJob) -> Result<PollStatus> {
        let prediction = self
            .http
            .get_json(self.kind(), &job.poll_url, prepared.api_key())?;
        let status = match self.status_of(&prediction) {
            Ok(Submission::Ready(done)) => PollStatus::Succeeded(done),
            Ok(Submission::Pending(_)) => PollStatus::Pending,
            Err(GenerationError::JobFailed { message, .. }) => PollStatus::Failed(message),
            Err(err) => return Err(err),
        };
        Ok(status)
    }

    fn decode_result(&self, _prepared: &PreparedRequest, raw: &Value) -> Result<Vec<Vec<u8>>> {
        let mut urls = Vec::new();
        if let Some(output) = raw.get("output") {
            extract_output_urls(output, &mut urls);
        }
        if urls.is_empty() {
            return Err(GenerationError::decode(
                self.kind(),
                "prediction returned no image URLs",
            ));
        }
        urls.iter()
            .map(|url| self.http.download(self.kind(), url))
            .collect()
    }

    fn extract_seed(&self, prepared: &PreparedRequest, raw: &Value) -> Option<i64> {
        raw.pointer("/input/seed")
            .and_then(parse_i64)
            .or(prepared.request.seed)
    }
}
