use inkforge_contracts::{GenerationRequest, ImageSize, Mode, ProviderConfig, ProviderKind};
use serde_json::{json, Map, Value};

use super::{
    decode_base64, MultipartFields, PreparedRequest, ProviderAdapter, Submission,
};
use crate::error::{GenerationError, Result};
use crate::http::HttpTransport;
use crate::map_object;
use crate::source::{self, PreparedImage};

/// Edits and variations only exist for dall-e-2.
const EDIT_MODEL: &str = "dall-e-2";
const EDIT_SIDES: [u32; 3] = [256, 512, 1024];

pub struct OpenAiAdapter {
    http: HttpTransport,
    config: &'static ProviderConfig,
}

impl OpenAiAdapter {
    pub fn new(http: HttpTransport) -> Self {
        Self {
            http,
            config: ProviderKind::OpenAi.config(),
        }
    }

    fn edit_endpoint(&self) -> &'static str {
        self.config
            .edit_endpoint
            .unwrap_or("https://api.openai.com/v1/images/edits")
    }

    fn variation_endpoint(&self) -> &'static str {
        self.config
            .variation_endpoint
            .unwrap_or("https://api.openai.com/v1/images/variations")
    }
}

/// DALL-E has no negative prompt field, so the negative prompt becomes a hint.
pub(crate) fn build_prompt(request: &GenerationRequest) -> String {
    let negative = request.negative_prompt.trim();
    if negative.is_empty() {
        request.prompt.clone()
    } else {
        format!("{}. Avoid: {negative}", request.prompt)
    }
}

fn is_dalle3(model: &str) -> bool {
    model == "dall-e-3"
}

fn is_gpt_image(model: &str) -> bool {
    model.starts_with("gpt-image")
}

/// Square side for edit and variation uploads.
pub(crate) fn edit_side(size: ImageSize) -> u32 {
    if size.is_square() && EDIT_SIDES.contains(&size.width) {
        size.width
    } else {
        1024
    }
}

fn images_per_call(prepared: &PreparedRequest) -> u32 {
    if is_dalle3(&prepared.model) {
        1
    } else {
        prepared.request.batch_count.max(1)
    }
}

pub(crate) fn generation_payload(prepared: &PreparedRequest) -> Map<String, Value> {
    let request = &prepared.request;
    let mut payload = map_object(json!({
        "model": prepared.model,
        "prompt": build_prompt(request),
        "n": images_per_call(prepared),
        "size": request.size.to_string(),
    }));
    if !is_gpt_image(&prepared.model) {
        payload.insert(
            "response_format".to_string(),
            Value::String("b64_json".to_string()),
        );
    }
    if is_dalle3(&prepared.model) {
        payload.insert("quality".to_string(), Value::String(request.quality.clone()));
        payload.insert("style".to_string(), Value::String(request.style.clone()));
    }
    payload
}

pub(crate) fn edit_fields(prepared: &PreparedRequest) -> Result<MultipartFields> {
    let source = prepared.require_source()?;
    let mask = prepared.require_mask()?;
    let side = edit_side(prepared.request.size);
    Ok(MultipartFields::new()
        .png("image", "image.png", &source.png)
        .png("mask", "mask.png", &mask.to_alpha_png()?)
        .text("prompt", &prepared.request.prompt)
        .text("model", EDIT_MODEL)
        .text("n", prepared.request.batch_count.max(1))
        .text("size", format!("{side}x{side}"))
        .text("response_format", "b64_json"))
}

pub(crate) fn variation_fields(prepared: &PreparedRequest) -> Result<MultipartFields> {
    let source = prepared.require_source()?;
    let side = edit_side(prepared.request.size);
    Ok(MultipartFields::new()
        .png("image", "image.png", &source.png)
        .text("model", EDIT_MODEL)
        .text("n", prepared.request.batch_count.max(1))
        .text("size", format!("{side}x{side}"))
        .text("response_format", "b64_json"))
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn resolve_model(&self, mode: Mode, requested: &str) -> String {
        match mode {
            Mode::Edit | Mode::Variation => EDIT_MODEL.to_string(),
            _ => requested.to_string(),
        }
    }

    fn prepare_source(&self, request: &GenerationRequest, raw: &[u8]) -> Result<PreparedImage> {
        source::square_rgba_png(raw, edit_side(request.size))
    }

    fn calls_for(&self, prepared: &PreparedRequest) -> u32 {
        if is_dalle3(&prepared.model) && prepared.request.mode == Mode::Generate {
            prepared.request.batch_count.max(1)
        } else {
            1
        }
    }

    fn submit_generate(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let payload = Value::Object(generation_payload(prepared));
        tracing::debug!(
            provider = "openai",
            call,
            endpoint = self.config.generate_endpoint,
            model = %prepared.model,
            "submitting generation"
        );
        self.http
            .post_json(
                self.kind(),
                self.config.generate_endpoint,
                prepared.api_key(),
                &payload,
            )
            .map(Submission::Ready)
    }

    fn submit_edit(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let fields = edit_fields(prepared)?;
        tracing::debug!(provider = "openai", call, payload = %fields.manifest(), "submitting edit");
        self.http
            .post_multipart(
                self.kind(),
                self.edit_endpoint(),
                prepared.api_key(),
                fields.into_form()?,
            )
            .map(Submission::Ready)
    }

    fn submit_variation(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let fields = variation_fields(prepared)?;
        tracing::debug!(provider = "openai", call, payload = %fields.manifest(), "submitting variation");
        self.http
            .post_multipart(
                self.kind(),
                self.variation_endpoint(),
                prepared.api_key(),
                fields.into_form()?,
            )
            .map(Submission::Ready)
    }

    fn decode_result(&self, _prepared: &PreparedRequest, raw: &Value) -> Result<Vec<Vec<u8>>> {
        let rows = raw
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| GenerationError::decode(self.kind(), "response has no data array"))?;
        let mut images = Vec::new();
        for row in rows {
            if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                images.push(decode_base64(self.kind(), b64)?);
            } else if let Some(url) = row.get("url").and_then(Value::as_str) {
                images.push(self.http.download(self.kind(), url)?);
            }
        }
        if images.is_empty() {
            return Err(GenerationError::decode(
                self.kind(),
                "response returned no images",
            ));
        }
        Ok(images)
    }

    /// DALL-E does not report or accept seeds.
    fn extract_seed(&self, _prepared: &PreparedRequest, _raw: &Value) -> Option<i64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use inkforge_contracts::{Config, GenerationRequest, ImageSize, MaskMode, Mode, ProviderKind};
    use serde_json::json;

    use super::*;
    use crate::mask::MaskBuilder;
    use crate::providers::testing::png_bytes;
    use crate::source::rgba_png;

    fn adapter() -> anyhow::Result<OpenAiAdapter> {
        Ok(OpenAiAdapter::new(HttpTransport::new(&Config::default())?))
    }

    fn prepared(mode: Mode, model: &str) -> PreparedRequest {
        let mut request = GenerationRequest::new(mode, ProviderKind::OpenAi, "A red circle");
        request.size = ImageSize::new(1792, 1024);
        request.batch_count = 2;
        PreparedRequest::new(request, model)
    }

    #[test]
    fn dalle3_payload_carries_quality_style_and_single_image() {
        let mut prepared = prepared(Mode::Generate, "dall-e-3");
        prepared.request.negative_prompt = "blurry".to_string();
        prepared.request.quality = "hd".to_string();
        let payload = generation_payload(&prepared);
        assert_eq!(payload["n"], 1);
        assert_eq!(payload["size"], "1792x1024");
        assert_eq!(payload["quality"], "hd");
        assert_eq!(payload["style"], "vivid");
        assert_eq!(payload["prompt"], "A red circle. Avoid: blurry");
        assert_eq!(payload["response_format"], "b64_json");
    }

    #[test]
    fn dalle2_batches_in_one_call() -> anyhow::Result<()> {
        let prepared = prepared(Mode::Generate, "dall-e-2");
        let payload = generation_payload(&prepared);
        assert_eq!(payload["n"], 2);
        assert!(!payload.contains_key("quality"));
        assert_eq!(adapter()?.calls_for(&prepared), 1);
        assert_eq!(
            adapter()?.calls_for(&self::prepared(Mode::Generate, "dall-e-3")),
            2
        );
        Ok(())
    }

    #[test]
    fn gpt_image_payload_omits_response_format() {
        let payload = generation_payload(&prepared(Mode::Generate, "gpt-image-1"));
        assert!(!payload.contains_key("response_format"));
    }

    #[test]
    fn edit_forces_dalle2_and_square_size() -> anyhow::Result<()> {
        let adapter = adapter()?;
        assert_eq!(adapter.resolve_model(Mode::Edit, "dall-e-3"), "dall-e-2");
        assert_eq!(adapter.resolve_model(Mode::Generate, "dall-e-3"), "dall-e-3");
        assert_eq!(edit_side(ImageSize::new(512, 512)), 512);
        assert_eq!(edit_side(ImageSize::new(1792, 1024)), 1024);

        let mut prepared = prepared(Mode::Edit, "dall-e-2");
        let source = adapter.prepare_source(&prepared.request, &png_bytes(40, 20))?;
        assert_eq!(source.dimensions(), (1024, 1024));
        prepared.mask = Some(MaskBuilder::build(MaskMode::Center, source.dimensions(), None)?);
        prepared.source = Some(source);

        let fields = edit_fields(&prepared)?;
        assert_eq!(fields.get_text("model"), Some("dall-e-2"));
        assert_eq!(fields.get_text("size"), Some("1024x1024"));
        assert_eq!(fields.get_text("n"), Some("2"));
        assert!(fields.has_file("image"));
        assert!(fields.has_file("mask"));
        Ok(())
    }

    #[test]
    fn edit_without_source_is_rejected_before_network() {
        let prepared = prepared(Mode::Edit, "dall-e-2");
        assert!(matches!(
            edit_fields(&prepared),
            Err(GenerationError::Validation(_))
        ));
    }

    #[test]
    fn variation_fields_have_no_prompt() -> anyhow::Result<()> {
        let mut prepared = prepared(Mode::Variation, "dall-e-2");
        prepared.source = Some(rgba_png(&png_bytes(8, 8))?);
        let fields = variation_fields(&prepared)?;
        assert_eq!(fields.get_text("prompt"), None);
        assert_eq!(fields.get_text("response_format"), Some("b64_json"));
        Ok(())
    }

    #[test]
    fn decodes_base64_rows() -> anyhow::Result<()> {
        let adapter = adapter()?;
        let image = png_bytes(2, 2);
        let raw = json!({"data": [{"b64_json": BASE64.encode(&image)}, {"b64_json": BASE64.encode(&image)}]});
        let prepared = prepared(Mode::Generate, "dall-e-2");
        let images = adapter.decode_result(&prepared, &raw)?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], image);
        assert!(adapter.decode_result(&prepared, &json!({"data": []})).is_err());
        assert!(matches!(
            adapter.decode_result(&prepared, &json!({"data": [{"b64_json": "%%%"}]})),
            Err(GenerationError::Decode { .. })
        ));
        Ok(())
    }
}
