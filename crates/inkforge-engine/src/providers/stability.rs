use inkforge_contracts::{ProviderConfig, ProviderKind};
use serde_json::{json, Value};

use super::{
    decode_base64, parse_i64, MultipartFields, PreparedRequest, ProviderAdapter, Submission,
    VARIATION_PROMPT, VARIATION_STRENGTH,
};
use crate::error::{GenerationError, Result};
use crate::http::HttpTransport;
use crate::trim_float;

pub struct StabilityAdapter {
    http: HttpTransport,
    config: &'static ProviderConfig,
}

impl StabilityAdapter {
    pub fn new(http: HttpTransport) -> Self {
        Self {
            http,
            config: ProviderKind::Stability.config(),
        }
    }

    fn endpoint(&self, template: Option<&'static str>, engine: &str) -> Result<String> {
        let template = template.ok_or_else(|| {
            GenerationError::Validation("Stability endpoint is not configured".to_string())
        })?;
        Ok(template.replace("{engine}", engine))
    }

    fn post_image_form(
        &self,
        prepared: &PreparedRequest,
        endpoint: &str,
        fields: MultipartFields,
        call: u32,
    ) -> Result<Submission> {
        tracing::debug!(
            provider = "stability",
            call,
            endpoint,
            payload = %fields.manifest(),
            "submitting image form"
        );
        self.http
            .post_multipart(self.kind(), endpoint, prepared.api_key(), fields.into_form()?)
            .map(Submission::Ready)
    }
}

/// Positive prompt with weight 1, negative prompt (when present) with weight -1.
fn text_prompts(prompt: &str, negative: &str) -> Vec<(String, f64)> {
    let mut prompts = vec![(prompt.to_string(), 1.0)];
    let negative = negative.trim();
    if !negative.is_empty() {
        prompts.push((negative.to_string(), -1.0));
    }
    prompts
}

pub(crate) fn text_to_image_payload(prepared: &PreparedRequest, call: u32) -> Value {
    let request = &prepared.request;
    let prompts: Vec<Value> = text_prompts(&request.prompt, &request.negative_prompt)
        .into_iter()
        .map(|(text, weight)| json!({"text": text, "weight": weight}))
        .collect();
    let mut payload = json!({
        "text_prompts": prompts,
        "cfg_scale": request.cfg_scale,
        "steps": request.steps,
        "width": request.size.width,
        "height": request.size.height,
        "samples": request.batch_count.max(1),
    });
    if let (Some(seed), Some(map)) = (prepared.seed_for(call), payload.as_object_mut()) {
        map.insert("seed".to_string(), Value::from(seed));
    }
    payload
}

fn common_fields(
    mut fields: MultipartFields,
    prepared: &PreparedRequest,
    prompt: &str,
    call: u32,
) -> MultipartFields {
    let request = &prepared.request;
    for (idx, (text, weight)) in text_prompts(prompt, &request.negative_prompt)
        .into_iter()
        .enumerate()
    {
        fields = fields
            .text(format!("text_prompts[{idx}][text]"), text)
            .text(format!("text_prompts[{idx}][weight]"), trim_float(weight));
    }
    fields = fields
        .text("cfg_scale", trim_float(request.cfg_scale))
        .text("steps", request.steps)
        .text("samples", request.batch_count.max(1));
    if let Some(seed) = prepared.seed_for(call) {
        fields = fields.text("seed", seed);
    }
    fields
}

/// `strength` is how far to move away from the source; Stability wants how much of it to keep.
pub(crate) fn image_to_image_fields(
    prepared: &PreparedRequest,
    prompt: &str,
    strength: f64,
    call: u32,
) -> Result<MultipartFields> {
    let source = prepared.require_source()?;
    let fields = MultipartFields::new()
        .png("init_image", "image.png", &source.png)
        .text("init_image_mode", "IMAGE_STRENGTH")
        .text("image_strength", trim_float(1.0 - strength.clamp(0.0, 1.0)));
    Ok(common_fields(fields, prepared, prompt, call))
}

pub(crate) fn masking_fields(prepared: &PreparedRequest, call: u32) -> Result<MultipartFields> {
    let source = prepared.require_source()?;
    let mask = prepared.require_mask()?;
    let fields = MultipartFields::new()
        .png("init_image", "image.png", &source.png)
        .png("mask_image", "mask.png", &mask.to_luma_png()?)
        .text("mask_source", "MASK_IMAGE_WHITE");
    Ok(common_fields(fields, prepared, &prepared.request.prompt, call))
}

impl ProviderAdapter for StabilityAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stability
    }

    fn submit_generate(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let endpoint = self.endpoint(Some(self.config.generate_endpoint), &prepared.model)?;
        let payload = text_to_image_payload(prepared, call);
        tracing::debug!(provider = "stability", call, endpoint = %endpoint, "submitting generation");
        self.http
            .post_json(self.kind(), &endpoint, prepared.api_key(), &payload)
            .map(Submission::Ready)
    }

    fn submit_edit(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let endpoint = self.endpoint(self.config.edit_endpoint, &prepared.model)?;
        self.post_image_form(prepared, &endpoint, masking_fields(prepared, call)?, call)
    }

    fn submit_variation(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let endpoint = self.endpoint(self.config.img2img_endpoint, &prepared.model)?;
        let fields = image_to_image_fields(prepared, VARIATION_PROMPT, VARIATION_STRENGTH, call)?;
        self.post_image_form(prepared, &endpoint, fields, call)
    }

    fn submit_img2img(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let endpoint = self.endpoint(self.config.img2img_endpoint, &prepared.model)?;
        let fields = image_to_image_fields(
            prepared,
            &prepared.request.prompt,
            prepared.request.img2img_strength,
            call,
        )?;
        self.post_image_form(prepared, &endpoint, fields, call)
    }

    fn decode_result(&self, _prepared: &PreparedRequest, raw: &Value) -> Result<Vec<Vec<u8>>> {
        let artifacts = raw
            .get("artifacts")
            .and_then(Value::as_array)
            .ok_or_else(|| GenerationError::decode(self.kind(), "response has no artifacts"))?;
        let images = artifacts
            .iter()
            .filter_map(|row| row.get("base64").and_then(Value::as_str))
            .map(|b64| decode_base64(self.kind(), b64))
            .collect::<Result<Vec<_>>>()?;
        if images.is_empty() {
            return Err(GenerationError::decode(
                self.kind(),
                "response returned no images",
            ));
        }
        Ok(images)
    }

    fn extract_seed(&self, prepared: &PreparedRequest, raw: &Value) -> Option<i64> {
        raw.pointer("/artifacts/0/seed")
            .and_then(parse_i64)
            .or(prepared.request.seed)
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

    fn prepared(mode: Mode) -> anyhow::Result<PreparedRequest> {
        let mut request = GenerationRequest::new(mode, ProviderKind::Stability, "a lighthouse");
        request.negative_prompt = "fog".to_string();
        request.size = ImageSize::new(1152, 896);
        request.seed = Some(1_234_567_890_123);
        let mut prepared = PreparedRequest::new(request, "stable-diffusion-xl-1024-v1-0");
        let source = rgba_png(&png_bytes(16, 16))?;
        prepared.mask = Some(MaskBuilder::build(MaskMode::Center, source.dimensions(), None)?);
        prepared.source = Some(source);
        Ok(prepared)
    }

    #[test]
    fn text_to_image_payload_round_trips_size_and_seed() -> anyhow::Result<()> {
        let payload = text_to_image_payload(&prepared(Mode::Generate)?, 0);
        let size = format!("{}x{}", payload["width"], payload["height"]);
        assert_eq!(size.parse::<ImageSize>().map_err(anyhow::Error::msg)?, ImageSize::new(1152, 896));
        assert_eq!(payload["seed"], json!(1_234_567_890_123_i64));
        assert_eq!(payload["text_prompts"][1], json!({"text": "fog", "weight": -1.0}));
        assert_eq!(payload["samples"], 1);
        Ok(())
    }

    #[test]
    fn img2img_inverts_strength() -> anyhow::Result<()> {
        let prepared = prepared(Mode::Img2Img)?;
        let fields = image_to_image_fields(&prepared, "a lighthouse", 0.75, 0)?;
        assert_eq!(fields.get_text("image_strength"), Some("0.25"));
        assert_eq!(fields.get_text("init_image_mode"), Some("IMAGE_STRENGTH"));
        assert_eq!(fields.get_text("text_prompts[1][weight]"), Some("-1"));
        assert_eq!(fields.get_text("seed"), Some("1234567890123"));
        Ok(())
    }

    #[test]
    fn variation_uses_fixed_prompt_and_strength() -> anyhow::Result<()> {
        let prepared = prepared(Mode::Variation)?;
        let fields = image_to_image_fields(&prepared, VARIATION_PROMPT, VARIATION_STRENGTH, 0)?;
        assert_eq!(fields.get_text("image_strength"), Some("0.7"));
        assert_eq!(
            fields.get_text("text_prompts[0][text]"),
            Some("same image with slight variations")
        );
        Ok(())
    }

    #[test]
    fn masking_sends_white_mask_source() -> anyhow::Result<()> {
        let fields = masking_fields(&prepared(Mode::Edit)?, 1)?;
        assert_eq!(fields.get_text("mask_source"), Some("MASK_IMAGE_WHITE"));
        assert!(fields.has_file("mask_image"));
        assert_eq!(fields.get_text("seed"), Some("1234567890124"));
        Ok(())
    }

    #[test]
    fn decodes_artifacts_and_reports_seed() -> anyhow::Result<()> {
        let adapter = StabilityAdapter::new(HttpTransport::new(&Config::default())?);
        let prepared = prepared(Mode::Generate)?;
        let image = png_bytes(2, 2);
        let raw = json!({"artifacts": [{"base64": BASE64.encode(&image), "seed": 99, "finishReason": "SUCCESS"}]});
        assert_eq!(adapter.decode_result(&prepared, &raw)?, vec![image]);
        assert_eq!(adapter.extract_seed(&prepared, &raw), Some(99));
        assert!(adapter.decode_result(&prepared, &json!({"artifacts": []})).is_err());
        Ok(())
    }
}
