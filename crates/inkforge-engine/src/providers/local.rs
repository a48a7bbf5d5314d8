use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use inkforge_contracts::{ProviderConfig, ProviderKind};
use serde_json::{json, Map, Value};

use super::{
    decode_base64, parse_i64, PreparedRequest, ProviderAdapter, Submission, VARIATION_PROMPT,
    VARIATION_STRENGTH,
};
use crate::error::{GenerationError, Result};
use crate::http::HttpTransport;
use crate::map_object;

const SAMPLER: &str = "DPM++ 2M Karras";
const TXT2IMG_PATH: &str = "/sdapi/v1/txt2img";
const IMG2IMG_PATH: &str = "/sdapi/v1/img2img";

/// Automatic1111-compatible server, usually on the same machine.
pub struct LocalAdapter {
    http: HttpTransport,
    config: &'static ProviderConfig,
}

impl LocalAdapter {
    pub fn new(http: HttpTransport) -> Self {
        Self {
            http,
            config: ProviderKind::Local.config(),
        }
    }

    fn post(
        &self,
        prepared: &PreparedRequest,
        path: &str,
        payload: Map<String, Value>,
        call: u32,
    ) -> Result<Submission> {
        let endpoint = format!("{}{path}", base_url(prepared, self.config));
        tracing::debug!(provider = "local", call, endpoint = %endpoint, "submitting");
        self.http
            .post_json(self.kind(), &endpoint, None, &Value::Object(payload))
            .map(Submission::Ready)
    }
}

/// Server root from the request override or the built-in endpoint. Accepts a full
/// `/sdapi/...` URL as well as a bare host.
pub(crate) fn base_url(prepared: &PreparedRequest, config: &ProviderConfig) -> String {
    let raw = prepared
        .request
        .api_endpoint
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(config.generate_endpoint);
    let root = raw.split("/sdapi/").next().unwrap_or(raw);
    root.trim_end_matches('/').to_string()
}

fn common_payload(prepared: &PreparedRequest, prompt: &str, call: u32) -> Map<String, Value> {
    let request = &prepared.request;
    map_object(json!({
        "prompt": prompt,
        "negative_prompt": request.negative_prompt.trim(),
        "steps": request.steps,
        "cfg_scale": request.cfg_scale,
        "sampler_name": SAMPLER,
        "batch_size": request.batch_count.max(1),
        "seed": prepared.seed_for(call).unwrap_or(-1),
    }))
}

pub(crate) fn txt2img_payload(prepared: &PreparedRequest, call: u32) -> Map<String, Value> {
    let mut payload = common_payload(prepared, &prepared.request.prompt, call);
    payload.insert("width".to_string(), Value::from(prepared.request.size.width));
    payload.insert("height".to_string(), Value::from(prepared.request.size.height));
    payload
}

pub(crate) fn img2img_payload(
    prepared: &PreparedRequest,
    prompt: &str,
    strength: f64,
    call: u32,
) -> Result<Map<String, Value>> {
    let source = prepared.require_source()?;
    let mut payload = common_payload(prepared, prompt, call);
    payload.insert(
        "init_images".to_string(),
        json!([BASE64.encode(&source.png)]),
    );
    payload.insert(
        "denoising_strength".to_string(),
        Value::from(strength.clamp(0.0, 1.0)),
    );
    payload.insert("width".to_string(), Value::from(prepared.request.size.width));
    payload.insert("height".to_string(), Value::from(prepared.request.size.height));
    Ok(payload)
}

pub(crate) fn inpaint_payload(prepared: &PreparedRequest, call: u32) -> Result<Map<String, Value>> {
    let source = prepared.require_source()?;
    let mask = prepared.require_mask()?;
    let mut payload = img2img_payload(
        prepared,
        &prepared.request.prompt,
        prepared.request.img2img_strength,
        call,
    )?;
    payload.insert(
        "mask".to_string(),
        Value::String(BASE64.encode(mask.to_luma_png()?)),
    );
    payload.insert("inpainting_fill".to_string(), Value::from(1));
    payload.insert("inpaint_full_res".to_string(), Value::Bool(true));
    payload.insert("width".to_string(), Value::from(source.width));
    payload.insert("height".to_string(), Value::from(source.height));
    Ok(payload)
}

impl ProviderAdapter for LocalAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn submit_generate(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        self.post(prepared, TXT2IMG_PATH, txt2img_payload(prepared, call), call)
    }

    fn submit_edit(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        self.post(prepared, IMG2IMG_PATH, inpaint_payload(prepared, call)?, call)
    }

    fn submit_variation(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let payload = img2img_payload(prepared, VARIATION_PROMPT, VARIATION_STRENGTH, call)?;
        self.post(prepared, IMG2IMG_PATH, payload, call)
    }

    fn submit_img2img(&self, prepared: &PreparedRequest, call: u32) -> Result<Submission> {
        let payload = img2img_payload(
            prepared,
            &prepared.request.prompt,
            prepared.request.img2img_strength,
            call,
        )?;
        self.post(prepared, IMG2IMG_PATH, payload, call)
    }

    fn decode_result(&self, _prepared: &PreparedRequest, raw: &Value) -> Result<Vec<Vec<u8>>> {
        let rows = raw
            .get("images")
            .and_then(Value::as_array)
            .ok_or_else(|| GenerationError::decode(self.kind(), "response has no images array"))?;
        let images = rows
            .iter()
            .filter_map(Value::as_str)
            .map(|encoded| {
                let payload = encoded.split_once(',').map(|(_, data)| data).unwrap_or(encoded);
                decode_base64(self.kind(), payload)
            })
            .collect::<Result<Vec<_>>>()?;
        if images.is_empty() {
            return Err(GenerationError::decode(
                self.kind(),
                "response returned no images",
            ));
        }
        Ok(images)
    }

    /// The server reports generation parameters as a JSON string in `info`.
    fn extract_seed(&self, prepared: &PreparedRequest, raw: &Value) -> Option<i64> {
        raw.get("info")
            .and_then(Value::as_str)
            .and_then(|info| serde_json::from_str::<Value>(info).ok())
            .and_then(|info| info.get("seed").and_then(parse_i64))
            .or(prepared.request.seed)
    }
}

#[cfg(test)]
mod tests {
    use inkforge_contracts::{Config, GenerationRequest, ImageSize, MaskMode, Mode, ProviderKind};
    use serde_json::json;

    use super::*;
    use crate::mask::MaskBuilder;
    use crate::providers::testing::png_bytes;
    use crate::source::rgba_png;

    fn prepared(mode: Mode) -> anyhow::Result<PreparedRequest> {
        let mut request = GenerationRequest::new(mode, ProviderKind::Local, "a forest");
        request.size = ImageSize::new(768, 512);
        let mut prepared = PreparedRequest::new(request, "default");
        let source = rgba_png(&png_bytes(32, 24))?;
        prepared.mask = Some(MaskBuilder::build(MaskMode::LeftHalf, source.dimensions(), None)?);
        prepared.source = Some(source);
        Ok(prepared)
    }

    #[test]
    fn base_url_accepts_hosts_and_full_endpoints() -> anyhow::Result<()> {
        let mut prepared = prepared(Mode::Generate)?;
        let config = ProviderKind::Local.config();
        assert_eq!(base_url(&prepared, config), "http://127.0.0.1:7860");
        prepared.request.api_endpoint = Some("http://gpu-box:7861/".to_string());
        assert_eq!(base_url(&prepared, config), "http://gpu-box:7861");
        prepared.request.api_endpoint = Some("http://gpu-box:7861/sdapi/v1/txt2img".to_string());
        assert_eq!(base_url(&prepared, config), "http://gpu-box:7861");
        Ok(())
    }

    #[test]
    fn txt2img_uses_random_seed_marker_and_sampler() -> anyhow::Result<()> {
        let payload = txt2img_payload(&prepared(Mode::Generate)?, 0);
        assert_eq!(payload["seed"], -1);
        assert_eq!(payload["sampler_name"], "DPM++ 2M Karras");
        let size = format!("{}x{}", payload["width"], payload["height"]);
        assert_eq!(size.parse::<ImageSize>().map_err(anyhow::Error::msg)?, ImageSize::new(768, 512));
        Ok(())
    }

    #[test]
    fn inpaint_payload_carries_mask_and_fill_settings() -> anyhow::Result<()> {
        let mut prepared = prepared(Mode::Edit)?;
        prepared.request.seed = Some(1_234_567_890_123);
        let payload = inpaint_payload(&prepared, 0)?;
        assert_eq!(payload["inpainting_fill"], 1);
        assert_eq!(payload["inpaint_full_res"], true);
        assert_eq!(payload["denoising_strength"], 0.75);
        assert_eq!(payload["width"], 32);
        assert_eq!(payload["seed"], json!(1_234_567_890_123_i64));
        assert!(payload["mask"].as_str().is_some_and(|mask| !mask.is_empty()));
        Ok(())
    }

    #[test]
    fn variation_runs_low_strength_img2img() -> anyhow::Result<()> {
        let prepared = prepared(Mode::Variation)?;
        let payload = img2img_payload(&prepared, VARIATION_PROMPT, VARIATION_STRENGTH, 0)?;
        assert_eq!(payload["denoising_strength"], 0.3);
        assert_eq!(payload["prompt"], VARIATION_PROMPT);
        assert_eq!(payload["init_images"].as_array().map(Vec::len), Some(1));
        Ok(())
    }

    #[test]
    fn decodes_images_and_seed_from_info() -> anyhow::Result<()> {
        let adapter = LocalAdapter::new(HttpTransport::new(&Config::default())?);
        let prepared = prepared(Mode::Generate)?;
        let image = png_bytes(2, 2);
        let raw = json!({
            "images": [BASE64.encode(&image)],
            "info": "{\"seed\": 3141592653, \"steps\": 30}",
        });
        assert_eq!(adapter.decode_result(&prepared, &raw)?, vec![image]);
        assert_eq!(adapter.extract_seed(&prepared, &raw), Some(3_141_592_653));
        assert!(adapter.decode_result(&prepared, &json!({"images": []})).is_err());
        Ok(())
    }
}
