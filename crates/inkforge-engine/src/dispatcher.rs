//! Single-request state machine:
//! `Idle -> Validating -> Submitting -> (Polling) -> Decoding -> Done | Failed`.

use std::fmt;
use std::sync::Arc;

use inkforge_contracts::config::process_env;
use inkforge_contracts::request::MAX_BATCH_COUNT;
use inkforge_contracts::{
    Config, GenerationRequest, HistoryEntry, HistoryLog, KeyInput, MaskMode, Mode, ProviderKind,
};
use serde_json::Value;

use crate::error::{GenerationError, Result};
use crate::http::HttpTransport;
use crate::mask::MaskBuilder;
use crate::providers::{
    redact_payloads, AdapterSet, PendingJob, PollStatus, PreparedRequest, ProviderAdapter,
    Submission,
};
use crate::retry::{CancelToken, Clock, PollPolicy, RetryPolicy, SystemClock};
use crate::source;

const MIN_PROMPT_CHARS: usize = 3;
const CUSTOM_SIZE_RANGE: std::ops::RangeInclusive<u32> = 64..=2048;

/// Images returned by one dispatch, in provider order.
#[derive(Clone, PartialEq)]
pub struct GenerationResult {
    pub images: Vec<Vec<u8>>,
    pub provider: ProviderKind,
    pub model_used: String,
    pub seed_used: Option<i64>,
    /// Provider responses with image payloads redacted.
    pub raw_response: Value,
}

impl fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationResult")
            .field("images", &self.images.iter().map(Vec::len).collect::<Vec<_>>())
            .field("provider", &self.provider)
            .field("model_used", &self.model_used)
            .field("seed_used", &self.seed_used)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Validating,
    Submitting,
    Polling,
    Decoding,
    Done,
    Failed,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct Dispatcher {
    config: Config,
    adapters: AdapterSet,
    history: Option<HistoryLog>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    poll: PollPolicy,
    env: EnvLookup,
}

impl Dispatcher {
    /// Dispatcher wired to the real provider adapters.
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_adapters(
            config,
            AdapterSet::with_defaults(transport),
        ))
    }

    pub fn with_adapters(config: Config, adapters: AdapterSet) -> Self {
        Self {
            config,
            adapters,
            history: None,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            env: Box::new(process_env),
        }
    }

    pub fn with_history(mut self, history: HistoryLog) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replaces the process environment as the middle tier of key resolution.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one request to completion. Every outcome is appended to the history
    /// log, when one is attached, before returning.
    pub fn dispatch(
        &self,
        request: GenerationRequest,
        keys: &KeyInput,
        cancel: &CancelToken,
    ) -> Result<GenerationResult> {
        let span = tracing::info_span!(
            "dispatch",
            provider = %request.provider,
            mode = %request.mode
        );
        let _entered = span.enter();

        let outcome = self.run(&request, keys, cancel);
        match &outcome {
            Ok(result) => {
                transition(DispatchState::Decoding, DispatchState::Done);
                tracing::info!(
                    images = result.images.len(),
                    model = %result.model_used,
                    seed = ?result.seed_used,
                    "generation finished"
                );
                self.record(HistoryEntry::succeeded(
                    &request,
                    &result.model_used,
                    result.images.len(),
                ));
            }
            Err(err) => {
                tracing::debug!(state = ?DispatchState::Failed, "state change");
                tracing::warn!(error_kind = err.kind(), error = %err, "generation failed");
                self.record(HistoryEntry::failed(&request, err.kind(), err.to_string()));
            }
        }
        outcome
    }

    fn run(
        &self,
        request: &GenerationRequest,
        keys: &KeyInput,
        cancel: &CancelToken,
    ) -> Result<GenerationResult> {
        transition(DispatchState::Idle, DispatchState::Validating);
        let requested_model = validate_request(request)?;
        let adapter = self.adapters.get(request.provider).ok_or_else(|| {
            GenerationError::Validation(format!("no adapter registered for {}", request.provider))
        })?;
        let model = adapter.resolve_model(request.mode, &requested_model);
        checkpoint(cancel)?;

        transition(DispatchState::Validating, DispatchState::Submitting);
        let api_key = self.resolve_key(request, keys)?;
        let prepared = prepare(adapter, request, model, api_key)?;
        tracing::debug!(prepared = ?prepared, "request prepared");

        let wanted = request.batch_count.max(1) as usize;
        let calls = adapter.calls_for(&prepared).max(1);
        let mut images: Vec<Vec<u8>> = Vec::new();
        let mut raws: Vec<Value> = Vec::new();
        let mut seed_used = None;
        for call in 0..calls {
            if images.len() >= wanted {
                break;
            }
            let raw = self.with_retry("submit", cancel, || {
                self.submit_once(adapter, &prepared, call, cancel)
            })?;
            transition(DispatchState::Submitting, DispatchState::Decoding);
            // Result URLs are fetched here; a retry re-reads `raw` and never resubmits.
            let decoded =
                self.with_retry("decode", cancel, || adapter.decode_result(&prepared, &raw))?;
            if seed_used.is_none() {
                seed_used = adapter.extract_seed(&prepared, &raw);
            }
            raws.push(redact_payloads(&raw));
            images.extend(decoded);
        }
        images.truncate(wanted);
        if images.is_empty() {
            return Err(GenerationError::decode(
                request.provider,
                "provider returned no images",
            ));
        }

        let raw_response = if raws.len() == 1 {
            raws.pop().unwrap_or(Value::Null)
        } else {
            Value::Array(raws)
        };
        Ok(GenerationResult {
            images,
            provider: request.provider,
            model_used: prepared.model,
            seed_used,
            raw_response,
        })
    }

    fn resolve_key(&self, request: &GenerationRequest, keys: &KeyInput) -> Result<Option<String>> {
        if !request.provider.config().requires_api_key() {
            return Ok(None);
        }
        self.config
            .resolve_api_key(request.provider, keys, |name| (self.env)(name))
            .map(Some)
            .ok_or_else(|| GenerationError::missing_api_key(request.provider))
    }

    /// Runs `op` under the retry policy; only retryable errors are repeated.
    fn with_retry<T, F>(&self, stage: &'static str, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            checkpoint(cancel)?;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => err,
                Err(err) => return Err(err),
            };
            let retry_after = match &err {
                GenerationError::RateLimit { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = self.retry.delay_for(attempt, retry_after);
            tracing::warn!(
                stage,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider failure; retrying"
            );
            self.clock.sleep(delay);
            attempt += 1;
        }
    }

    fn submit_once(
        &self,
        adapter: &dyn ProviderAdapter,
        prepared: &PreparedRequest,
        call: u32,
        cancel: &CancelToken,
    ) -> Result<Value> {
        match adapter.submit(prepared, call)? {
            Submission::Ready(raw) => Ok(raw),
            Submission::Pending(job) => self.poll_until_done(adapter, prepared, &job, cancel),
        }
    }

    fn poll_until_done(
        &self,
        adapter: &dyn ProviderAdapter,
        prepared: &PreparedRequest,
        job: &PendingJob,
        cancel: &CancelToken,
    ) -> Result<Value> {
        transition(DispatchState::Submitting, DispatchState::Polling);
        let started = self.clock.now();
        let deadline = self.poll.deadline;
        let mut poll = 0;
        loop {
            let waited = self.clock.now().saturating_duration_since(started);
            if waited >= deadline {
                return Err(GenerationError::Timeout {
                    provider: adapter.kind(),
                    waited: deadline,
                });
            }
            self.clock.sleep(self.poll.interval(poll).min(deadline - waited));
            checkpoint(cancel)?;
            poll += 1;

            match adapter.poll_status(prepared, job) {
                Ok(PollStatus::Succeeded(raw)) => return Ok(raw),
                Ok(PollStatus::Pending) => {
                    tracing::debug!(job = %job.id, poll, "job still running");
                }
                Ok(PollStatus::Failed(message)) => {
                    return Err(GenerationError::JobFailed {
                        provider: adapter.kind(),
                        message,
                    });
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(job = %job.id, poll, error = %err, "poll failed; will retry");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record(&self, entry: HistoryEntry) {
        let Some(history) = &self.history else {
            return;
        };
        if let Err(err) = history.append(&entry) {
            tracing::warn!(
                path = %history.path().display(),
                error = %format!("{err:#}"),
                "failed to append history entry"
            );
        }
    }
}

fn transition(from: DispatchState, to: DispatchState) {
    tracing::debug!(from = ?from, to = ?to, "state change");
}

fn checkpoint(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(GenerationError::Cancelled)
    } else {
        Ok(())
    }
}

/// Checks request invariants and provider capability without touching the network.
/// Returns the requested model name, falling back to the provider default.
pub fn validate_request(request: &GenerationRequest) -> Result<String> {
    let provider = request.provider.config();
    if !provider.supports(request.mode) {
        return Err(GenerationError::UnsupportedMode {
            provider: request.provider,
            mode: request.mode,
        });
    }

    let invalid = |message: String| Err(GenerationError::Validation(message));
    if request.mode != Mode::Variation && request.prompt.trim().chars().count() < MIN_PROMPT_CHARS {
        return invalid(format!(
            "prompt must be at least {MIN_PROMPT_CHARS} characters"
        ));
    }
    if !(1..=MAX_BATCH_COUNT).contains(&request.batch_count) {
        return invalid(format!(
            "batch count must be between 1 and {MAX_BATCH_COUNT}, got {}",
            request.batch_count
        ));
    }
    if !(0.0..=1.0).contains(&request.img2img_strength) {
        return invalid(format!(
            "img2img strength must be between 0 and 1, got {}",
            request.img2img_strength
        ));
    }
    if !(1.0..=20.0).contains(&request.cfg_scale) {
        return invalid(format!(
            "CFG scale must be between 1 and 20, got {}",
            request.cfg_scale
        ));
    }
    if !(1..=150).contains(&request.steps) {
        return invalid(format!(
            "steps must be between 1 and 150, got {}",
            request.steps
        ));
    }

    if request.custom_size {
        if !CUSTOM_SIZE_RANGE.contains(&request.size.width)
            || !CUSTOM_SIZE_RANGE.contains(&request.size.height)
        {
            return invalid(format!(
                "custom size {} must be between 64 and 2048 pixels per side",
                request.size
            ));
        }
    } else if !provider.supports_size(&request.size.to_string()) {
        return invalid(format!(
            "size {} is not offered by {}; choose one of {}",
            request.size,
            provider.display_name,
            provider.supported_sizes.join(", ")
        ));
    }

    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| provider.default_model());
    if !provider.supports_model(model) {
        return invalid(format!(
            "model '{model}' is not offered by {}",
            provider.display_name
        ));
    }

    if request.mode.needs_source_image() && request.source_image.is_none() {
        return invalid(format!("{} requires a selected image", request.mode));
    }
    if request.mode == Mode::Edit && request.mask_mode.is_none() && request.mask_shape.is_none() {
        return invalid("edit requires a mask mode or selected mask shapes".to_string());
    }
    Ok(model.to_string())
}

/// Loads and converts the source image and builds the mask, once per dispatch.
fn prepare(
    adapter: &dyn ProviderAdapter,
    request: &GenerationRequest,
    model: String,
    api_key: Option<String>,
) -> Result<PreparedRequest> {
    let mut prepared = PreparedRequest::new(request.clone(), model);
    prepared.api_key = api_key;
    let Some(source_image) = request.source_image.as_ref() else {
        return Ok(prepared);
    };
    if !request.mode.needs_source_image() {
        return Ok(prepared);
    }

    let raw = source::load_source(source_image)?;
    let image = adapter.prepare_source(request, &raw)?;
    if request.mode == Mode::Edit {
        let mask = MaskBuilder::build(
            request.mask_mode.unwrap_or(MaskMode::Full),
            image.dimensions(),
            request.mask_shape.as_ref(),
        )?;
        prepared.mask = Some(MaskBuilder::feather(mask, request.mask_feather));
    }
    prepared.source = Some(image);
    Ok(prepared)
}
