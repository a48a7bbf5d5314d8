//! Blocking HTTP transport shared by every provider adapter.
//!
//! All status and transport failures are mapped into [`GenerationError`] here so
//! adapters only deal with payload shapes.

use std::time::Duration;

use inkforge_contracts::{Config, ProviderKind};
use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value;

use crate::error::{GenerationError, Result};
use crate::{error_chain_text, truncate_text};

/// Longest provider error body kept in error messages.
pub const BODY_SNIPPET_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(concat!("inkforge/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy_url) = config.proxy() {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|err| {
                GenerationError::Validation(format!("invalid proxy URL '{proxy_url}': {err}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(|err| {
            GenerationError::Validation(format!(
                "could not build HTTP client: {}",
                error_chain_text(&err, BODY_SNIPPET_CHARS)
            ))
        })?;
        Ok(Self { http })
    }

    pub fn post_json(
        &self,
        provider: ProviderKind,
        url: &str,
        api_key: Option<&str>,
        payload: &Value,
    ) -> Result<Value> {
        let builder = self.http.post(url).header(ACCEPT, "application/json").json(payload);
        let response = send(provider, with_auth(builder, api_key))?;
        response_json_or_error(provider, response)
    }

    /// Replicate-style submit that asks the server to hold the connection until done.
    pub fn post_json_wait(
        &self,
        provider: ProviderKind,
        url: &str,
        api_key: Option<&str>,
        payload: &Value,
    ) -> Result<Value> {
        let builder = self
            .http
            .post(url)
            .header("Prefer", "wait")
            .header(ACCEPT, "application/json")
            .json(payload);
        let response = send(provider, with_auth(builder, api_key))?;
        response_json_or_error(provider, response)
    }

    pub fn post_multipart(
        &self,
        provider: ProviderKind,
        url: &str,
        api_key: Option<&str>,
        form: MultipartForm,
    ) -> Result<Value> {
        let builder = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .multipart(form);
        let response = send(provider, with_auth(builder, api_key))?;
        response_json_or_error(provider, response)
    }

    pub fn get_json(&self, provider: ProviderKind, url: &str, api_key: Option<&str>) -> Result<Value> {
        let builder = self.http.get(url).header(ACCEPT, "application/json");
        let response = send(provider, with_auth(builder, api_key))?;
        response_json_or_error(provider, response)
    }

    /// Fetches result bytes from a provider-hosted URL.
    pub fn download(&self, provider: ProviderKind, url: &str) -> Result<Vec<u8>> {
        let response = send(provider, self.http.get(url))?;
        let response = check_status(provider, response)?;
        let bytes = response.bytes().map_err(|err| GenerationError::Network {
            provider,
            message: format!(
                "failed reading image bytes from {url}: {}",
                error_chain_text(&err, BODY_SNIPPET_CHARS)
            ),
        })?;
        Ok(bytes.to_vec())
    }
}

fn with_auth(builder: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => builder.bearer_auth(key),
        None => builder,
    }
}

fn send(provider: ProviderKind, builder: RequestBuilder) -> Result<HttpResponse> {
    builder.send().map_err(|err| GenerationError::Network {
        provider,
        message: error_chain_text(&err, BODY_SNIPPET_CHARS),
    })
}

fn check_status(provider: ProviderKind, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.text().unwrap_or_default();
    Err(classify_status(
        provider,
        status.as_u16(),
        retry_after.as_deref(),
        &body,
    ))
}

fn response_json_or_error(provider: ProviderKind, response: HttpResponse) -> Result<Value> {
    let response = check_status(provider, response)?;
    let body = response.text().map_err(|err| GenerationError::Network {
        provider,
        message: format!(
            "response body read failed: {}",
            error_chain_text(&err, BODY_SNIPPET_CHARS)
        ),
    })?;
    serde_json::from_str(&body).map_err(|err| {
        GenerationError::decode(
            provider,
            format!(
                "invalid JSON payload ({err}): {}",
                truncate_text(&body, BODY_SNIPPET_CHARS)
            ),
        )
    })
}

/// Maps a non-2xx response onto the error taxonomy.
pub fn classify_status(
    provider: ProviderKind,
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> GenerationError {
    let message = provider_error_message(body);
    match status {
        401 | 403 => GenerationError::Authentication { provider, message },
        429 => GenerationError::RateLimit {
            provider,
            retry_after: retry_after.and_then(parse_retry_after),
            body: message,
        },
        _ => GenerationError::ProviderHttp {
            provider,
            status,
            body: message,
        },
    }
}

/// Seconds form only; HTTP-date values fall back to the backoff schedule.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && (0.0..=86_400.0).contains(secs))
        .map(Duration::from_secs_f64)
}

/// Prefers `error.message` / `message` / `detail` from JSON bodies.
fn provider_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let extracted = parsed.as_ref().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .or_else(|| value.get("detail"))
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    truncate_text(extracted.as_deref().unwrap_or(body).trim(), BODY_SNIPPET_CHARS)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use inkforge_contracts::ProviderKind;

    use super::{classify_status, parse_retry_after, BODY_SNIPPET_CHARS};
    use crate::error::GenerationError;

    #[test]
    fn auth_statuses_map_to_authentication() {
        for status in [401, 403] {
            let err = classify_status(
                ProviderKind::OpenAi,
                status,
                None,
                r#"{"error": {"message": "Incorrect API key provided"}}"#,
            );
            match err {
                GenerationError::Authentication { message, .. } => {
                    assert_eq!(message, "Incorrect API key provided")
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = classify_status(ProviderKind::Stability, 429, Some("7"), "slow down");
        match err {
            GenerationError::RateLimit {
                retry_after, body, ..
            } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn other_statuses_keep_status_and_truncated_body() {
        let body = "x".repeat(2000);
        let err = classify_status(ProviderKind::Local, 502, None, &body);
        match err {
            GenerationError::ProviderHttp { status, body, .. } => {
                assert_eq!(status, 502);
                assert_eq!(body.chars().count(), BODY_SNIPPET_CHARS + 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_json_bodies_are_used_verbatim() {
        let err = classify_status(ProviderKind::Replicate, 500, None, "  upstream exploded ");
        assert_eq!(
            err.to_string(),
            "replicate request failed (500): upstream exploded"
        );
    }
}
