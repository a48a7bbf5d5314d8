pub mod canvas;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod mask;
pub mod providers;
pub mod retry;
pub mod source;

use serde_json::{Map, Value};

pub use canvas::{CanvasInserter, DocumentContext, PlacedImage, ReplaceTarget};
pub use dispatcher::{validate_request, DispatchState, Dispatcher, GenerationResult};
pub use error::{GenerationError, Result};
pub use http::HttpTransport;
pub use mask::{Mask, MaskBuilder};
pub use providers::{
    AdapterSet, LocalAdapter, OpenAiAdapter, PendingJob, PollStatus, PreparedRequest,
    ProviderAdapter, ReplicateAdapter, StabilityAdapter, Submission,
};
pub use retry::{CancelToken, Clock, PollPolicy, RetryPolicy, SystemClock};
pub use source::PreparedImage;

/// Joins an error and its sources, skipping empty and repeated messages.
pub(crate) fn error_chain_text<E>(err: &E, max_chars: usize) -> String
where
    E: std::error::Error + 'static,
{
    let mut parts: Vec<String> = Vec::new();
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = cause {
        let text = current.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        cause = current.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Shortest decimal form, e.g. `0.25` or `7`, for multipart text fields.
pub(crate) fn trim_float(value: f64) -> String {
    let text = format!("{value:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use serde_json::json;

    use super::{error_chain_text, map_object, trim_float, truncate_text};

    #[derive(Debug)]
    struct Layer {
        message: &'static str,
        source: Option<Box<Layer>>,
    }

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl std::error::Error for Layer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.source
                .as_deref()
                .map(|inner| inner as &(dyn std::error::Error + 'static))
        }
    }

    #[test]
    fn error_chain_text_walks_sources_and_skips_repeats() {
        let err = Layer {
            message: "error sending request",
            source: Some(Box::new(Layer {
                message: "connection refused",
                source: Some(Box::new(Layer {
                    message: "connection refused",
                    source: None,
                })),
            })),
        };
        assert_eq!(
            error_chain_text(&err, 400),
            "error sending request | caused by: connection refused"
        );
        assert_eq!(error_chain_text(&err, 5), "error…");
    }

    #[test]
    fn truncate_text_counts_characters() {
        assert_eq!(truncate_text("héllo", 5), "héllo");
        assert_eq!(truncate_text("héllo world", 5), "héllo…");
    }

    #[test]
    fn trim_float_drops_trailing_zeros() {
        assert_eq!(trim_float(0.25), "0.25");
        assert_eq!(trim_float(7.0), "7");
        assert_eq!(trim_float(-1.0), "-1");
        assert_eq!(trim_float(0.7000000001), "0.7");
    }

    #[test]
    fn map_object_ignores_non_objects() {
        assert_eq!(map_object(json!({"a": 1})).len(), 1);
        assert!(map_object(json!([1, 2])).is_empty());
    }
}
