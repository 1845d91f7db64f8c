//! LLM plumbing shared by the vision OCR gateway and the LLM field extractor.
//!
//! This module is intentionally thin: it resolves which provider to talk to,
//! sends one chat request, and maps provider failures onto the
//! [`StageError`] retry taxonomy. Retrying itself is the job of
//! [`crate::pipeline::retry`]; prompts live in [`crate::prompts`].

use crate::config::PipelineConfig;
use crate::error::{ReceiptError, StageError};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Text of a successful chat call plus its token usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Send one chat request, classifying any failure.
///
/// The call is bounded by `timeout`; an elapsed timeout counts as transient.
pub async fn chat(
    provider: &Arc<dyn LLMProvider>,
    messages: &[ChatMessage],
    options: &CompletionOptions,
    timeout: Duration,
) -> Result<ChatReply, StageError> {
    let name = provider.name().to_string();
    let start = Instant::now();
    let response = tokio::time::timeout(timeout, provider.chat(messages, Some(options)))
        .await
        .map_err(|_| StageError::Transient {
            provider: name.clone(),
            detail: format!("no response within {}s", timeout.as_secs()),
        })?
        .map_err(|e| classify_llm_error(&name, &e.to_string()))?;

    debug!(
        "{}: {} input tokens, {} output tokens, {:?}",
        name,
        response.prompt_tokens,
        response.completion_tokens,
        start.elapsed()
    );

    Ok(ChatReply {
        content: response.content,
        input_tokens: response.prompt_tokens,
        output_tokens: response.completion_tokens,
    })
}

/// Build `CompletionOptions` from the pipeline config.
pub fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

static RE_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(4\d\d|5\d\d)\b").expect("static regex"));
static RE_RETRY_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:retry[- ]after|try again in)\D{0,3}(\d+(?:\.\d+)?)\s*(ms|s)?")
        .expect("static regex")
});

/// Map a provider error message onto the retry taxonomy.
///
/// LLM providers surface HTTP failures as formatted strings, so the status
/// code and well-known phrases are read back out of the message.
pub fn classify_llm_error(provider: &str, message: &str) -> StageError {
    let lower = message.to_lowercase();
    let status: Option<u16> = RE_STATUS
        .captures(message)
        .and_then(|c| c[1].parse().ok());
    let provider = provider.to_string();
    let detail = message.to_string();

    if status == Some(429) || lower.contains("rate limit") || lower.contains("too many requests") {
        return StageError::RateLimited {
            provider,
            retry_after: parse_retry_after(message),
        };
    }
    if matches!(status, Some(401) | Some(403))
        || lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return StageError::AuthRejected { provider, detail };
    }
    if lower.contains("model not found") || lower.contains("does not exist") || status == Some(404) {
        return StageError::DomainInvalid { provider, detail };
    }
    if status.is_some_and(|s| s >= 500)
        || status == Some(408)
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("overloaded")
        || lower.contains("network")
    {
        return StageError::Transient { provider, detail };
    }
    StageError::MalformedResponse { provider, detail }
}

fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RE_RETRY_AFTER.captures(message)?;
    let value: f64 = caps[1].parse().ok()?;
    let ms = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit == "ms" => value,
        _ => value * 1000.0,
    };
    Some(Duration::from_millis(ms as u64))
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ReceiptError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ReceiptError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`, model defaulting to
///    [`DEFAULT_MODEL`]); the factory reads the matching API key from the
///    environment.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set, so users with several keys
///    get a predictable default.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, ReceiptError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ReceiptError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_defaults() {
        let config = PipelineConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[test]
    fn classify_rate_limit_with_hint() {
        let e = classify_llm_error(
            "openai",
            "API error 429: Rate limit reached. Please try again in 1.5s.",
        );
        assert_eq!(
            e,
            StageError::RateLimited {
                provider: "openai".into(),
                retry_after: Some(Duration::from_millis(1500)),
            }
        );
    }

    #[test]
    fn classify_auth_and_server_errors() {
        assert!(matches!(
            classify_llm_error("openai", "HTTP 401: Incorrect API key provided"),
            StageError::AuthRejected { .. }
        ));
        assert!(matches!(
            classify_llm_error("anthropic", "HTTP 529 overloaded"),
            StageError::Transient { .. }
        ));
        assert!(matches!(
            classify_llm_error("ollama", "connection refused"),
            StageError::Transient { .. }
        ));
    }

    #[test]
    fn classify_unknown_model_as_domain_invalid() {
        assert!(matches!(
            classify_llm_error("openai", "The model `gpt-9` does not exist"),
            StageError::DomainInvalid { .. }
        ));
    }

    #[test]
    fn unrecognised_error_is_malformed() {
        assert!(matches!(
            classify_llm_error("openai", "unexpected end of stream"),
            StageError::MalformedResponse { .. }
        ));
    }
}
