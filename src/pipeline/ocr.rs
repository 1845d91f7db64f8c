//! OCR gateway: send page images to a text-recognition provider.
//!
//! Two providers sit behind the [`OcrGateway`] trait:
//!
//! * [`ClovaOcrGateway`]: a template OCR service with separate endpoints for
//!   general text, receipts and business cards. Template modes return
//!   structured results, which are rendered to text and also passed through
//!   in [`OcrResult::metadata`] for the template field extractor.
//! * [`VisionOcrGateway`]: any edgequake-llm vision model asked to
//!   transcribe the page.
//!
//! Gateways classify failures into the [`StageError`] taxonomy but never
//! retry; the orchestrator wraps [`submit`] in
//! [`crate::pipeline::retry::with_retry`].

use crate::config::{ExtractionMode, PipelineConfig};
use crate::error::{ReceiptError, StageError};
use crate::output::{OcrResult, PageSpan};
use crate::pipeline::encode::{check_payload, to_base64, to_image_data};
use crate::pipeline::llm;
use crate::pipeline::postprocess::clean_ocr_text;
use crate::pipeline::render::PageImage;
use crate::prompts::TRANSCRIBE_SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A text-recognition provider.
#[async_trait]
pub trait OcrGateway: Send + Sync {
    /// Provider name, used in errors, logs and to pick the cool-down gate.
    fn name(&self) -> &str;

    /// Largest accepted base64 page payload in bytes.
    fn max_payload_bytes(&self) -> usize;

    /// Recognise the text of `pages`, in order.
    async fn extract_text(
        &self,
        pages: &[PageImage],
        mode: ExtractionMode,
    ) -> Result<OcrResult, StageError>;
}

/// Pre-flight checks, then one gateway call.
///
/// An empty page list or an oversized page fails here without touching the
/// network.
pub async fn submit(
    gateway: &dyn OcrGateway,
    pages: &[PageImage],
    mode: ExtractionMode,
) -> Result<OcrResult, StageError> {
    if pages.is_empty() {
        return Err(StageError::CorruptDocument {
            path: PathBuf::new(),
            detail: "no pages to recognise".into(),
        });
    }
    check_payload(pages, gateway.max_payload_bytes())?;
    gateway.extract_text(pages, mode).await
}

// ── Template OCR service ─────────────────────────────────────────────────

const CLOVA: &str = "clova";

/// Base64 payload cap per page for the template OCR service.
pub const CLOVA_MAX_PAYLOAD_BYTES: usize = 20 * 1024 * 1024;

/// One invoke URL and its secret.
#[derive(Clone)]
pub struct ClovaEndpoint {
    pub url: String,
    pub secret: String,
}

impl std::fmt::Debug for ClovaEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClovaEndpoint")
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Template OCR over HTTP: one POST per page.
#[derive(Debug, Clone)]
pub struct ClovaOcrGateway {
    client: reqwest::Client,
    general: Option<ClovaEndpoint>,
    receipt: Option<ClovaEndpoint>,
    namecard: Option<ClovaEndpoint>,
}

impl ClovaOcrGateway {
    /// A gateway with no endpoints; add them with [`Self::with_endpoint`].
    pub fn new(timeout: Duration) -> Result<Self, ReceiptError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReceiptError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            general: None,
            receipt: None,
            namecard: None,
        })
    }

    pub fn with_endpoint(mut self, mode: ExtractionMode, endpoint: ClovaEndpoint) -> Self {
        match mode {
            ExtractionMode::Text => self.general = Some(endpoint),
            ExtractionMode::Receipt => self.receipt = Some(endpoint),
            ExtractionMode::Namecard => self.namecard = Some(endpoint),
        }
        self
    }

    /// Read endpoints from `CLOVA_OCR_*`, `CLOVA_RECEIPT_*` and
    /// `CLOVA_NAMECARD_*` (`_URL` + `_SECRET`). At least one pair is required.
    pub fn from_env(timeout: Duration) -> Result<Self, ReceiptError> {
        let mut gateway = Self::new(timeout)?;
        for (mode, prefix) in [
            (ExtractionMode::Text, "CLOVA_OCR"),
            (ExtractionMode::Receipt, "CLOVA_RECEIPT"),
            (ExtractionMode::Namecard, "CLOVA_NAMECARD"),
        ] {
            let url = std::env::var(format!("{prefix}_URL")).unwrap_or_default();
            let secret = std::env::var(format!("{prefix}_SECRET")).unwrap_or_default();
            if !url.is_empty() && !secret.is_empty() {
                debug!("{CLOVA}: {mode} endpoint configured from {prefix}_URL");
                gateway = gateway.with_endpoint(mode, ClovaEndpoint { url, secret });
            }
        }
        if gateway.general.is_none() && gateway.receipt.is_none() && gateway.namecard.is_none() {
            return Err(ReceiptError::ProviderNotConfigured {
                provider: CLOVA.into(),
                hint: "Set CLOVA_OCR_URL and CLOVA_OCR_SECRET (or the CLOVA_RECEIPT_* / \
                       CLOVA_NAMECARD_* pairs for template modes)."
                    .into(),
            });
        }
        Ok(gateway)
    }

    /// Whether an endpoint is configured for `mode`.
    pub fn supports(&self, mode: ExtractionMode) -> bool {
        self.endpoint(mode).is_ok()
    }

    fn endpoint(&self, mode: ExtractionMode) -> Result<&ClovaEndpoint, StageError> {
        let (slot, var) = match mode {
            ExtractionMode::Text => (&self.general, "CLOVA_OCR_URL"),
            ExtractionMode::Receipt => (&self.receipt, "CLOVA_RECEIPT_URL"),
            ExtractionMode::Namecard => (&self.namecard, "CLOVA_NAMECARD_URL"),
        };
        slot.as_ref().ok_or_else(|| StageError::DomainInvalid {
            provider: CLOVA.into(),
            detail: format!("no {mode} endpoint configured (set {var})"),
        })
    }

    async fn recognise_page(
        &self,
        endpoint: &ClovaEndpoint,
        page: &PageImage,
        mode: ExtractionMode,
    ) -> Result<(String, Option<Value>), StageError> {
        let body = request_body(page);
        let response = self
            .client
            .post(&endpoint.url)
            .header("X-OCR-SECRET", &endpoint.secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| StageError::Transient {
                provider: CLOVA.into(),
                detail: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(|e| StageError::Transient {
            provider: CLOVA.into(),
            detail: format!("reading response body: {e}"),
        })?;

        if status != 200 {
            return Err(classify_status(status, &text, retry_after));
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| malformed(format!(
            "undecodable body ({e})"
        )))?;
        parse_response(&value, mode)
    }
}

#[async_trait]
impl OcrGateway for ClovaOcrGateway {
    fn name(&self) -> &str {
        CLOVA
    }

    fn max_payload_bytes(&self) -> usize {
        CLOVA_MAX_PAYLOAD_BYTES
    }

    async fn extract_text(
        &self,
        pages: &[PageImage],
        mode: ExtractionMode,
    ) -> Result<OcrResult, StageError> {
        let endpoint = self.endpoint(mode)?;
        let mut spans = Vec::with_capacity(pages.len());
        let mut templates = Vec::new();
        for page in pages {
            let (text, template) = self.recognise_page(endpoint, page, mode).await?;
            debug!(
                "{CLOVA}: page {} of {} → {} chars",
                page.index + 1,
                page.source.display(),
                text.len()
            );
            spans.push(PageSpan {
                index: page.index,
                text,
            });
            templates.extend(template);
        }
        let metadata = (!templates.is_empty()).then(|| Value::Array(templates));
        Ok(OcrResult::from_pages(spans, metadata))
    }
}

fn request_body(page: &PageImage) -> Value {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let name = page
        .source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".into());
    json!({
        "version": "V2",
        "requestId": format!("req_{timestamp}_{:08x}", fastrand::u32(..)),
        "timestamp": timestamp,
        "images": [{
            "format": page.kind.wire_name(),
            "name": format!("{name}_{}", page.index + 1),
            "data": to_base64(page),
        }],
    })
}

fn malformed(detail: impl Into<String>) -> StageError {
    StageError::MalformedResponse {
        provider: CLOVA.into(),
        detail: detail.into(),
    }
}

/// Map a non-200 response onto the error taxonomy.
///
/// The service reports some credential problems with a provider code in the
/// body rather than the HTTP status: `0002` is an invalid secret, `0022` and
/// `1021` mean the domain or deployment is not enabled for the credential.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> StageError {
    let code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("code").map(|c| c.as_str().map(String::from).unwrap_or_else(|| c.to_string())))
        .unwrap_or_default();
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    let provider = CLOVA.to_string();

    match (status, code.as_str()) {
        (429, _) => StageError::RateLimited {
            provider,
            retry_after,
        },
        (401 | 403, _) | (_, "0002") => StageError::AuthRejected { provider, detail },
        (_, "0022" | "1021") => StageError::DomainInvalid { provider, detail },
        (408, _) => StageError::Transient { provider, detail },
        (500..=599, _) => StageError::Transient { provider, detail },
        (400..=499, _) => StageError::MalformedResponse { provider, detail },
        _ => StageError::Transient { provider, detail },
    }
}

/// Parse a 200 response body for `mode` into page text plus, for template
/// modes, the template result.
pub fn parse_response(
    value: &Value,
    mode: ExtractionMode,
) -> Result<(String, Option<Value>), StageError> {
    let image = value
        .get("images")
        .and_then(|i| i.get(0))
        .ok_or_else(|| malformed("response has no images[0]"))?;

    if let Some(status) = image.get("inferResult").and_then(|s| s.as_str()) {
        if status != "SUCCESS" {
            let message = image.get("message").and_then(|m| m.as_str()).unwrap_or("");
            return Err(malformed(format!("inference {status}: {message}")));
        }
    }

    match mode {
        ExtractionMode::Text => Ok((general_text(image), None)),
        ExtractionMode::Receipt => {
            let result = image
                .pointer("/receipt/result")
                .ok_or_else(|| malformed("response has no receipt.result"))?;
            Ok((render_receipt(result), Some(result.clone())))
        }
        ExtractionMode::Namecard => {
            let result = image
                .pointer("/nameCard/result")
                .ok_or_else(|| malformed("response has no nameCard.result"))?;
            Ok((render_namecard(result), Some(result.clone())))
        }
    }
}

/// `fields[].inferText` joined by spaces; `lineBreak` ends a line.
fn general_text(image: &Value) -> String {
    let mut out = String::new();
    let mut line_start = true;
    for field in image
        .get("fields")
        .and_then(|f| f.as_array())
        .into_iter()
        .flatten()
    {
        let text = field.get("inferText").and_then(|t| t.as_str()).unwrap_or("");
        if !line_start {
            out.push(' ');
        }
        out.push_str(text);
        line_start = false;
        if field.get("lineBreak").and_then(|b| b.as_bool()).unwrap_or(false) {
            out.push('\n');
            line_start = true;
        }
    }
    out.trim_end().to_string()
}

/// The `.text` of a template node, which may be an object or a list of them.
pub(crate) fn node_text(node: Option<&Value>) -> Option<String> {
    let node = node?;
    let obj = match node {
        Value::Array(items) => items.first()?,
        other => other,
    };
    obj.get("text")
        .and_then(|t| t.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Total price node, wherever this template version put it.
pub(crate) fn total_price_node(result: &Value) -> Option<&Value> {
    result
        .pointer("/totalPrice/price")
        .or_else(|| result.pointer("/paymentInfo/totalPrice/price"))
}

fn push_line(lines: &mut Vec<String>, label: &str, value: Option<String>) {
    if let Some(v) = value {
        lines.push(format!("{label}: {v}"));
    }
}

fn render_receipt(result: &Value) -> String {
    let mut lines = Vec::new();
    push_line(&mut lines, "Store", node_text(result.pointer("/storeInfo/name")));
    push_line(&mut lines, "Business number", node_text(result.pointer("/storeInfo/bizNum")));
    for (label, key) in [("Address", "addresses"), ("Tel", "tel")] {
        for node in result
            .pointer(&format!("/storeInfo/{key}"))
            .and_then(|a| a.as_array())
            .into_iter()
            .flatten()
        {
            push_line(&mut lines, label, node_text(Some(node)));
        }
    }
    push_line(&mut lines, "Date", node_text(result.pointer("/paymentInfo/date")));
    push_line(&mut lines, "Time", node_text(result.pointer("/paymentInfo/time")));
    push_line(&mut lines, "Approval", node_text(result.pointer("/paymentInfo/confirmNum")));

    for item in template_items(result) {
        let parts: Vec<String> = [
            node_text(item.get("name")),
            node_text(item.get("count")).map(|c| format!("x{c}")),
            node_text(item.pointer("/price/price")),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !parts.is_empty() {
            lines.push(format!("Item: {}", parts.join(" ")));
        }
    }
    push_line(&mut lines, "Total", node_text(total_price_node(result)));
    lines.join("\n")
}

/// Every line item across the template's sub-results.
pub(crate) fn template_items(result: &Value) -> impl Iterator<Item = &Value> {
    result
        .get("subResults")
        .and_then(|s| s.as_array())
        .into_iter()
        .flatten()
        .flat_map(|sub| sub.get("items").and_then(|i| i.as_array()).into_iter().flatten())
}

fn render_namecard(result: &Value) -> String {
    let mut lines = Vec::new();
    for (label, key) in [
        ("Name", "name"),
        ("Company", "company"),
        ("Department", "department"),
        ("Position", "position"),
        ("Address", "address"),
        ("Email", "email"),
        ("Tel", "tel"),
        ("Mobile", "mobile"),
    ] {
        if let Some(v) = node_text(result.get(key)) {
            lines.push(format!("{label}: {v}"));
        }
    }
    lines.join("\n")
}

// ── Vision LLM ───────────────────────────────────────────────────────────

/// Vision APIs reject images above roughly 20 MB.
pub const VISION_MAX_PAYLOAD_BYTES: usize = 20 * 1024 * 1024;

/// OCR by asking a vision model to transcribe each page.
pub struct VisionOcrGateway {
    provider: Arc<dyn LLMProvider>,
    name: String,
    options: CompletionOptions,
    timeout: Duration,
}

impl VisionOcrGateway {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        let name = provider.name().to_string();
        let mut options = llm::build_options(config);
        // Transcripts run much longer than the field JSON.
        options.max_tokens = Some(config.max_tokens.max(4096));
        Self {
            provider,
            name,
            options,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }
}

#[async_trait]
impl OcrGateway for VisionOcrGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_payload_bytes(&self) -> usize {
        VISION_MAX_PAYLOAD_BYTES
    }

    async fn extract_text(
        &self,
        pages: &[PageImage],
        _mode: ExtractionMode,
    ) -> Result<OcrResult, StageError> {
        let mut spans = Vec::with_capacity(pages.len());
        for page in pages {
            let messages = vec![
                ChatMessage::system(TRANSCRIBE_SYSTEM_PROMPT),
                ChatMessage::user_with_images(
                    "",
                    vec![to_image_data(page, self.max_payload_bytes())?],
                ),
            ];
            let reply = llm::chat(&self.provider, &messages, &self.options, self.timeout).await?;
            info!(
                "{}: transcribed page {} ({} in / {} out tokens)",
                self.name,
                page.index + 1,
                reply.input_tokens,
                reply.output_tokens
            );
            spans.push(PageSpan {
                index: page.index,
                text: clean_ocr_text(&reply.content),
            });
        }
        Ok(OcrResult::from_pages(spans, None))
    }
}
