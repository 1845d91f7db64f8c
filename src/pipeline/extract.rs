//! Field extraction: turn OCR output into [`ExtractedFields`].
//!
//! [`LlmFieldExtractor`] asks a chat model for a JSON object and coerces it
//! through [`ExtractedFields::from_response`]. [`TemplateFieldExtractor`]
//! reads the structured result that the template OCR service already
//! returned, so it makes no network call at all.

use crate::config::{ExtractionMode, PipelineConfig};
use crate::error::StageError;
use crate::fields::{normalize_amount, normalize_date, CurrencyCode, ExtractedFields};
use crate::output::OcrResult;
use crate::pipeline::encode::to_image_data;
use crate::pipeline::llm;
use crate::pipeline::ocr::{node_text, template_items, total_price_node, VISION_MAX_PAYLOAD_BYTES};
use crate::pipeline::render::PageImage;
use crate::prompts::{extraction_system_prompt, extraction_user_prompt};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Reads payment fields from a document's OCR result.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    /// Provider name, used in errors, logs and to pick the cool-down gate.
    fn name(&self) -> &str;

    async fn extract_fields(
        &self,
        ocr: &OcrResult,
        pages: &[PageImage],
        mode: ExtractionMode,
    ) -> Result<ExtractedFields, StageError>;
}

// ── LLM ──────────────────────────────────────────────────────────────────

/// Field extraction by a chat model, optionally looking at the first page.
pub struct LlmFieldExtractor {
    provider: Arc<dyn LLMProvider>,
    name: String,
    options: CompletionOptions,
    timeout: Duration,
    attach_image: bool,
}

impl LlmFieldExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        let name = provider.name().to_string();
        Self {
            provider,
            name,
            options: llm::build_options(config),
            timeout: Duration::from_secs(config.api_timeout_secs),
            attach_image: config.attach_image,
        }
    }

    fn build_messages(
        &self,
        ocr: &OcrResult,
        pages: &[PageImage],
        mode: ExtractionMode,
    ) -> Result<Vec<ChatMessage>, StageError> {
        let image = match (self.attach_image, pages.first()) {
            (true, Some(first)) => Some(to_image_data(first, VISION_MAX_PAYLOAD_BYTES)?),
            _ => None,
        };
        if ocr.is_blank() && image.is_none() {
            return Err(StageError::SchemaViolation {
                detail: "OCR produced no text and no page image is attached".into(),
            });
        }

        let user_text = extraction_user_prompt(&ocr.text);
        let user = match image {
            Some(img) => ChatMessage::user_with_images(&user_text, vec![img]),
            None => ChatMessage::user(&user_text),
        };
        Ok(vec![ChatMessage::system(&extraction_system_prompt(mode)), user])
    }
}

#[async_trait]
impl FieldExtractor for LlmFieldExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract_fields(
        &self,
        ocr: &OcrResult,
        pages: &[PageImage],
        mode: ExtractionMode,
    ) -> Result<ExtractedFields, StageError> {
        let messages = self.build_messages(ocr, pages, mode)?;
        let reply = llm::chat(&self.provider, &messages, &self.options, self.timeout).await?;
        info!(
            "{}: extraction used {} in / {} out tokens",
            self.name, reply.input_tokens, reply.output_tokens
        );
        ExtractedFields::from_response(&reply.content, mode, &self.name)
    }
}

// ── Template ─────────────────────────────────────────────────────────────

/// Maps the template OCR result (receipt or business card) into fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateFieldExtractor;

impl TemplateFieldExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FieldExtractor for TemplateFieldExtractor {
    fn name(&self) -> &str {
        "template"
    }

    async fn extract_fields(
        &self,
        ocr: &OcrResult,
        _pages: &[PageImage],
        mode: ExtractionMode,
    ) -> Result<ExtractedFields, StageError> {
        if mode == ExtractionMode::Text {
            return Err(StageError::SchemaViolation {
                detail: "text mode has no template result; use the LLM extractor".into(),
            });
        }
        let result = first_template(ocr).ok_or_else(|| StageError::SchemaViolation {
            detail: format!("OCR result carries no {mode} template"),
        })?;
        let fields = match mode {
            ExtractionMode::Receipt => receipt_fields(result),
            _ => namecard_fields(result),
        };
        debug!("Template fields: {:?}", fields);
        Ok(fields)
    }
}

fn first_template(ocr: &OcrResult) -> Option<&Value> {
    match ocr.metadata.as_ref()? {
        Value::Array(items) => items.iter().find(|v| v.is_object()),
        obj @ Value::Object(_) => Some(obj),
        _ => None,
    }
}

/// Receipt template → fields. A missing total is rebuilt from the line items.
pub fn receipt_fields(result: &Value) -> ExtractedFields {
    let total_text = node_text(total_price_node(result));
    let amount = total_text
        .as_deref()
        .and_then(normalize_amount)
        .or_else(|| sum_items(result));
    let currency = total_text
        .as_deref()
        .and_then(CurrencyCode::find_in)
        .or_else(|| {
            template_items(result)
                .filter_map(|item| node_text(item.pointer("/price/price")))
                .find_map(|p| CurrencyCode::find_in(&p))
        });

    ExtractedFields {
        payment_date: node_text(result.pointer("/paymentInfo/date"))
            .as_deref()
            .and_then(normalize_date),
        merchant: node_text(result.pointer("/storeInfo/name")),
        amount,
        currency,
        approval_number: node_text(result.pointer("/paymentInfo/confirmNum")),
        conversion: None,
    }
}

fn sum_items(result: &Value) -> Option<Decimal> {
    let prices: Vec<Decimal> = template_items(result)
        .filter_map(|item| node_text(item.pointer("/price/price")))
        .filter_map(|p| normalize_amount(&p))
        .collect();
    if prices.is_empty() {
        return None;
    }
    // An overflowing total is as good as unknown.
    prices
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, p| acc.checked_add(p))
}

/// Business-card template → fields: the company (or the person) is the place.
pub fn namecard_fields(result: &Value) -> ExtractedFields {
    ExtractedFields {
        merchant: node_text(result.get("company")).or_else(|| node_text(result.get("name"))),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PageSpan;
    use chrono::NaiveDate;
    use serde_json::json;

    fn ocr_with(metadata: Option<Value>) -> OcrResult {
        OcrResult::from_pages(
            vec![PageSpan {
                index: 0,
                text: "STARBUCKS".into(),
            }],
            metadata,
        )
    }

    #[tokio::test]
    async fn receipt_template_maps_to_fields() {
        let template = json!({
            "storeInfo": {"name": {"text": "STARBUCKS"}},
            "paymentInfo": {
                "date": {"text": "2024/04/15"},
                "confirmNum": {"text": "30012345"}
            },
            "totalPrice": {"price": {"text": "₩5,000"}}
        });
        let fields = TemplateFieldExtractor::new()
            .extract_fields(&ocr_with(Some(json!([template]))), &[], ExtractionMode::Receipt)
            .await
            .unwrap();
        assert_eq!(fields.payment_date, NaiveDate::from_ymd_opt(2024, 4, 15));
        assert_eq!(fields.merchant.as_deref(), Some("STARBUCKS"));
        assert_eq!(fields.amount, Some(Decimal::from(5000)));
        assert_eq!(fields.currency.as_ref().map(|c| c.as_str()), Some("KRW"));
        assert_eq!(fields.approval_number.as_deref(), Some("30012345"));
    }

    #[test]
    fn missing_total_is_summed_from_items() {
        let template = json!({
            "storeInfo": {"name": {"text": "CU"}},
            "subResults": [
                {"items": [
                    {"name": {"text": "Milk"}, "price": {"price": {"text": "1,500"}}},
                    {"name": {"text": "Bread"}, "price": {"price": {"text": "2,300"}}}
                ]},
                {"items": [
                    {"name": {"text": "Gum"}, "price": {"price": {"text": "700"}}}
                ]}
            ]
        });
        let fields = receipt_fields(&template);
        assert_eq!(fields.amount, Some(Decimal::from(4500)));
        assert!(fields.currency.is_none());
        assert!(fields.payment_date.is_none());
    }

    #[test]
    fn overflowing_item_sum_leaves_amount_unknown() {
        let max = Decimal::MAX.to_string();
        let template = json!({
            "subResults": [{"items": [
                {"price": {"price": {"text": max}}},
                {"price": {"price": {"text": max}}}
            ]}]
        });
        assert!(receipt_fields(&template).amount.is_none());
    }

    #[test]
    fn namecard_prefers_company() {
        let with_company = json!({"name": [{"text": "Hong"}], "company": [{"text": "ACME"}]});
        assert_eq!(namecard_fields(&with_company).merchant.as_deref(), Some("ACME"));
        let person_only = json!({"name": [{"text": "Hong"}]});
        assert_eq!(namecard_fields(&person_only).merchant.as_deref(), Some("Hong"));
    }

    #[tokio::test]
    async fn template_extractor_rejects_text_mode_and_missing_template() {
        let x = TemplateFieldExtractor::new();
        assert!(matches!(
            x.extract_fields(&ocr_with(None), &[], ExtractionMode::Text).await,
            Err(StageError::SchemaViolation { .. })
        ));
        assert!(matches!(
            x.extract_fields(&ocr_with(None), &[], ExtractionMode::Receipt).await,
            Err(StageError::SchemaViolation { .. })
        ));
    }
}
