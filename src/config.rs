//! Configuration types for the receipt extraction-and-rename pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Provider credentials are not stored here:
//! the OCR gateway and field extractor are constructed separately and handed
//! to [`crate::process::Pipeline`], so the config stays cheap to clone and
//! safe to log.

use crate::error::ReceiptError;
use crate::fields::CurrencyCode;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_receipt::{ExtractionMode, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .mode(ExtractionMode::Receipt)
///     .all_pages(true)
///     .skip_existing(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Which structured parsing the OCR and extraction stages apply. Default: Text.
    pub mode: ExtractionMode,

    /// OCR provider used by [`crate::process::Pipeline::from_config`]. Default: Clova.
    pub ocr_provider: OcrProvider,

    /// Field extractor used by [`crate::process::Pipeline::from_config`]. Default: Llm.
    pub extractor: ExtractorKind,

    /// Rasterisation DPI for PDF pages. Range: 72–600. Default: 200.
    ///
    /// Receipts use small thermal-printer fonts; 200 DPI keeps them legible
    /// while a full A4 page still encodes to well under the OCR payload limit.
    pub dpi: u32,

    /// Longest-edge cap for rendered PDF pages in pixels. Default: 2400.
    pub max_rendered_pixels: u32,

    /// Rasterise every PDF page instead of only the first. Default: false.
    pub all_pages: bool,

    /// Explicit page selection. Overrides `all_pages` when set.
    pub pages: Option<PageSelection>,

    /// Documents processed concurrently. Default: 1 (sequential).
    pub concurrency: usize,

    /// Maximum in-flight calls per provider credential. Default: 2.
    pub max_in_flight: usize,

    /// Retry/backoff policy shared by the OCR and extraction stages.
    pub retry: RetryPolicy,

    /// Skip documents whose artifacts already exist and are non-empty. Default: false.
    pub skip_existing: bool,

    /// Directory for the `.txt`/`.json` artifacts. `None` writes them next to
    /// the source document.
    pub output_dir: Option<PathBuf>,

    /// Artifact file naming. Default: [`ArtifactNaming::Suffixed`].
    pub artifact_naming: ArtifactNaming,

    /// What to do with the source file once fields are extracted.
    pub rename: RenameAction,

    /// Currency assumed when the extractor finds none. Default: None.
    pub default_currency: Option<String>,

    /// Convert foreign amounts into this currency when a rate lookup is
    /// installed on the pipeline. Default: None (no conversion).
    pub local_currency: Option<String>,

    /// Attach the first page image to the extraction request. Default: true.
    pub attach_image: bool,

    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for LLM calls. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per call. Default: 1024.
    pub max_tokens: usize,

    /// Per-request timeout for provider calls in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Optional progress callback for per-document events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::default(),
            ocr_provider: OcrProvider::default(),
            extractor: ExtractorKind::default(),
            dpi: 200,
            max_rendered_pixels: 2400,
            all_pages: false,
            pages: None,
            concurrency: 1,
            max_in_flight: 2,
            retry: RetryPolicy::default(),
            skip_existing: false,
            output_dir: None,
            artifact_naming: ArtifactNaming::default(),
            rename: RenameAction::default(),
            default_currency: None,
            local_currency: None,
            attach_image: true,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 1024,
            api_timeout_secs: 60,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("mode", &self.mode)
            .field("ocr_provider", &self.ocr_provider)
            .field("extractor", &self.extractor)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("all_pages", &self.all_pages)
            .field("pages", &self.pages)
            .field("concurrency", &self.concurrency)
            .field("max_in_flight", &self.max_in_flight)
            .field("retry", &self.retry)
            .field("skip_existing", &self.skip_existing)
            .field("output_dir", &self.output_dir)
            .field("artifact_naming", &self.artifact_naming)
            .field("rename", &self.rename)
            .field("default_currency", &self.default_currency)
            .field("local_currency", &self.local_currency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The effective page selection for PDF input.
    ///
    /// An explicit `pages` wins; otherwise `all_pages` picks between every
    /// page and the first page only.
    pub fn page_selection(&self) -> PageSelection {
        match (&self.pages, self.all_pages) {
            (Some(sel), _) => sel.clone(),
            (None, true) => PageSelection::All,
            (None, false) => PageSelection::Single(1),
        }
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn mode(mut self, mode: ExtractionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn ocr_provider(mut self, provider: OcrProvider) -> Self {
        self.config.ocr_provider = provider;
        self
    }

    pub fn extractor(mut self, kind: ExtractorKind) -> Self {
        self.config.extractor = kind;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn all_pages(mut self, v: bool) -> Self {
        self.config.all_pages = v;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = Some(selection);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.config.max_in_flight = n.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn skip_existing(mut self, v: bool) -> Self {
        self.config.skip_existing = v;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    pub fn artifact_naming(mut self, naming: ArtifactNaming) -> Self {
        self.config.artifact_naming = naming;
        self
    }

    pub fn rename(mut self, action: RenameAction) -> Self {
        self.config.rename = action;
        self
    }

    pub fn default_currency(mut self, code: impl Into<String>) -> Self {
        self.config.default_currency = Some(code.into().to_uppercase());
        self
    }

    pub fn local_currency(mut self, code: impl Into<String>) -> Self {
        self.config.local_currency = Some(code.into().to_uppercase());
        self
    }

    pub fn attach_image(mut self, v: bool) -> Self {
        self.config.attach_image = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<PipelineConfig, ReceiptError> {
        self.config.default_currency =
            canonical_currency("default currency", self.config.default_currency.take())?;
        self.config.local_currency =
            canonical_currency("local currency", self.config.local_currency.take())?;

        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(ReceiptError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 || c.max_in_flight == 0 {
            return Err(ReceiptError::InvalidConfig(
                "Concurrency and max in-flight must be ≥ 1".into(),
            ));
        }
        if c.retry.max_attempts == 0 {
            return Err(ReceiptError::InvalidConfig(
                "Retry policy needs at least one attempt".into(),
            ));
        }
        if c.retry.factor < 1.0 {
            return Err(ReceiptError::InvalidConfig(format!(
                "Backoff factor must be ≥ 1.0, got {}",
                c.retry.factor
            )));
        }
        if c.extractor == ExtractorKind::Template {
            if c.ocr_provider != OcrProvider::Clova {
                return Err(ReceiptError::InvalidConfig(
                    "The template extractor needs the clova OCR provider".into(),
                ));
            }
            if c.mode == ExtractionMode::Text {
                return Err(ReceiptError::InvalidConfig(
                    "The template extractor needs receipt or namecard mode".into(),
                ));
            }
        }
        if let RenameAction::CopyTo(dir) = &c.rename {
            if dir.as_os_str().is_empty() {
                return Err(ReceiptError::InvalidConfig(
                    "Copy destination directory is empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

/// Resolve a configured currency (code, symbol or alias) to its ISO code.
fn canonical_currency(name: &str, raw: Option<String>) -> Result<Option<String>, ReceiptError> {
    raw.map(|code| {
        CurrencyCode::parse(&code)
            .map(|c| c.as_str().to_string())
            .ok_or_else(|| {
                ReceiptError::InvalidConfig(format!(
                    "{name} must be a three-letter code, got '{code}'"
                ))
            })
    })
    .transpose()
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which structured parsing to request from the OCR and extraction stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// General OCR text; the LLM reads date, place, amount and currency.
    #[default]
    Text,
    /// Receipt template: store, payment date, total and approval number.
    Receipt,
    /// Business-card template: name and company.
    Namecard,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Text => "text",
            ExtractionMode::Receipt => "receipt",
            ExtractionMode::Namecard => "namecard",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMode {
    type Err = ReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "general" => Ok(ExtractionMode::Text),
            "receipt" => Ok(ExtractionMode::Receipt),
            "namecard" | "name-card" | "businesscard" => Ok(ExtractionMode::Namecard),
            other => Err(ReceiptError::InvalidConfig(format!(
                "unknown mode '{other}' (expected text, receipt or namecard)"
            ))),
        }
    }
}

/// Text-recognition backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrProvider {
    /// Template OCR service (general, receipt and name-card endpoints).
    #[default]
    Clova,
    /// A vision LLM transcribes the page.
    Vision,
}

impl FromStr for OcrProvider {
    type Err = ReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clova" => Ok(OcrProvider::Clova),
            "vision" | "llm" => Ok(OcrProvider::Vision),
            other => Err(ReceiptError::InvalidConfig(format!(
                "unknown OCR provider '{other}' (expected clova or vision)"
            ))),
        }
    }
}

/// How fields are read from the OCR result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// A chat model reads the OCR text (and optionally the first page).
    #[default]
    Llm,
    /// Fields come straight from the template OCR result.
    Template,
}

impl FromStr for ExtractorKind {
    type Err = ReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(ExtractorKind::Llm),
            "template" => Ok(ExtractorKind::Template),
            other => Err(ReceiptError::InvalidConfig(format!(
                "unknown extractor '{other}' (expected llm or template)"
            ))),
        }
    }
}

/// Specifies which pages of a PDF to rasterise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page.
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl Default for PageSelection {
    fn default() -> Self {
        PageSelection::Single(1)
    }
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

impl FromStr for PageSelection {
    type Err = ReceiptError;

    /// `all`, `5`, `3-15` or `1,3,5,7`; pages are 1-indexed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let page = |p: &str| -> Result<usize, ReceiptError> {
            match p.trim().parse::<usize>() {
                Ok(0) => Err(ReceiptError::InvalidConfig(
                    "pages are 1-indexed, minimum is 1".into(),
                )),
                Ok(n) => Ok(n),
                Err(_) => Err(ReceiptError::InvalidConfig(format!(
                    "invalid page number '{}'",
                    p.trim()
                ))),
            }
        };

        if s == "all" {
            Ok(PageSelection::All)
        } else if let Some((start, end)) = s.split_once('-') {
            let (start, end) = (page(start)?, page(end)?);
            if start > end {
                return Err(ReceiptError::InvalidConfig(format!(
                    "invalid page range '{start}-{end}': start must be <= end"
                )));
            }
            Ok(PageSelection::Range(start, end))
        } else if s.contains(',') {
            s.split(',')
                .map(page)
                .collect::<Result<Vec<_>, _>>()
                .map(PageSelection::Set)
        } else {
            page(&s).map(PageSelection::Single)
        }
    }
}

/// How the `.txt` and `.json` artifacts are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArtifactNaming {
    /// `<stem>_ocr_output.txt` and `<stem>_extracted_info.json`. (default)
    #[default]
    Suffixed,
    /// `<stem>.txt` and `<stem>.json`.
    Plain,
}

/// What happens to the source document after a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RenameAction {
    /// Rename the source file in place. (default)
    #[default]
    InPlace,
    /// Leave the source untouched and copy it under the new name into a directory.
    CopyTo(PathBuf),
    /// Write artifacts only.
    Skip,
}

/// Bounded exponential backoff with jitter and a rate-limit cool-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Default: 3.
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 500 ms.
    pub base_delay: Duration,
    /// Multiplier applied per retry. Default: 2.0.
    pub factor: f64,
    /// Upper bound for a single backoff delay. Default: 30 s.
    pub max_delay: Duration,
    /// Add 0–50 % random jitter to each delay. Default: true.
    pub jitter: bool,
    /// Minimum pause imposed on the whole provider after a rate-limit signal. Default: 5 s.
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy with no waiting at all, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
            rate_limit_cooldown: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1 for the first retry), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.saturating_sub(1) as i32);
        let ms = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sequential_first_page() {
        let c = PipelineConfig::default();
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.max_in_flight, 2);
        assert_eq!(c.page_selection(), PageSelection::Single(1));
        assert_eq!(c.rename, RenameAction::InPlace);
        assert!(c.default_currency.is_none());
    }

    #[test]
    fn all_pages_selects_every_page() {
        let c = PipelineConfig::builder().all_pages(true).build().unwrap();
        assert_eq!(c.page_selection().to_indices(3), vec![0, 1, 2]);
    }

    #[test]
    fn explicit_pages_override_all_pages() {
        let c = PipelineConfig::builder()
            .all_pages(true)
            .pages(PageSelection::Range(2, 3))
            .build()
            .unwrap();
        assert_eq!(c.page_selection().to_indices(5), vec![1, 2]);
    }

    #[test]
    fn builder_clamps_dpi_and_concurrency() {
        let c = PipelineConfig::builder()
            .dpi(10)
            .concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn builder_rejects_bad_currency() {
        let err = PipelineConfig::builder()
            .local_currency("dollars")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("three-letter"));
    }

    #[test]
    fn builder_resolves_currency_aliases() {
        let c = PipelineConfig::builder()
            .local_currency("won")
            .default_currency("₩")
            .build()
            .unwrap();
        assert_eq!(c.local_currency.as_deref(), Some("KRW"));
        assert_eq!(c.default_currency.as_deref(), Some("KRW"));
    }

    #[test]
    fn builder_rejects_zero_attempts() {
        let err = PipelineConfig::builder()
            .retry(RetryPolicy::immediate(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ReceiptError::InvalidConfig(_)));
    }

    #[test]
    fn page_selection_parses_cli_forms() {
        assert_eq!("all".parse::<PageSelection>().unwrap(), PageSelection::All);
        assert_eq!("5".parse::<PageSelection>().unwrap(), PageSelection::Single(5));
        assert_eq!(" 3-15 ".parse::<PageSelection>().unwrap(), PageSelection::Range(3, 15));
        assert_eq!(
            "1,3,5".parse::<PageSelection>().unwrap(),
            PageSelection::Set(vec![1, 3, 5])
        );
        assert!("0".parse::<PageSelection>().is_err());
        assert!("9-2".parse::<PageSelection>().is_err());
        assert!("1,x".parse::<PageSelection>().is_err());
    }

    #[test]
    fn template_extractor_needs_template_ocr_and_mode() {
        let err = PipelineConfig::builder()
            .extractor(ExtractorKind::Template)
            .mode(ExtractionMode::Text)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("receipt or namecard"));

        let err = PipelineConfig::builder()
            .extractor(ExtractorKind::Template)
            .ocr_provider(OcrProvider::Vision)
            .mode(ExtractionMode::Receipt)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("clova"));

        assert!(PipelineConfig::builder()
            .extractor(ExtractorKind::Template)
            .mode(ExtractionMode::Receipt)
            .build()
            .is_ok());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Receipt".parse::<ExtractionMode>().unwrap(), ExtractionMode::Receipt);
        assert_eq!("general".parse::<ExtractionMode>().unwrap(), ExtractionMode::Text);
        assert!("invoice".parse::<ExtractionMode>().is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 4).to_indices(5), vec![1, 2, 3]);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).to_indices(5),
            vec![0, 2] // deduplicated and sorted
        );
    }
}
