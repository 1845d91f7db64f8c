//! CLI binary for edgequake-receipt.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig`, runs the batch and prints the results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_receipt::pipeline::currency::{StaticRates, DEFAULT_RATES_URL};
use edgequake_receipt::pipeline::input::{self, DocumentFormat};
use edgequake_receipt::{
    ArtifactNaming, BatchProgressCallback, BatchSummary, CurrencyCode, DocumentState,
    ExtractionMode, ExtractorKind, OcrProvider, PageSelection, Pipeline, PipelineConfig,
    ProcessingOutcome, ProgressCallback, RenameAction, RetryPolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar for the batch and a log line per document.
/// Documents may finish out of order when `--concurrency` > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<PathBuf, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner only until `on_batch_start` tells us how many documents there are.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Scanning input…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  ETA {eta_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Processing");
        self.bar.reset_eta();
    }

    fn elapsed(&self, path: &Path) -> String {
        let ms = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(path))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        self.activate_bar(total_documents);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_documents} documents…"))
        ));
    }

    fn on_document_start(&self, path: &Path, _index: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(path.to_path_buf(), Instant::now());
        }
    }

    fn on_state(&self, path: &Path, state: DocumentState) {
        let step = match state {
            DocumentState::Normalizing => "reading",
            DocumentState::OcrPending => "OCR",
            DocumentState::ExtractionPending => "extracting",
            DocumentState::Renaming => "renaming",
            _ => return,
        };
        self.bar.set_message(format!("{} {}", file_name(path), dim(step)));
    }

    fn on_document_complete(&self, path: &Path, outcome: &ProcessingOutcome) {
        let elapsed = self.elapsed(path);
        let name = file_name(path);
        let line = match outcome {
            ProcessingOutcome::Succeeded { renamed_to, .. } => {
                let target = renamed_to
                    .as_deref()
                    .map(file_name)
                    .unwrap_or_else(|| "(name kept)".to_string());
                format!("  {} {}  →  {}  {}", green("✓"), name, bold(&target), elapsed)
            }
            ProcessingOutcome::SkippedExisting => {
                format!("  {} {}  {}", dim("↷"), name, dim("already processed"))
            }
            failure => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                let mut msg = failure
                    .reason()
                    .map(|r| r.to_string())
                    .unwrap_or_default()
                    .replace('\n', " ");
                // Keep the line tidy on narrow terminals.
                if msg.chars().count() > 80 {
                    msg = format!("{}\u{2026}", msg.chars().take(79).collect::<String>());
                }
                format!(
                    "  {} {}  {}  {}  {}",
                    red("✗"),
                    name,
                    dim(failure.label()),
                    red(&msg),
                    elapsed
                )
            }
        };
        self.bar.println(line);
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        if errors == 0 && summary.halted.is_none() && !summary.cancelled {
            eprintln!(
                "{} {} documents processed successfully",
                green("✔"),
                bold(&(summary.succeeded + summary.skipped).to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} documents processed  ({} failed)",
                if summary.succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&(summary.succeeded + summary.skipped).to_string()),
                summary.total(),
                red(&errors.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Rename every receipt in a folder (template OCR + LLM extraction)
  receipt2name scans/

  # One file, receipt template, fields from the OCR template only
  receipt2name --mode receipt --extractor template receipt.jpg

  # No template OCR credentials: let a vision model read the page
  receipt2name --ocr vision --provider openai --model gpt-4.1-mini scans/

  # Keep originals, copy renamed files elsewhere, artifacts in ./out
  receipt2name --copy-to renamed/ --output-dir out/ scans/

  # Re-run safely: skip files that already have both artifacts
  receipt2name --skip-existing scans/

  # Convert foreign amounts into KRW
  receipt2name --local-currency KRW scans/

  # JSON summary for scripting
  receipt2name --json --no-progress scans/ > summary.json

OUTPUT:
  <stem>_ocr_output.txt       OCR text (written even if extraction fails)
  <stem>_extracted_info.json  {"date","place","amount","currency",...}
  240415_STARBUCKS_5000_KRW.jpg   text / namecard modes
  0415_STARBUCKS_30012345_5000.jpg  receipt mode (MMDD_place_approval_amount)

ENVIRONMENT VARIABLES:
  CLOVA_OCR_URL / CLOVA_OCR_SECRET             General OCR endpoint (text mode)
  CLOVA_RECEIPT_URL / CLOVA_RECEIPT_SECRET     Receipt template endpoint
  CLOVA_NAMECARD_URL / CLOVA_NAMECARD_SECRET   Business-card template endpoint
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  RUST_LOG                Log filter (overrides -v / -q)

  PDFium (~30 MB) is downloaded automatically the first time a PDF is seen.
"#;

/// Extract payment fields from receipt scans and rename the files after them.
#[derive(Parser, Debug)]
#[command(
    name = "receipt2name",
    version,
    about = "Extract date, merchant and amount from receipts and rename the files",
    long_about = "Run OCR over receipt scans (PDF, JPEG, PNG, TIFF), extract the payment \
date, merchant, amount and currency with an LLM or the OCR service's receipt template, \
save the results next to each file and rename it to DATE_MERCHANT_AMOUNT_CURRENCY.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// A receipt file or a directory of them (non-recursive).
    input: PathBuf,

    /// Extraction mode: text, receipt, namecard.
    #[arg(long, env = "RECEIPT2NAME_MODE", default_value = "text")]
    mode: ExtractionMode,

    /// OCR backend: clova (template OCR service) or vision (LLM).
    #[arg(long, env = "RECEIPT2NAME_OCR", default_value = "clova")]
    ocr: OcrProvider,

    /// Field extractor: llm or template.
    #[arg(long, env = "RECEIPT2NAME_EXTRACTOR", default_value = "llm")]
    extractor: ExtractorKind,

    /// Rasterise every PDF page instead of the first one.
    #[arg(long, env = "RECEIPT2NAME_ALL_PAGES")]
    all_pages: bool,

    /// PDF page selection: all, 5, 3-15, or 1,3,5,7 (overrides --all-pages).
    #[arg(long, env = "RECEIPT2NAME_PAGES")]
    pages: Option<PageSelection>,

    /// Write artifacts here instead of next to each document.
    #[arg(short, long, env = "RECEIPT2NAME_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Name artifacts <stem>.txt / <stem>.json.
    #[arg(long, env = "RECEIPT2NAME_PLAIN_ARTIFACTS")]
    plain_artifacts: bool,

    /// Skip documents whose two artifacts already exist and are non-empty.
    #[arg(long, env = "RECEIPT2NAME_SKIP_EXISTING")]
    skip_existing: bool,

    /// Copy renamed files into this directory and leave the originals alone.
    #[arg(long, env = "RECEIPT2NAME_COPY_TO", conflicts_with = "no_rename")]
    copy_to: Option<PathBuf>,

    /// Write artifacts only; never rename.
    #[arg(long, env = "RECEIPT2NAME_NO_RENAME")]
    no_rename: bool,

    /// Documents processed at once.
    #[arg(short, long, env = "RECEIPT2NAME_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Calls in flight per provider credential.
    #[arg(long, env = "RECEIPT2NAME_MAX_IN_FLIGHT", default_value_t = 2)]
    max_in_flight: usize,

    /// Attempts per provider call, first one included.
    #[arg(long, env = "RECEIPT2NAME_MAX_RETRIES", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..=10))]
    max_retries: u32,

    /// Delay before the first retry, doubled each time.
    #[arg(long, env = "RECEIPT2NAME_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Currency assumed when the receipt shows none (e.g. KRW).
    #[arg(long, env = "RECEIPT2NAME_DEFAULT_CURRENCY")]
    default_currency: Option<String>,

    /// Convert amounts in other currencies into this one.
    #[arg(long, env = "RECEIPT2NAME_LOCAL_CURRENCY")]
    local_currency: Option<String>,

    /// Exchange-rate endpoint; `{base}` is replaced by the local currency.
    #[arg(long, env = "RECEIPT2NAME_RATES_URL", default_value = DEFAULT_RATES_URL)]
    rates_url: String,

    /// Also send the first page image to the extraction model.
    #[arg(long, env = "RECEIPT2NAME_ATTACH_IMAGE")]
    attach_image: bool,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// PDF rendering DPI (72–600).
    #[arg(long, env = "RECEIPT2NAME_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Per-call provider timeout in seconds.
    #[arg(long, env = "RECEIPT2NAME_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Print the batch summary as JSON on stdout.
    #[arg(long, env = "RECEIPT2NAME_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "RECEIPT2NAME_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "RECEIPT2NAME_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "RECEIPT2NAME_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Discover input ───────────────────────────────────────────────────
    let documents = collect_inputs(&cli.input)?;
    if documents.is_empty() {
        if !cli.quiet {
            eprintln!("No supported files in {}", cli.input.display());
        }
        return Ok(());
    }

    // ── Ensure PDFium engine is available ────────────────────────────────
    // Only needed when a PDF is in the batch; images never touch pdfium.
    let has_pdf = documents
        .iter()
        .any(|p| matches!(DocumentFormat::from_path(p), Ok(DocumentFormat::Pdf)));
    if has_pdf && !pdfium_auto::is_pdfium_cached() {
        ensure_pdfium(cli.quiet)?;
    }

    // ── Build pipeline ───────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;
    let local_currency = config.local_currency.clone();
    let api_timeout = Duration::from_secs(config.api_timeout_secs);
    let mut pipeline = Pipeline::from_config(config).context("Failed to set up providers")?;

    if let Some(local) = local_currency.as_deref().and_then(CurrencyCode::parse) {
        match StaticRates::fetch(&cli.rates_url, &local, api_timeout).await {
            Ok(rates) => pipeline = pipeline.with_rates(Arc::new(rates)),
            Err(e) => warn!("Currency conversion disabled: {}", e),
        }
    }

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing documents in flight");
            stop.stop();
        }
    });

    // ── Run ──────────────────────────────────────────────────────────────
    let summary = pipeline.process_batch(&documents).await;

    if cli.json {
        let json =
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&summary, show_progress);
    }

    if !summary.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

/// A single supported file, or every supported file in a directory.
fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        return input::discover_documents(input)
            .with_context(|| format!("Failed to read directory {}", input.display()));
    }
    if !input.exists() {
        anyhow::bail!("Input not found: {}", input.display());
    }
    if !input::is_supported(input) {
        anyhow::bail!(
            "Unsupported file type: {} (expected one of {})",
            input.display(),
            input::SUPPORTED_EXTENSIONS.join(", ")
        );
    }
    Ok(vec![input.to_path_buf()])
}

/// First-run pdfium download (~30 MB) with a byte progress bar.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.set_message("Connecting…");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let rename = match (&cli.copy_to, cli.no_rename) {
        (_, true) => RenameAction::Skip,
        (Some(dir), false) => RenameAction::CopyTo(dir.clone()),
        (None, false) => RenameAction::InPlace,
    };
    let retry = RetryPolicy {
        max_attempts: cli.max_retries,
        base_delay: Duration::from_millis(cli.retry_backoff_ms),
        ..RetryPolicy::default()
    };

    let mut builder = PipelineConfig::builder()
        .mode(cli.mode)
        .ocr_provider(cli.ocr)
        .extractor(cli.extractor)
        .dpi(cli.dpi)
        .all_pages(cli.all_pages)
        .concurrency(cli.concurrency)
        .max_in_flight(cli.max_in_flight)
        .retry(retry)
        .skip_existing(cli.skip_existing)
        .rename(rename)
        .attach_image(cli.attach_image)
        .api_timeout_secs(cli.api_timeout);

    if let Some(ref pages) = cli.pages {
        builder = builder.pages(pages.clone());
    }
    if let Some(ref dir) = cli.output_dir {
        builder = builder.output_dir(dir);
    }
    if cli.plain_artifacts {
        builder = builder.artifact_naming(ArtifactNaming::Plain);
    }
    if let Some(ref code) = cli.default_currency {
        builder = builder.default_currency(code);
    }
    if let Some(ref code) = cli.local_currency {
        builder = builder.local_currency(code);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let mut config = builder.build().context("Invalid configuration")?;

    config.model = cli.model.clone();
    config.provider_name = cli.provider.clone();

    Ok(config)
}

fn print_summary(summary: &BatchSummary, progress_shown: bool) {
    if !progress_shown {
        for report in &summary.reports {
            let name = file_name(&report.path);
            match (&report.outcome, report.outcome.reason()) {
                (ProcessingOutcome::Succeeded { renamed_to: Some(t), .. }, _) => {
                    eprintln!("  {} {} → {}", green("✓"), name, file_name(t))
                }
                (_, Some(reason)) => eprintln!(
                    "  {} {} {}: {}",
                    red("✗"),
                    name,
                    report.outcome.label(),
                    reason
                ),
                (outcome, None) => eprintln!("  {} {} {}", dim("·"), name, outcome.label()),
            }
        }
    }

    eprintln!(
        "{}  {} renamed  {} skipped  {} failed  {}  {}ms",
        if summary.is_clean() { green("✔") } else { cyan("⚠") },
        summary.succeeded,
        summary.skipped,
        summary.failed(),
        dim(&format!("({} ocr / {} extraction / {} rename)",
            summary.failed_ocr, summary.failed_extraction, summary.failed_rename)),
        summary.duration_ms,
    );
    if summary.missing.any() {
        eprintln!(
            "   {} missing date: {}  place: {}  amount: {}  currency: {}",
            dim("fields"),
            summary.missing.date,
            summary.missing.place,
            summary.missing.amount,
            summary.missing.currency,
        );
    }
    if let Some(ref reason) = summary.halted {
        eprintln!(
            "{} batch halted ({} not started): {}",
            red("✘"),
            summary.not_started,
            reason
        );
    } else if summary.cancelled {
        eprintln!("{} interrupted ({} not started)", cyan("⚠"), summary.not_started);
    }
}
