//! Filename resolution and the collision-safe rename.
//!
//! ## Templates
//!
//! | Mode | Name |
//! |------|------|
//! | text, namecard | `YYMMDD_<merchant>_<amount>_<currency>.<ext>` |
//! | receipt | `MMDD_<merchant>_<approval>_<amount>.<ext>` |
//!
//! Absent fields become `unknown`, so the template always yields a complete
//! name. The original extension is kept verbatim.
//!
//! ## Collisions
//!
//! [`resolve`] picks the first free name (`_1`, `_2`, … up to `_999`).
//! Between that check and the filesystem operation another process may take
//! the name, so [`apply`] reserves the target with an exclusive create
//! (`create_new`) immediately before renaming or copying over it; losing that
//! race just moves on to the next suffix. An existing file is never
//! overwritten.

use crate::config::{ExtractionMode, RenameAction};
use crate::error::StageError;
use crate::fields::ExtractedFields;
use crate::output::RenameDecision;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Placeholder for an absent field.
pub const FALLBACK: &str = "unknown";

/// Highest collision suffix tried before giving up.
pub const MAX_SUFFIX: u32 = 999;

/// Merchant names are cut to this many characters.
pub const MERCHANT_MAX_CHARS: usize = 30;

const ILLEGAL: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Make a merchant name safe for every common filesystem.
pub fn sanitize_merchant(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !ILLEGAL.contains(c) && !c.is_control() && !c.is_whitespace())
        .take(MERCHANT_MAX_CHARS)
        .collect();
    if cleaned.is_empty() {
        FALLBACK.to_string()
    } else {
        cleaned
    }
}

/// Whole amounts print as is; fractional ones are written in minor units
/// with two decimals (`12.5` → `1250`).
fn amount_part(fields: &ExtractedFields) -> String {
    let digits: String = fields
        .amount
        .map(|a| {
            if a.fract().is_zero() {
                a.trunc().normalize().to_string()
            } else {
                format!("{:.2}", a.round_dp(2))
            }
        })
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        FALLBACK.to_string()
    } else {
        digits
    }
}

fn approval_part(fields: &ExtractedFields) -> String {
    let cleaned: String = fields
        .approval_number
        .as_deref()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        FALLBACK.to_string()
    } else {
        cleaned
    }
}

/// True when at least one field that appears in the name is present.
///
/// A record with none of them would only produce `unknown_unknown_…`, so the
/// orchestrator keeps the original name instead.
pub fn has_name_fields(fields: &ExtractedFields, mode: ExtractionMode) -> bool {
    let core = fields.payment_date.is_some() || fields.merchant.is_some() || fields.amount.is_some();
    match mode {
        ExtractionMode::Receipt => core || fields.approval_number.is_some(),
        _ => core || fields.currency.is_some(),
    }
}

/// The name stem (no suffix, no extension) for `fields`.
pub fn proposed_stem(fields: &ExtractedFields, mode: ExtractionMode) -> String {
    let merchant = fields
        .merchant
        .as_deref()
        .map(sanitize_merchant)
        .unwrap_or_else(|| FALLBACK.to_string());
    let amount = amount_part(fields);

    match mode {
        ExtractionMode::Receipt => {
            let date = fields
                .payment_date
                .map(|d| d.format("%m%d").to_string())
                .unwrap_or_else(|| FALLBACK.to_string());
            format!("{date}_{merchant}_{}_{amount}", approval_part(fields))
        }
        ExtractionMode::Text | ExtractionMode::Namecard => {
            let date = fields
                .payment_date
                .map(|d| d.format("%y%m%d").to_string())
                .unwrap_or_else(|| FALLBACK.to_string());
            let currency = fields
                .currency
                .as_ref()
                .map(|c| c.as_str().to_uppercase())
                .unwrap_or_else(|| FALLBACK.to_string());
            format!("{date}_{merchant}_{amount}_{currency}")
        }
    }
}

fn file_name(stem: &str, suffix: u32, ext: &str) -> String {
    let mut name = stem.to_string();
    if suffix > 0 {
        name.push_str(&format!("_{suffix}"));
    }
    if !ext.is_empty() {
        name.push('.');
        name.push_str(ext);
    }
    name
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decide the new name for `original` inside `target_dir`.
///
/// A candidate is free when nothing exists there, or when it already is the
/// source file itself.
pub fn resolve(
    fields: &ExtractedFields,
    original: &Path,
    mode: ExtractionMode,
    target_dir: &Path,
) -> Result<RenameDecision, StageError> {
    let stem = proposed_stem(fields, mode);
    let ext = extension_of(original);
    let proposed_name = file_name(&stem, 0, &ext);

    for suffix in 0..=MAX_SUFFIX {
        let target = target_dir.join(file_name(&stem, suffix, &ext));
        if target == original || !target.exists() {
            if suffix > 0 {
                debug!("{} taken; using suffix _{}", proposed_name, suffix);
            }
            return Ok(RenameDecision {
                proposed_name,
                suffix,
                original: original.to_path_buf(),
                target,
            });
        }
    }
    Err(StageError::RenameConflict {
        target: target_dir.join(&proposed_name),
        attempts: MAX_SUFFIX + 1,
    })
}

/// Carry out `decision` with `action`, returning the final decision (the
/// suffix may have moved on if another process took the name meanwhile).
///
/// [`RenameAction::Skip`] leaves everything untouched.
pub async fn apply(
    decision: &RenameDecision,
    action: &RenameAction,
) -> Result<RenameDecision, StageError> {
    if *action == RenameAction::Skip {
        return Ok(decision.clone());
    }
    let dir = decision
        .target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let stem = decision
        .proposed_name
        .strip_suffix(&format!(".{}", extension_of(&decision.original)))
        .unwrap_or(&decision.proposed_name)
        .to_string();
    let ext = extension_of(&decision.original);

    let mut suffix = decision.suffix;
    loop {
        let target = if suffix == decision.suffix {
            decision.target.clone()
        } else {
            dir.join(file_name(&stem, suffix, &ext))
        };

        if target == decision.original {
            debug!("{} already has its resolved name", target.display());
            return Ok(RenameDecision {
                suffix,
                target,
                ..decision.clone()
            });
        }

        match reserve(&target).await {
            Ok(()) => {
                place(&decision.original, &target, action).await?;
                info!(
                    "{} {} → {}",
                    if matches!(action, RenameAction::CopyTo(_)) { "Copied" } else { "Renamed" },
                    decision.original.display(),
                    target.display()
                );
                return Ok(RenameDecision {
                    suffix,
                    target,
                    ..decision.clone()
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("{} was taken before the rename; trying the next suffix", target.display());
                suffix += 1;
                if suffix > MAX_SUFFIX {
                    return Err(StageError::RenameConflict {
                        target: dir.join(&decision.proposed_name),
                        attempts: MAX_SUFFIX + 1,
                    });
                }
            }
            Err(e) => return Err(StageError::io(&target, &e)),
        }
    }
}

/// Claim `target` by creating it exclusively.
async fn reserve(target: &Path) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await
        .map(|_| ())
}

/// Move or copy the source over the reserved placeholder.
async fn place(original: &Path, target: &PathBuf, action: &RenameAction) -> Result<(), StageError> {
    let result = match action {
        RenameAction::CopyTo(_) => tokio::fs::copy(original, target).await.map(|_| ()),
        _ => tokio::fs::rename(original, target).await,
    };
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(target).await;
        return Err(StageError::io(original, &e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::CurrencyCode;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn starbucks() -> ExtractedFields {
        ExtractedFields {
            payment_date: NaiveDate::from_ymd_opt(2024, 4, 15),
            merchant: Some("STARBUCKS".into()),
            amount: Some(Decimal::from(5000)),
            currency: CurrencyCode::parse("KRW"),
            approval_number: Some("3001-2345".into()),
            conversion: None,
        }
    }

    #[test]
    fn text_template() {
        assert_eq!(
            proposed_stem(&starbucks(), ExtractionMode::Text),
            "240415_STARBUCKS_5000_KRW"
        );
    }

    #[test]
    fn receipt_template_uses_approval() {
        assert_eq!(
            proposed_stem(&starbucks(), ExtractionMode::Receipt),
            "0415_STARBUCKS_30012345_5000"
        );
    }

    #[test]
    fn absent_fields_become_unknown() {
        let fields = ExtractedFields {
            merchant: Some("CU".into()),
            ..Default::default()
        };
        assert_eq!(
            proposed_stem(&fields, ExtractionMode::Text),
            "unknown_CU_unknown_unknown"
        );
        assert!(has_name_fields(&fields, ExtractionMode::Text));
        assert!(!has_name_fields(&ExtractedFields::default(), ExtractionMode::Receipt));
    }

    #[test]
    fn merchant_is_sanitised_and_truncated() {
        let s = sanitize_merchant("A/B\\C:D*E?F\"G<H>I|J K\tL\u{7}");
        assert_eq!(s, "ABCDEFGHIJKL");
        for c in ILLEGAL {
            assert!(!s.contains(*c));
        }
        let long = "가".repeat(40);
        assert_eq!(sanitize_merchant(&long).chars().count(), MERCHANT_MAX_CHARS);
        assert_eq!(sanitize_merchant("///"), FALLBACK);
    }

    #[test]
    fn fractional_amount_keeps_two_decimal_digits() {
        let amount = |a: Decimal| {
            amount_part(&ExtractedFields {
                amount: Some(a),
                ..Default::default()
            })
        };
        assert_eq!(amount(Decimal::new(1250, 2)), "1250");
        assert_eq!(amount(Decimal::new(125, 1)), "1250");
        assert_eq!(amount(Decimal::new(125, 2)), "125");
        assert_eq!(amount(Decimal::new(5000, 0)), "5000");
        assert_eq!(amount(Decimal::new(500000, 2)), "5000");
    }

    #[test]
    fn resolve_adds_suffix_for_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("IMG_1.jpg");
        std::fs::write(&original, b"a").unwrap();
        std::fs::write(dir.path().join("240415_STARBUCKS_5000_KRW.jpg"), b"b").unwrap();

        let d = resolve(&starbucks(), &original, ExtractionMode::Text, dir.path()).unwrap();
        assert_eq!(d.suffix, 1);
        assert_eq!(d.target, dir.path().join("240415_STARBUCKS_5000_KRW_1.jpg"));
        assert_eq!(d.proposed_name, "240415_STARBUCKS_5000_KRW.jpg");
    }

    #[test]
    fn resolve_same_file_is_not_a_collision() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("240415_STARBUCKS_5000_KRW.jpg");
        std::fs::write(&original, b"a").unwrap();
        let d = resolve(&starbucks(), &original, ExtractionMode::Text, dir.path()).unwrap();
        assert_eq!(d.suffix, 0);
        assert_eq!(d.target, original);
    }

    #[tokio::test]
    async fn apply_never_overwrites_a_file_taken_after_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("scan.png");
        std::fs::write(&original, b"source").unwrap();

        let d = resolve(&starbucks(), &original, ExtractionMode::Text, dir.path()).unwrap();
        // Another process takes the name between resolve and apply.
        std::fs::write(&d.target, b"someone else").unwrap();

        let done = apply(&d, &RenameAction::InPlace).await.unwrap();
        assert_eq!(done.suffix, 1);
        assert_eq!(std::fs::read(&d.target).unwrap(), b"someone else");
        assert_eq!(std::fs::read(&done.target).unwrap(), b"source");
        assert!(!original.exists());
    }

    #[tokio::test]
    async fn copy_leaves_source_in_place() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let original = src_dir.path().join("scan.pdf");
        std::fs::write(&original, b"%PDF").unwrap();

        let d = resolve(&starbucks(), &original, ExtractionMode::Text, out_dir.path()).unwrap();
        let done = apply(&d, &RenameAction::CopyTo(out_dir.path().to_path_buf()))
            .await
            .unwrap();
        assert!(original.exists());
        assert_eq!(done.target, out_dir.path().join("240415_STARBUCKS_5000_KRW.pdf"));
        assert_eq!(std::fs::read(&done.target).unwrap(), b"%PDF");
    }

    #[test]
    fn resolve_gives_up_after_max_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.jpg");
        std::fs::write(&original, b"a").unwrap();
        let fields = ExtractedFields::default();
        let stem = proposed_stem(&fields, ExtractionMode::Text);
        for suffix in 0..=MAX_SUFFIX {
            std::fs::write(dir.path().join(file_name(&stem, suffix, "jpg")), b"").unwrap();
        }
        let err = resolve(&fields, &original, ExtractionMode::Text, dir.path()).unwrap_err();
        assert!(matches!(err, StageError::RenameConflict { attempts: 1000, .. }));
    }
}
