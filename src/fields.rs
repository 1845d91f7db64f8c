//! The extracted field record and the rules that coerce provider output into it.
//!
//! Every field of [`ExtractedFields`] is either present and well formed or
//! `None`. Sentinels such as `"unknown"` or `"N/A"`, unparseable dates and
//! negative amounts all collapse to `None` here, so nothing downstream ever
//! has to second-guess a value. Shape problems that cannot be coerced (a JSON
//! array where an object belongs, an object where a string belongs) surface as
//! [`StageError::SchemaViolation`].
//!
//! ## Serialised form
//!
//! The JSON artifact uses short keys: `date` (`"YYYYMMDD"` or null), `place`,
//! `amount` (a JSON number or null) and `currency`. `approval_number` and
//! `conversion` are only written when present.

use crate::config::ExtractionMode;
use crate::error::StageError;
use crate::pipeline::postprocess;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// ── Currency code ────────────────────────────────────────────────────────

/// Symbols and local names that map onto an ISO-4217 code.
const CURRENCY_ALIASES: &[(&str, &str)] = &[
    ("₩", "KRW"),
    ("원", "KRW"),
    ("WON", "KRW"),
    ("KR", "KRW"),
    ("$", "USD"),
    ("US$", "USD"),
    ("DOLLAR", "USD"),
    ("US", "USD"),
    ("€", "EUR"),
    ("EURO", "EUR"),
    ("EU", "EUR"),
    ("£", "GBP"),
    ("UK", "GBP"),
    ("¥", "JPY"),
    ("円", "JPY"),
    ("YEN", "JPY"),
    ("元", "CNY"),
    ("RMB", "CNY"),
];

/// A three-letter, upper-case currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Parse a code, symbol or local currency name. Returns `None` for
    /// anything that does not resolve to three ASCII letters.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if is_sentinel(trimmed) {
            return None;
        }
        let upper = trimmed.to_uppercase();
        if let Some((_, code)) = CURRENCY_ALIASES.iter().find(|(alias, _)| *alias == upper) {
            return Some(CurrencyCode((*code).to_string()));
        }
        if upper.len() == 3 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
            return Some(CurrencyCode(upper));
        }
        None
    }

    /// Find a currency symbol or code printed inside a longer string such as
    /// `"₩5,000"` or `"5,000 KRW"`.
    pub fn find_in(text: &str) -> Option<Self> {
        for (alias, code) in CURRENCY_ALIASES {
            if !alias.chars().all(|c| c.is_ascii_alphabetic()) && text.contains(alias) {
                return Some(CurrencyCode((*code).to_string()));
            }
        }
        text.split(|c: char| !c.is_ascii_alphabetic())
            .filter(|w| w.len() == 3 && w.chars().all(|c| c.is_ascii_uppercase()))
            .find_map(CurrencyCode::parse)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CurrencyCode::parse(&value).ok_or_else(|| format!("invalid currency code '{value}'"))
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Record ───────────────────────────────────────────────────────────────

/// Validated payment fields for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(rename = "date", default, with = "yyyymmdd")]
    pub payment_date: Option<NaiveDate>,

    #[serde(rename = "place", default)]
    pub merchant: Option<String>,

    #[serde(default, with = "json_number")]
    pub amount: Option<Decimal>,

    #[serde(default)]
    pub currency: Option<CurrencyCode>,

    /// Card approval number; only read in receipt mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_number: Option<String>,

    /// Set by the conversion step when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<CurrencyConversion>,
}

/// Result of converting a foreign amount into the local currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CurrencyConversion {
    Converted {
        original_amount: Decimal,
        original_currency: CurrencyCode,
        rate: Decimal,
    },
    Unconverted {
        reason: String,
    },
}

const DATE_KEYS: &[&str] = &["date", "payment_date", "paymentDate"];
const PLACE_KEYS: &[&str] = &["place", "merchant", "store", "store_name", "storeName"];
const AMOUNT_KEYS: &[&str] = &["amount", "total", "total_price", "totalPrice"];
const CURRENCY_KEYS: &[&str] = &["currency"];
const APPROVAL_KEYS: &[&str] = &["approval_number", "approvalNumber", "approval", "confirm_num"];

impl ExtractedFields {
    /// Parse a raw model response into fields.
    ///
    /// Text with no JSON object in it is a [`StageError::MalformedResponse`]
    /// (the model may do better on a second try); JSON of the wrong shape is a
    /// [`StageError::SchemaViolation`].
    pub fn from_response(
        raw: &str,
        mode: ExtractionMode,
        provider: &str,
    ) -> Result<Self, StageError> {
        let body = postprocess::isolate_json_object(raw).ok_or_else(|| {
            StageError::MalformedResponse {
                provider: provider.to_string(),
                detail: format!("no JSON object in response: {}", preview(raw)),
            }
        })?;
        let value: Value =
            serde_json::from_str(&body).map_err(|e| StageError::MalformedResponse {
                provider: provider.to_string(),
                detail: format!("invalid JSON ({e}): {}", preview(&body)),
            })?;
        Self::from_value(&value, mode)
    }

    /// Coerce an already-parsed JSON value into fields.
    pub fn from_value(value: &Value, mode: ExtractionMode) -> Result<Self, StageError> {
        let obj = value.as_object().ok_or_else(|| StageError::SchemaViolation {
            detail: format!("expected a JSON object, got {}", json_kind(value)),
        })?;

        let all_keys = [DATE_KEYS, PLACE_KEYS, AMOUNT_KEYS, CURRENCY_KEYS, APPROVAL_KEYS];
        if !all_keys.iter().flat_map(|k| k.iter()).any(|k| obj.contains_key(*k)) {
            return Err(StageError::SchemaViolation {
                detail: format!(
                    "none of the expected keys present (got: {})",
                    obj.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            });
        }

        let lookup = |keys: &[&str]| -> Result<Option<String>, StageError> {
            match keys.iter().find_map(|k| obj.get(*k).map(|v| (*k, v))) {
                Some((key, v)) => field_text(key, v),
                None => Ok(None),
            }
        };

        let fields = ExtractedFields {
            payment_date: lookup(DATE_KEYS)?.and_then(|s| normalize_date(&s)),
            merchant: lookup(PLACE_KEYS)?.map(|s| collapse_whitespace(&s)),
            amount: lookup(AMOUNT_KEYS)?.and_then(|s| normalize_amount(&s)),
            currency: lookup(CURRENCY_KEYS)?.and_then(|s| CurrencyCode::parse(&s)),
            approval_number: match mode {
                ExtractionMode::Receipt => lookup(APPROVAL_KEYS)?,
                _ => None,
            },
            conversion: None,
        };
        debug!("Coerced fields: {:?}", fields);
        Ok(fields)
    }

    /// Fill the currency from a configured default when extraction found none.
    pub fn apply_default_currency(&mut self, default: Option<&str>) {
        if self.currency.is_none() {
            self.currency = default.and_then(CurrencyCode::parse);
        }
    }

    /// Names of the core fields that are absent.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.payment_date.is_none() {
            missing.push("date");
        }
        if self.merchant.is_none() {
            missing.push("place");
        }
        if self.amount.is_none() {
            missing.push("amount");
        }
        if self.currency.is_none() {
            missing.push("currency");
        }
        missing
    }

    /// The pretty-printed JSON artifact body.
    pub fn to_artifact_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// ── Field rules ──────────────────────────────────────────────────────────

const SENTINELS: &[&str] = &["", "unknown", "null", "none", "n/a", "na", "-", "?"];

fn is_sentinel(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    SENTINELS.contains(&lower.as_str())
}

fn field_text(key: &str, value: &Value) -> Result<Option<String>, StageError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if is_sentinel(s) => Ok(None),
        Value::String(s) => Ok(Some(s.trim().to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(StageError::SchemaViolation {
            detail: format!("field '{key}' is {}, expected string or number", json_kind(other)),
        }),
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y. %m. %d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%Y년 %m월 %d일",
];

/// Normalise a date literal into a calendar date.
///
/// Known literal formats are tried first; otherwise the digits are read as
/// `YYYYMMDD` (8 digits), `YYMMDD` (6 digits, pivoting on the current year)
/// or the first 8 of a longer run. Anything else, including impossible dates
/// such as `20240231`, is `None`.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    normalize_date_with_year(raw, chrono::Local::now().year())
}

pub fn normalize_date_with_year(raw: &str, current_year: i32) -> Option<NaiveDate> {
    let s = raw.trim();
    let date_part = s.split(['T', ' ']).next().unwrap_or(s);
    for candidate in [s, date_part] {
        for fmt in DATE_FORMATS {
            if let Ok(d) = NaiveDate::parse_from_str(candidate, fmt) {
                return Some(d);
            }
        }
    }

    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    let full = match digits.len() {
        8 => digits,
        6 => {
            let yy: i32 = digits[..2].parse().ok()?;
            let century = current_year / 100;
            let prefix = if yy > current_year % 100 { century - 1 } else { century };
            format!("{prefix}{digits}")
        }
        n if n > 8 => digits[..8].to_string(),
        _ => return None,
    };
    NaiveDate::parse_from_str(&full, "%Y%m%d").ok()
}

/// Normalise an amount literal into a non-negative decimal.
///
/// Currency symbols, letters, spaces and thousands separators are dropped.
/// A leading minus sign, or a string with no digits, yields `None`.
pub fn normalize_amount(raw: &str) -> Option<Decimal> {
    let s = raw.trim();
    let first_digit = s.find(|c: char| c.is_ascii_digit())?;
    if s[..first_digit].contains('-') {
        return None;
    }
    let mut cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.matches('.').count() > 1 {
        cleaned.retain(|c| c != '.');
    }
    let value = Decimal::from_str(cleaned.trim_end_matches('.')).ok()?;
    if value.is_sign_negative() {
        return None;
    }
    Some(value.normalize())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn preview(s: &str) -> String {
    let t: String = s.chars().take(120).collect();
    if s.chars().count() > 120 {
        format!("{t}…")
    } else {
        t
    }
}

// ── Serde helpers ────────────────────────────────────────────────────────

mod yyyymmdd {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&d.format("%Y%m%d").to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| NaiveDate::parse_from_str(&s, "%Y%m%d").map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod json_number {
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(d: &Option<Decimal>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            None => s.serialize_none(),
            Some(d) if d.fract().is_zero() => match d.to_i64() {
                Some(i) => s.serialize_i64(i),
                None => s.serialize_f64(d.to_f64().unwrap_or(f64::MAX)),
            },
            Some(d) => s.serialize_f64(d.to_f64().unwrap_or(0.0)),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(d)?;
        raw.map(|r| match r {
            Raw::Int(i) => Ok(Decimal::from(i)),
            Raw::Float(f) => Decimal::from_str(&f.to_string()).map_err(serde::de::Error::custom),
            Raw::Text(t) => Decimal::from_str(&t).map_err(serde::de::Error::custom),
        })
        .transpose()
    }
}
