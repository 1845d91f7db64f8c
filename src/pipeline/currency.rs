//! Optional conversion of foreign amounts into a local currency.
//!
//! Conversion is a pure function over a [`RateLookup`]; fetching rates is a
//! separate, once-per-batch step ([`StaticRates::fetch`]) so a network hiccup
//! never fails a document. A missing rate leaves the fields untouched and
//! records why in [`CurrencyConversion::Unconverted`].

use crate::error::ReceiptError;
use crate::fields::{CurrencyCode, CurrencyConversion, ExtractedFields};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default rates endpoint; `{base}` is replaced by the base currency code.
pub const DEFAULT_RATES_URL: &str = "https://api.exchangerate-api.com/v4/latest/{base}";

/// Source of exchange rates.
pub trait RateLookup: Send + Sync {
    /// Units of `to` per one unit of `from`, if known.
    fn rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<Decimal>;
}

/// A fixed table of rates relative to one base currency.
#[derive(Debug, Clone)]
pub struct StaticRates {
    base: CurrencyCode,
    /// Units of each currency per one unit of `base`.
    per_base: HashMap<CurrencyCode, Decimal>,
}

#[derive(Deserialize)]
struct RatesResponse {
    #[serde(alias = "base_code")]
    base: Option<String>,
    #[serde(alias = "conversion_rates")]
    rates: HashMap<String, f64>,
}

impl StaticRates {
    pub fn new(base: CurrencyCode) -> Self {
        Self {
            base,
            per_base: HashMap::new(),
        }
    }

    /// Record how many units of `code` one unit of the base buys.
    pub fn with_rate(mut self, code: CurrencyCode, per_base: Decimal) -> Self {
        self.insert(code, per_base);
        self
    }

    pub fn insert(&mut self, code: CurrencyCode, per_base: Decimal) {
        self.per_base.insert(code, per_base);
    }

    pub fn base(&self) -> &CurrencyCode {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.per_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_base.is_empty()
    }

    /// Fetch a rate table from an exchangerate-api style endpoint
    /// (`{"base": "USD", "rates": {"KRW": 1350.2, ...}}`).
    pub async fn fetch(
        url_template: &str,
        base: &CurrencyCode,
        timeout: Duration,
    ) -> Result<Self, ReceiptError> {
        let url = url_template.replace("{base}", base.as_str());
        info!("Fetching exchange rates from {}", url);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReceiptError::Internal(format!("building HTTP client: {e}")))?;
        let response = client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ReceiptError::Internal(format!("fetching rates from {url}: {e}")))?;
        let body: RatesResponse = response
            .json()
            .await
            .map_err(|e| ReceiptError::Internal(format!("parsing rates from {url}: {e}")))?;
        Ok(Self::from_response(body, base))
    }

    fn from_response(body: RatesResponse, requested: &CurrencyCode) -> Self {
        let base = body
            .base
            .as_deref()
            .and_then(CurrencyCode::parse)
            .unwrap_or_else(|| requested.clone());
        let mut table = StaticRates::new(base);
        for (code, rate) in body.rates {
            if let (Some(code), Some(rate)) = (CurrencyCode::parse(&code), Decimal::from_f64(rate)) {
                table.insert(code, rate);
            }
        }
        debug!("Loaded {} rates against {}", table.len(), table.base);
        table
    }

    fn per_base(&self, code: &CurrencyCode) -> Option<Decimal> {
        if *code == self.base {
            Some(Decimal::ONE)
        } else {
            self.per_base.get(code).copied()
        }
    }
}

impl RateLookup for StaticRates {
    fn rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        let from_rate = self.per_base(from)?;
        let to_rate = self.per_base(to)?;
        if from_rate.is_zero() {
            return None;
        }
        to_rate.checked_div(from_rate)
    }
}

/// Convert `fields` into `local` when they carry a foreign amount.
///
/// Fields without an amount or currency, or already in `local`, come back
/// unchanged with no conversion recorded.
pub fn convert_to_local(
    fields: &ExtractedFields,
    lookup: &dyn RateLookup,
    local: &CurrencyCode,
) -> ExtractedFields {
    let (Some(amount), Some(currency)) = (fields.amount, fields.currency.as_ref()) else {
        return fields.clone();
    };
    if currency == local {
        return fields.clone();
    }

    let mut out = fields.clone();
    match lookup.rate(currency, local) {
        Some(rate) => {
            let Some(converted) = amount.checked_mul(rate) else {
                warn!("{amount} {currency} × {rate} overflows; keeping the original amount");
                out.conversion = Some(CurrencyConversion::Unconverted {
                    reason: "overflow".to_string(),
                });
                return out;
            };
            out.amount = Some(converted.round_dp(2).normalize());
            out.currency = Some(local.clone());
            out.conversion = Some(CurrencyConversion::Converted {
                original_amount: amount,
                original_currency: currency.clone(),
                rate,
            });
        }
        None => {
            out.conversion = Some(CurrencyConversion::Unconverted {
                reason: format!("no {currency}→{local} rate available"),
            });
        }
    }
    out
}
