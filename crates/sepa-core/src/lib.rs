//! Core domain model for the SEPA price ingestion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sepa-core";

/// Classification used to pick the field mapping for a raw file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RetailerGroup(String);

impl RetailerGroup {
    pub const GENERIC: &'static str = "generic";
    pub const SEPA: &'static str = "sepa";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_ascii_lowercase())
    }

    pub fn generic() -> Self {
        Self::new(Self::GENERIC)
    }

    pub fn sepa() -> Self {
        Self::new(Self::SEPA)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RetailerGroup {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<RetailerGroup> for String {
    fn from(group: RetailerGroup) -> Self {
        group.0
    }
}

impl fmt::Display for RetailerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Zip,
}

impl ArchiveFormat {
    /// Leading bytes every well-formed, non-empty container of this format starts with.
    pub fn signature(&self) -> &'static [u8] {
        match self {
            ArchiveFormat::Zip => b"PK\x03\x04",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// One archive to download for a run, as resolved from the weekday table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    pub retailer_group: RetailerGroup,
    pub expected_format: ArchiveFormat,
    #[serde(default)]
    pub label: Option<String>,
    /// Publisher-provided SHA-256 of the archive, when one exists.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl SourceDescriptor {
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceParseError {
    #[error("price is empty")]
    Empty,
    #[error("price is negative: {0}")]
    Negative(String),
    #[error("price is not a decimal number: {0}")]
    Invalid(String),
    #[error("price does not fit in cents: {0}")]
    Overflow(String),
}

/// Non-negative amount held as integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(i64);

impl Price {
    pub fn from_cents(cents: i64) -> Option<Self> {
        (cents >= 0).then_some(Self(cents))
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Parse source-formatted price text into cents.
    ///
    /// Currency markers (`$`, `US$`, `ARS`) and whitespace are dropped. When both
    /// `.` and `,` appear, whichever comes last is the decimal separator. A single
    /// separator kind appearing more than once groups thousands; appearing once it
    /// is the decimal separator. Fractions beyond cents round half-up.
    pub fn parse(text: &str) -> Result<Self, PriceParseError> {
        let cleaned: String = text
            .replace("US$", "")
            .replace("ARS", "")
            .replace('$', "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        if cleaned.is_empty() {
            return Err(PriceParseError::Empty);
        }
        if cleaned.starts_with('-') {
            return Err(PriceParseError::Negative(text.trim().to_string()));
        }
        if !cleaned
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == ',')
        {
            return Err(PriceParseError::Invalid(text.trim().to_string()));
        }

        let dots = cleaned.matches('.').count();
        let commas = cleaned.matches(',').count();
        let decimal_sep = match (dots, commas) {
            (0, 0) => None,
            (_, 0) => (dots == 1).then_some('.'),
            (0, _) => (commas == 1).then_some(','),
            _ => {
                let last_dot = cleaned.rfind('.');
                let last_comma = cleaned.rfind(',');
                let sep = if last_dot > last_comma { '.' } else { ',' };
                if cleaned.matches(sep).count() != 1 {
                    return Err(PriceParseError::Invalid(text.trim().to_string()));
                }
                Some(sep)
            }
        };

        let (int_part, frac_part) = match decimal_sep {
            Some(sep) => match cleaned.split_once(sep) {
                Some((int_part, frac_part)) => (int_part.to_string(), frac_part.to_string()),
                None => (cleaned.clone(), String::new()),
            },
            None => (cleaned.clone(), String::new()),
        };
        let int_digits: String = int_part.chars().filter(|c| c.is_ascii_digit()).collect();

        if !frac_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(PriceParseError::Invalid(text.trim().to_string()));
        }
        if int_digits.is_empty() && frac_part.is_empty() {
            return Err(PriceParseError::Invalid(text.trim().to_string()));
        }

        let overflow = || PriceParseError::Overflow(text.trim().to_string());
        let units: i64 = if int_digits.is_empty() {
            0
        } else {
            int_digits.parse().map_err(|_| overflow())?
        };

        let frac = frac_part.as_bytes();
        let digit = |i: usize| frac.get(i).map(|b| i64::from(b - b'0')).unwrap_or(0);
        let mut cents_part = digit(0) * 10 + digit(1);
        if digit(2) >= 5 {
            cents_part += 1;
        }

        units
            .checked_mul(100)
            .and_then(|c| c.checked_add(cents_part))
            .map(Self)
            .ok_or_else(overflow)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Validated product/price row produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub store_id: String,
    pub chain_id: String,
    pub store_name: Option<String>,
    pub barcode: String,
    pub product_name: Option<String>,
    pub brand: Option<String>,
    pub price_text: String,
    pub price: Price,
}

/// Store directory row, for sources that publish store names in a separate file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub store_id: String,
    pub chain_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizedRow {
    Price(RawRecord),
    Store(StoreRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub store_id: String,
    pub chain_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub barcode: String,
    pub name: Option<String>,
    pub brand: Option<String>,
}

/// Current price of one product at one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFact {
    pub store_id: String,
    pub barcode: String,
    pub price: Price,
    pub observed_at: DateTime<Utc>,
}

/// Read-side answer for "which stores sell this barcode".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductListing {
    pub barcode: String,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub stores: Vec<StoreOffer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOffer {
    pub store_id: String,
    pub chain_id: String,
    pub store_name: Option<String>,
    pub price: Price,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cents(text: &str) -> i64 {
        Price::parse(text).expect(text).cents()
    }

    #[test]
    fn price_parsing_handles_source_formats() {
        assert_eq!(cents("$1200"), 120_000);
        assert_eq!(cents("1200.50"), 120_050);
        assert_eq!(cents("1200,5"), 120_050);
        assert_eq!(cents("$ 1.234,56"), 123_456);
        assert_eq!(cents("1,234.56"), 123_456);
        assert_eq!(cents("1.234.567"), 123_456_700);
        assert_eq!(cents("ARS 99"), 9_900);
        assert_eq!(cents("US$ 3.10"), 310);
        assert_eq!(cents(" 0 "), 0);
        assert_eq!(cents(",75"), 75);
    }

    #[test]
    fn price_parsing_rounds_extra_fraction_digits_half_up() {
        assert_eq!(cents("1549.000"), 154_900);
        assert_eq!(cents("10.125"), 1_013);
        assert_eq!(cents("10.124"), 1_012);
    }

    #[test]
    fn price_parsing_rejects_malformed_text() {
        assert_eq!(Price::parse("   "), Err(PriceParseError::Empty));
        assert!(matches!(Price::parse("-5"), Err(PriceParseError::Negative(_))));
        assert!(matches!(Price::parse("abc"), Err(PriceParseError::Invalid(_))));
        assert!(matches!(Price::parse("12a"), Err(PriceParseError::Invalid(_))));
        assert!(matches!(Price::parse("1.2,3,4"), Err(PriceParseError::Invalid(_))));
        assert!(matches!(Price::parse("."), Err(PriceParseError::Invalid(_))));
        assert!(matches!(
            Price::parse("99999999999999999999"),
            Err(PriceParseError::Overflow(_))
        ));
    }

    #[test]
    fn price_displays_with_two_decimals() {
        assert_eq!(Price::parse("1200").unwrap().to_string(), "1200.00");
        assert_eq!(Price::from_cents(5).unwrap().to_string(), "0.05");
        assert!(Price::from_cents(-1).is_none());
    }

    #[test]
    fn retailer_group_is_case_insensitive() {
        assert_eq!(RetailerGroup::new(" SEPA "), RetailerGroup::sepa());
        let json = serde_json::to_string(&RetailerGroup::generic()).unwrap();
        assert_eq!(json, "\"generic\"");
        let parsed: RetailerGroup = serde_json::from_str("\"Generic\"").unwrap();
        assert_eq!(parsed, RetailerGroup::generic());
    }
}
