//! Ingress message shape, validation, and the internal `CandleRecord` type.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// Timestamps arrive either as an epoch integer or an ISO-8601 string.
/// `serde(untagged)` tries each variant in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Iso(String),
}

impl RawTimestamp {
    fn coerce(&self, field: &'static str) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            RawTimestamp::Epoch(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| ValidationError::InvalidTimestamp { field, value: secs.to_string() }),
            RawTimestamp::Iso(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ValidationError::InvalidTimestamp { field, value: s.clone() }),
        }
    }
}

/// Wire shape of a candle message as it arrives from the source, before
/// coercion and range validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCandleMessage {
    pub event_time: RawTimestamp,
    pub symbol: String,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: f64,
    pub start_time: RawTimestamp,
    pub timestamp: RawTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Decode(String),
    InvalidTimestamp { field: &'static str, value: String },
    NegativeOrNonFinite { field: &'static str, value: f64 },
    InvalidSymbol { symbol: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "message decode failed: {e}"),
            Self::InvalidTimestamp { field, value } => {
                write!(f, "invalid timestamp in field {field}: {value}")
            }
            Self::NegativeOrNonFinite { field, value } => {
                write!(f, "field {field} must be finite and non-negative, got {value}")
            }
            Self::InvalidSymbol { symbol } => {
                write!(f, "symbol must be non-empty and at most 20 bytes, got {symbol:?}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Fully validated, internal representation of a candle. Every field has
/// already passed range and shape checks by the time one of these exists.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRecord {
    pub event_time: DateTime<Utc>,
    pub symbol: String,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: f64,
    pub start_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<RawCandleMessage> for CandleRecord {
    type Error = ValidationError;

    fn try_from(raw: RawCandleMessage) -> Result<Self, Self::Error> {
        let event_time = raw.event_time.coerce("event_time")?;
        let start_time = raw.start_time.coerce("start_time")?;
        let timestamp = raw.timestamp.coerce("timestamp")?;

        check_numeric("open_price", raw.open_price)?;
        check_numeric("high_price", raw.high_price)?;
        check_numeric("low_price", raw.low_price)?;
        check_numeric("close_price", raw.close_price)?;
        check_numeric("volume", raw.volume)?;

        if raw.symbol.is_empty() || raw.symbol.len() > 20 {
            return Err(ValidationError::InvalidSymbol { symbol: raw.symbol });
        }

        Ok(CandleRecord {
            event_time,
            symbol: raw.symbol.to_uppercase(),
            open_price: raw.open_price,
            high_price: raw.high_price,
            low_price: raw.low_price,
            close_price: raw.close_price,
            volume: raw.volume,
            start_time,
            timestamp,
        })
    }
}

fn check_numeric(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::NegativeOrNonFinite { field, value });
    }
    Ok(())
}

/// Parse and validate a raw JSON payload in one step, as the processor does
/// at the ingress boundary.
pub fn parse_message(raw_value: &[u8]) -> Result<CandleRecord, ValidationError> {
    let raw: RawCandleMessage =
        serde_json::from_slice(raw_value).map_err(|e| ValidationError::Decode(e.to_string()))?;
    CandleRecord::try_from(raw)
}
