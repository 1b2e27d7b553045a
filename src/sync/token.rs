//! Sync token codec.
//!
//! The token is the opaque cursor a device carries between sync exchanges:
//! base64-encoded JSON with per-channel watermarks plus the book id tiebreak.
//! Decoding is total; anything malformed falls back to the zero token, which
//! simply means "sync from the beginning".

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request/response header carrying the token.
pub const SYNC_TOKEN_HEADER: &str = "x-kobo-synctoken";

/// Current token format version.
const VERSION: &str = "1-2-0";

/// Devices strip base64 padding from the header, so decode must not care.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Per-device sync cursor.
///
/// Timestamp fields are watermarks: the last value of that change channel the
/// device has acknowledged. `books_last_id` breaks ties among books sharing
/// `books_last_modified`; -1 means "no tiebreak constraint yet".
#[derive(Debug, Clone, PartialEq)]
pub struct SyncToken {
    /// Opaque upstream store token, passed through untouched.
    pub raw_store_token: String,
    /// Watermark over book creation timestamps.
    pub books_last_created: DateTime<Utc>,
    /// Watermark over book modification timestamps.
    pub books_last_modified: DateTime<Utc>,
    /// Tiebreak id for books sharing `books_last_modified`.
    pub books_last_id: i64,
    /// Watermark over archived-book modification timestamps.
    pub archive_last_modified: DateTime<Utc>,
    /// Watermark over reading state modification timestamps.
    pub reading_state_last_modified: DateTime<Utc>,
    /// Watermark over shelf membership `date_added` timestamps.
    pub tags_last_modified: DateTime<Utc>,
}

impl Default for SyncToken {
    fn default() -> Self {
        Self {
            raw_store_token: String::new(),
            books_last_created: DateTime::UNIX_EPOCH,
            books_last_modified: DateTime::UNIX_EPOCH,
            books_last_id: -1,
            archive_last_modified: DateTime::UNIX_EPOCH,
            reading_state_last_modified: DateTime::UNIX_EPOCH,
            tags_last_modified: DateTime::UNIX_EPOCH,
        }
    }
}

/// Wire envelope: `{"version": "...", "data": {...}}`.
#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    version: String,
    #[serde(default)]
    data: TokenData,
}

/// Wire payload. Timestamps travel as epoch seconds with fractional part.
#[derive(Serialize, Deserialize)]
#[serde(default)]
struct TokenData {
    raw_kobo_store_token: String,
    books_last_created: f64,
    books_last_modified: f64,
    books_last_id: i64,
    archive_last_modified: f64,
    reading_state_last_modified: f64,
    tags_last_modified: f64,
}

impl Default for TokenData {
    fn default() -> Self {
        Self {
            raw_kobo_store_token: String::new(),
            books_last_created: 0.0,
            books_last_modified: 0.0,
            // Pre-1-2-0 tokens have no tiebreak field; -1 matches any id.
            books_last_id: -1,
            archive_last_modified: 0.0,
            reading_state_last_modified: 0.0,
            tags_last_modified: 0.0,
        }
    }
}

impl SyncToken {
    /// Decode a token from the request header value.
    ///
    /// Never fails: a missing, empty, or structurally broken header yields
    /// the zero token.
    pub fn from_header(value: Option<&str>) -> Self {
        value.and_then(Self::decode).unwrap_or_default()
    }

    fn decode(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }

        let bytes = B64.decode(raw).ok()?;
        let envelope: TokenEnvelope = serde_json::from_slice(&bytes).ok()?;
        let data = envelope.data;

        Some(Self {
            raw_store_token: data.raw_kobo_store_token,
            books_last_created: epoch_to_datetime(data.books_last_created),
            books_last_modified: epoch_to_datetime(data.books_last_modified),
            books_last_id: data.books_last_id,
            archive_last_modified: epoch_to_datetime(data.archive_last_modified),
            reading_state_last_modified: epoch_to_datetime(data.reading_state_last_modified),
            tags_last_modified: epoch_to_datetime(data.tags_last_modified),
        })
    }

    /// Encode the token for the response header.
    ///
    /// Always emits the current version and every field, including the
    /// tiebreak id.
    pub fn to_header_value(&self) -> String {
        let envelope = TokenEnvelope {
            version: VERSION.to_string(),
            data: TokenData {
                raw_kobo_store_token: self.raw_store_token.clone(),
                books_last_created: datetime_to_epoch(self.books_last_created),
                books_last_modified: datetime_to_epoch(self.books_last_modified),
                books_last_id: self.books_last_id,
                archive_last_modified: datetime_to_epoch(self.archive_last_modified),
                reading_state_last_modified: datetime_to_epoch(self.reading_state_last_modified),
                tags_last_modified: datetime_to_epoch(self.tags_last_modified),
            },
        };

        // Serializing a struct of primitives cannot fail.
        let json = serde_json::to_vec(&envelope).unwrap_or_default();
        B64.encode(json)
    }
}

/// Epoch seconds, microsecond precision preserved in the fraction.
fn datetime_to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

fn epoch_to_datetime(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return DateTime::UNIX_EPOCH;
    }

    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missing_header_yields_zero_token() {
        let token = SyncToken::from_header(None);
        assert_eq!(token, SyncToken::default());
        assert_eq!(token.books_last_id, -1);
    }

    #[test]
    fn malformed_header_yields_zero_token() {
        for junk in ["", "stub", "!!!not-base64!!!", "aGVsbG8="] {
            assert_eq!(SyncToken::from_header(Some(junk)), SyncToken::default());
        }
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let mut token = SyncToken::default();
        token.books_last_modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap()
            + chrono::Duration::microseconds(250_000);
        token.books_last_id = 42;
        token.tags_last_modified = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();
        token.raw_store_token = "upstream".to_string();

        let decoded = SyncToken::from_header(Some(&token.to_header_value()));
        assert_eq!(decoded, token);
    }

    #[test]
    fn legacy_token_without_tiebreak_defaults_to_minus_one() {
        let json = serde_json::json!({
            "version": "1-1-0",
            "data": {
                "raw_kobo_store_token": "",
                "books_last_created": 1_700_000_000.0,
                "books_last_modified": 1_700_000_000.0,
                "archive_last_modified": 0.0,
                "reading_state_last_modified": 0.0,
                "tags_last_modified": 0.0,
            }
        });
        let header = B64.encode(json.to_string());

        let token = SyncToken::from_header(Some(&header));
        assert_eq!(token.books_last_id, -1);
        assert_ne!(token.books_last_modified, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn decode_accepts_unpadded_base64() {
        let token = SyncToken::default();
        let header = token.to_header_value();
        let trimmed = header.trim_end_matches('=');

        assert_eq!(SyncToken::from_header(Some(trimmed)), token);
    }
}
