mod schema;

pub use schema::Database;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalog book entry.
///
/// `id` is the stable, monotonically assigned pagination key; `uuid` is the
/// identifier exposed to devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Row id, assigned by the database.
    pub id: i64,
    /// External identifier sent to devices.
    pub uuid: String,
    /// Book title.
    pub title: String,
    /// Primary author.
    pub author: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last metadata modification timestamp.
    pub last_modified: DateTime<Utc>,
    /// Whether the book has been archived (removed from devices).
    pub archived: bool,
}

/// User shelf (collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shelf {
    /// Row id.
    pub id: i64,
    /// Owning user id.
    pub user_id: i64,
    /// External identifier.
    pub uuid: String,
    /// Shelf name.
    pub name: String,
    /// Whether this shelf is synced to Kobo devices.
    pub kobo_sync: bool,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last modification timestamp.
    pub last_modified: DateTime<Utc>,
}

/// Membership of a book on a shelf.
#[derive(Debug, Clone)]
pub struct ShelfBook {
    /// Shelf row id.
    pub shelf_id: i64,
    /// Book row id.
    pub book_id: i64,
    /// When the book was added to the shelf.
    pub date_added: DateTime<Utc>,
}

/// Per-user reading state for a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingState {
    /// User row id.
    pub user_id: i64,
    /// Book row id.
    pub book_id: i64,
    /// Last modification timestamp.
    pub last_modified: DateTime<Utc>,
    /// Reading progress (0.0 - 100.0), None if never reported.
    pub progress_percent: Option<f64>,
    /// Source-level progress (e.g. page-based), None if never reported.
    pub content_source_progress_percent: Option<f64>,
    /// Bookmark location value (e.g. a spine position).
    pub location_value: Option<String>,
    /// Bookmark location type (e.g. "KoboSpan").
    pub location_type: Option<String>,
    /// Bookmark location source.
    pub location_source: Option<String>,
}

/// User account with a device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Row id.
    pub id: i64,
    /// Username.
    pub name: String,
    /// Token embedded in device request paths.
    #[serde(skip_serializing)]
    pub device_token: String,
    /// Sync only books on kobo_sync shelves instead of the whole catalog.
    pub shelves_only_sync: bool,
    /// Account creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Current time, truncated to microsecond precision.
///
/// Everything downstream (stored text, sync token epoch values) carries at
/// most microseconds, so truncating here keeps in-memory timestamps equal to
/// their stored/round-tripped counterparts.
pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse a stored timestamp into a canonical UTC instant.
///
/// SQLite columns hold text in `YYYY-MM-DD HH:MM:SS[.ffffff]` form, sometimes
/// with a trailing `+00:00` or `Z` suffix and sometimes with a `T` separator.
/// All variants of the same instant must compare equal, so every row passes
/// through here before any comparison. Unparseable values fall back to the
/// Unix epoch (treated as "always eligible" rather than failing the request).
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    let mut value = raw.trim();
    for suffix in ["+00:00", "+0000", "Z"] {
        if let Some(stripped) = value.strip_suffix(suffix) {
            value = stripped.trim_end();
            break;
        }
    }
    let normalized = value.replace('T', " ");

    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Format a timestamp for storage.
///
/// Written with the `+00:00` suffix, matching what upstream library managers
/// put into the same columns; `parse_timestamp` strips it again on read.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f+00:00").to_string()
}
