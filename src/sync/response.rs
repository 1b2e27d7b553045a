//! Wire records for the device.
//!
//! Builds the ordered JSON array of entitlement / removal / reading-state
//! records out of a paginated change set. Field names and numeric formatting
//! follow what Kobo firmware expects; in particular whole-number progress
//! values must serialize as JSON integers or the device shows a spurious
//! "return to last page read" prompt.

use crate::db::{Book, Database, ReadingState};
use crate::error::Result;
use crate::sync::SyncContext;
use crate::sync::paginate::SyncPage;
use crate::sync::resolver::BookChange;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

/// One element of the sync response array.
///
/// Externally tagged, so each record serializes as a single-key object such
/// as `{"NewEntitlement": {...}}`.
#[derive(Debug, Serialize)]
pub enum SyncItem {
    /// Book the device has never seen.
    NewEntitlement(EntitlementPayload),
    /// Book the device already has; metadata changed or it was removed.
    ChangedEntitlement(EntitlementPayload),
    /// Reading state changed for a book not otherwise in this page.
    ChangedReadingState(ReadingStatePayload),
}

/// Entitlement record body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntitlementPayload {
    /// Access grant for the book.
    pub book_entitlement: BookEntitlement,
    /// Display metadata.
    pub book_metadata: BookMetadata,
    /// Current reading state, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_state: Option<ReadingStateResponse>,
}

/// Standalone reading-state record body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadingStatePayload {
    /// The updated reading state.
    pub reading_state: ReadingStateResponse,
}

/// Access grant for one book.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BookEntitlement {
    /// Access level, always full.
    pub accessibility: &'static str,
    /// Book creation timestamp.
    pub created: String,
    /// Book identifier.
    pub id: String,
    /// Whether the device must remove the book.
    pub is_removed: bool,
    /// Whether the book is hidden from the device archive view.
    pub is_hidden_from_archive: bool,
    /// Whether the entitlement is locked.
    pub is_locked: bool,
    /// Last modification timestamp.
    pub last_modified: String,
    /// Where the entitlement came from.
    pub origin_category: &'static str,
    /// Revision identifier.
    pub revision_id: String,
    /// `"Active"` or `"Deleted"`.
    pub status: &'static str,
}

/// Display metadata for one book.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BookMetadata {
    /// Revision identifier shared across formats.
    pub cross_revision_id: String,
    /// Book identifier this metadata belongs to.
    pub entitlement_id: String,
    /// Revision identifier.
    pub revision_id: String,
    /// Book title.
    pub title: String,
    /// Author names, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributors: Option<Vec<String>>,
}

/// Reading state as sent to the device.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadingStateResponse {
    /// Book creation timestamp.
    pub created: String,
    /// Current bookmark position.
    pub current_bookmark: CurrentBookmark,
    /// Book identifier this state belongs to.
    pub entitlement_id: String,
    /// Last modification timestamp.
    pub last_modified: String,
    /// Conflict-resolution timestamp.
    pub priority_timestamp: String,
    /// Reading status summary.
    pub status_info: StatusInfo,
}

/// Reading status summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusInfo {
    /// Last modification timestamp.
    pub last_modified: String,
    /// `"ReadyToRead"`, `"Reading"` or `"Finished"`.
    pub status: &'static str,
}

/// Bookmark position within a book.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CurrentBookmark {
    /// Last modification timestamp.
    pub last_modified: String,
    /// Percent progress; integer when whole, absent when never reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<Value>,
    /// Source-level percent progress, same formatting rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_source_progress_percent: Option<Value>,
    /// Bookmark location, when the device reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Bookmark location triple.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    /// Location source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Location type, e.g. `"KoboSpan"`.
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Location value, format-specific.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Build the response body for one page.
pub fn assemble(db: &Database, ctx: &SyncContext, page: &SyncPage) -> Result<Vec<SyncItem>> {
    let mut items = Vec::with_capacity(page.changes.len() + page.reading_states.len());
    let mut page_book_ids: HashSet<i64> = HashSet::new();

    for candidate in &page.changes {
        let book = candidate.change.book();
        page_book_ids.insert(book.id);

        let reading_state = db
            .get_reading_state(ctx.user_id, book.id)?
            .map(|state| reading_state_response(&state, book));

        let payload = EntitlementPayload {
            book_entitlement: book_entitlement(book, candidate.change.is_removed()),
            book_metadata: book_metadata(book),
            reading_state,
        };

        items.push(match candidate.change {
            BookChange::New(_) => SyncItem::NewEntitlement(payload),
            BookChange::Changed(_) | BookChange::Removed(_) => {
                SyncItem::ChangedEntitlement(payload)
            }
        });
    }

    for state in &page.reading_states {
        if page_book_ids.contains(&state.book_id) {
            // Already embedded in the entitlement above.
            continue;
        }
        let Some(book) = db.get_book(state.book_id)? else {
            continue;
        };
        items.push(SyncItem::ChangedReadingState(ReadingStatePayload {
            reading_state: reading_state_response(state, &book),
        }));
    }

    Ok(items)
}

fn book_entitlement(book: &Book, removed: bool) -> BookEntitlement {
    BookEntitlement {
        accessibility: "Full",
        created: kobo_timestamp(book.created_at),
        id: book.uuid.clone(),
        is_removed: removed,
        is_hidden_from_archive: false,
        is_locked: false,
        last_modified: kobo_timestamp(book.last_modified),
        origin_category: "Imported",
        revision_id: book.uuid.clone(),
        status: if removed { "Deleted" } else { "Active" },
    }
}

fn book_metadata(book: &Book) -> BookMetadata {
    BookMetadata {
        cross_revision_id: book.uuid.clone(),
        entitlement_id: book.uuid.clone(),
        revision_id: book.uuid.clone(),
        title: book.title.clone(),
        contributors: book.author.clone().map(|author| vec![author]),
    }
}

/// Build the reading-state record for a book. Also used by the standalone
/// reading-state endpoint.
pub fn reading_state_response(state: &ReadingState, book: &Book) -> ReadingStateResponse {
    let status = match state.progress_percent {
        None => "ReadyToRead",
        Some(p) if p >= 100.0 => "Finished",
        Some(_) => "Reading",
    };

    let location = if state.location_value.is_some()
        || state.location_type.is_some()
        || state.location_source.is_some()
    {
        Some(Location {
            source: state.location_source.clone(),
            kind: state.location_type.clone(),
            value: state.location_value.clone(),
        })
    } else {
        None
    };

    ReadingStateResponse {
        created: kobo_timestamp(book.created_at),
        current_bookmark: CurrentBookmark {
            last_modified: kobo_timestamp(state.last_modified),
            progress_percent: progress_value(state.progress_percent),
            content_source_progress_percent: progress_value(
                state.content_source_progress_percent,
            ),
            location,
        },
        entitlement_id: book.uuid.clone(),
        last_modified: kobo_timestamp(state.last_modified),
        priority_timestamp: kobo_timestamp(state.last_modified),
        status_info: StatusInfo {
            last_modified: kobo_timestamp(state.last_modified),
            status,
        },
    }
}

/// Progress number formatting.
///
/// Whole values (including 0) become JSON integers, fractional values stay
/// floats, and an unset value is absent from the record entirely rather than
/// emitted as null or 0.
fn progress_value(value: Option<f64>) -> Option<Value> {
    let v = value?;
    if v.is_finite() && v.fract() == 0.0 && v.abs() <= i64::MAX as f64 {
        Some(Value::from(v as i64))
    } else {
        serde_json::Number::from_f64(v).map(Value::Number)
    }
}

fn kobo_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn bookmark_json(progress: Option<f64>) -> Value {
        let bookmark = CurrentBookmark {
            last_modified: kobo_timestamp(db::now()),
            progress_percent: progress_value(progress),
            content_source_progress_percent: progress_value(progress),
            location: None,
        };
        serde_json::to_value(&bookmark).unwrap()
    }

    #[test]
    fn whole_progress_serializes_as_integer() {
        let json = bookmark_json(Some(33.0));
        assert!(json["ProgressPercent"].is_i64());
        assert_eq!(json["ProgressPercent"], 33);
        assert!(json["ContentSourceProgressPercent"].is_i64());
    }

    #[test]
    fn fractional_progress_stays_float() {
        let json = bookmark_json(Some(33.5));
        assert!(json["ProgressPercent"].is_f64());
        assert_eq!(json["ProgressPercent"], 33.5);
    }

    #[test]
    fn zero_progress_is_present_as_integer() {
        let json = bookmark_json(Some(0.0));
        let object = json.as_object().unwrap();
        assert!(object.contains_key("ProgressPercent"));
        assert_eq!(json["ProgressPercent"], 0);
        assert!(json["ProgressPercent"].is_i64());
    }

    #[test]
    fn unset_progress_is_omitted() {
        let json = bookmark_json(None);
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("ProgressPercent"));
        assert!(!object.contains_key("ContentSourceProgressPercent"));
    }

    #[test]
    fn sync_items_are_externally_tagged() {
        let ts = db::now();
        let book = Book {
            id: 1,
            uuid: "book-uuid".to_string(),
            title: "Title".to_string(),
            author: Some("Author".to_string()),
            created_at: ts,
            last_modified: ts,
            archived: false,
        };
        let item = SyncItem::NewEntitlement(EntitlementPayload {
            book_entitlement: book_entitlement(&book, false),
            book_metadata: book_metadata(&book),
            reading_state: None,
        });

        let json = serde_json::to_value(&item).unwrap();
        let entry = &json["NewEntitlement"];
        assert_eq!(entry["BookEntitlement"]["Id"], "book-uuid");
        assert_eq!(entry["BookEntitlement"]["IsRemoved"], false);
        assert_eq!(entry["BookMetadata"]["Title"], "Title");
    }

    #[test]
    fn archived_book_is_flagged_removed() {
        let ts = db::now();
        let book = Book {
            id: 7,
            uuid: "gone".to_string(),
            title: "Gone".to_string(),
            author: None,
            created_at: ts,
            last_modified: ts,
            archived: true,
        };

        let entitlement = book_entitlement(&book, true);
        let json = serde_json::to_value(&entitlement).unwrap();
        assert_eq!(json["IsRemoved"], true);
        assert_eq!(json["Status"], "Deleted");
    }
}
