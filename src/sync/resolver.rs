//! Change-set resolution.
//!
//! Given the device's sync token, produce every catalog and reading-state
//! change the device has not yet acknowledged, ordered and deduplicated.
//! Pagination is not applied here; the controller slices the result.

use crate::db::{Book, Database, ReadingState};
use crate::error::Result;
use crate::sync::SyncContext;
use crate::sync::token::SyncToken;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// A catalog change classified for delivery.
#[derive(Debug, Clone)]
pub enum BookChange {
    /// Never delivered to this user before.
    New(Book),
    /// Delivered before, metadata changed since.
    Changed(Book),
    /// Archived; the device must drop it.
    Removed(Book),
}

impl BookChange {
    /// The catalog item behind this change.
    pub fn book(&self) -> &Book {
        match self {
            BookChange::New(book) | BookChange::Changed(book) | BookChange::Removed(book) => book,
        }
    }

    /// Whether this change removes the book from the device.
    pub fn is_removed(&self) -> bool {
        matches!(self, BookChange::Removed(_))
    }
}

/// One resolved change, carrying the shelf membership timestamp that is
/// relevant for the tags watermark (shelves-only mode).
#[derive(Debug, Clone)]
pub struct ChangeCandidate {
    /// The classified change.
    pub change: BookChange,
    /// Latest `date_added` among the user's synced-shelf memberships of
    /// this book, when resolved through shelves.
    pub date_added: Option<DateTime<Utc>>,
}

/// Full eligible change set for one sync exchange, before pagination.
#[derive(Debug)]
pub struct Resolved {
    /// Book changes ordered by `(last_modified, id)` ascending.
    pub changes: Vec<ChangeCandidate>,
    /// Reading states modified past the device's watermark.
    pub reading_states: Vec<ReadingState>,
}

/// Compound watermark predicate.
///
/// The id tiebreak is mandatory: without it, a set of items sharing one
/// timestamp either never advances past that timestamp or is skipped
/// wholesale once the watermark reaches it.
fn past_watermark(
    ts: DateTime<Utc>,
    id: i64,
    watermark: DateTime<Utc>,
    watermark_id: i64,
) -> bool {
    ts > watermark || (ts == watermark && id > watermark_id)
}

/// Resolve every change the device has not acknowledged yet.
pub fn resolve(db: &Database, ctx: &SyncContext, token: &SyncToken) -> Result<Resolved> {
    let ledger = db.synced_book_ids(ctx.user_id)?;

    // Keyed by the pagination sort key; one entry per book id.
    let mut ordered: BTreeMap<(DateTime<Utc>, i64), ChangeCandidate> = BTreeMap::new();

    if ctx.only_subscribed_shelves {
        // Fold per-shelf membership rows down to one row per book carrying
        // the latest date_added; a book on three synced shelves must still
        // yield exactly one change.
        let mut per_book: BTreeMap<i64, (Book, DateTime<Utc>)> = BTreeMap::new();
        for (book, date_added) in db.kobo_shelf_books(ctx.user_id)? {
            per_book
                .entry(book.id)
                .and_modify(|(_, latest)| {
                    if date_added > *latest {
                        *latest = date_added;
                    }
                })
                .or_insert((book, date_added));
        }

        for (book, date_added) in per_book.into_values() {
            // Two independent triggers: a fresh shelf add with untouched
            // metadata and a metadata edit with untouched shelf membership
            // must both qualify. The tags side is strict: date_added values
            // are assigned at add time and the watermark advances to the
            // newest delivered one, so an equality branch here would
            // re-deliver the same shelf add on every exchange.
            let shelf_trigger = date_added > token.tags_last_modified;
            let book_trigger = past_watermark(
                book.last_modified,
                book.id,
                token.books_last_modified,
                token.books_last_id,
            );
            if !(shelf_trigger || book_trigger) {
                continue;
            }

            let key = (book.last_modified, book.id);
            let change = classify(book, &ledger);
            ordered.insert(
                key,
                ChangeCandidate {
                    change,
                    date_added: Some(date_added),
                },
            );
        }
    } else {
        for book in db.all_books()? {
            if !past_watermark(
                book.last_modified,
                book.id,
                token.books_last_modified,
                token.books_last_id,
            ) {
                continue;
            }

            let key = (book.last_modified, book.id);
            let change = classify(book, &ledger);
            ordered.insert(
                key,
                ChangeCandidate {
                    change,
                    date_added: None,
                },
            );
        }
    }

    let reading_states = db
        .reading_states_for_user(ctx.user_id)?
        .into_iter()
        .filter(|state| state.last_modified > token.reading_state_last_modified)
        .collect();

    Ok(Resolved {
        changes: ordered.into_values().collect(),
        reading_states,
    })
}

fn classify(book: Book, ledger: &HashSet<i64>) -> BookChange {
    if book.archived {
        BookChange::Removed(book)
    } else if ledger.contains(&book.id) {
        BookChange::Changed(book)
    } else {
        BookChange::New(book)
    }
}
