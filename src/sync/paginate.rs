//! Page slicing and token advancement.

use crate::db::ReadingState;
use crate::sync::resolver::{ChangeCandidate, Resolved};
use crate::sync::token::SyncToken;

/// One bounded page of a sync exchange.
#[derive(Debug)]
pub struct SyncPage {
    /// Book changes included in this page, in delivery order.
    pub changes: Vec<ChangeCandidate>,
    /// Reading-state changes delivered alongside the page.
    pub reading_states: Vec<ReadingState>,
    /// Whether more pages remain after this one.
    pub continuation: bool,
    /// Token to hand back to the device.
    pub token: SyncToken,
}

/// Slice the resolved change set to one page and advance the token.
///
/// The book watermark pair advances to the `(last_modified, id)` of the last
/// item actually included, never beyond it, so an interrupted device resumes
/// exactly after the last delivered item. Every watermark is advanced with a
/// `max` against the incoming value: a shelf add can legitimately deliver a
/// book whose `last_modified` is older than the current watermark, and that
/// delivery must not drag the watermark backwards.
pub fn paginate(resolved: Resolved, limit: usize, incoming: &SyncToken) -> SyncPage {
    let Resolved {
        mut changes,
        reading_states,
    } = resolved;

    // Strictly more than `limit` means another page; exactly `limit` means
    // the page is complete, not merely full.
    let continuation = changes.len() > limit;
    changes.truncate(limit);

    let mut token = incoming.clone();

    if let Some(last) = changes.last() {
        let book = last.change.book();
        if (book.last_modified, book.id) > (token.books_last_modified, token.books_last_id) {
            token.books_last_modified = book.last_modified;
            token.books_last_id = book.id;
        }
    }

    for candidate in &changes {
        let book = candidate.change.book();
        token.books_last_created = token.books_last_created.max(book.created_at);

        if let Some(date_added) = candidate.date_added {
            // Must cover the membership date_added, not the shelf's own
            // last_modified; otherwise shelf-triggered adds repeat forever.
            token.tags_last_modified = token.tags_last_modified.max(date_added);
        }

        if candidate.change.is_removed() {
            token.archive_last_modified = token.archive_last_modified.max(book.last_modified);
        }
    }

    for state in &reading_states {
        token.reading_state_last_modified =
            token.reading_state_last_modified.max(state.last_modified);
    }

    SyncPage {
        changes,
        reading_states,
        continuation,
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Book;
    use crate::sync::resolver::BookChange;
    use chrono::{DateTime, TimeZone, Utc};

    fn book(id: i64, last_modified: DateTime<Utc>) -> Book {
        Book {
            id,
            uuid: format!("uuid-{id}"),
            title: format!("Book {id}"),
            author: None,
            created_at: last_modified,
            last_modified,
            archived: false,
        }
    }

    fn candidates(count: usize, ts: DateTime<Utc>) -> Vec<ChangeCandidate> {
        (1..=count as i64)
            .map(|id| ChangeCandidate {
                change: BookChange::New(book(id, ts)),
                date_added: None,
            })
            .collect()
    }

    #[test]
    fn exactly_limit_is_not_a_continuation() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let resolved = Resolved {
            changes: candidates(3, ts),
            reading_states: Vec::new(),
        };

        let page = paginate(resolved, 3, &SyncToken::default());
        assert_eq!(page.changes.len(), 3);
        assert!(!page.continuation);
    }

    #[test]
    fn over_limit_sets_continuation_and_stops_at_last_included() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let resolved = Resolved {
            changes: candidates(5, ts),
            reading_states: Vec::new(),
        };

        let page = paginate(resolved, 3, &SyncToken::default());
        assert!(page.continuation);
        assert_eq!(page.token.books_last_modified, ts);
        assert_eq!(page.token.books_last_id, 3);
    }

    #[test]
    fn book_watermark_never_regresses() {
        let old_ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut incoming = SyncToken::default();
        incoming.books_last_modified = old_ts;
        incoming.books_last_id = 10;

        // Shelf add delivers a book with an older last_modified.
        let stale_ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let resolved = Resolved {
            changes: vec![ChangeCandidate {
                change: BookChange::New(book(3, stale_ts)),
                date_added: Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()),
            }],
            reading_states: Vec::new(),
        };

        let page = paginate(resolved, 50, &incoming);
        assert_eq!(page.token.books_last_modified, old_ts);
        assert_eq!(page.token.books_last_id, 10);
        assert_eq!(
            page.token.tags_last_modified,
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
        );
    }
}
