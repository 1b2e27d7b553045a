use crate::db::{self, Book, Database, ReadingState, Shelf, User};
use crate::sync::resolver::BookChange;
use crate::sync::{self, SyncContext, SyncExchange, SyncItem, SyncToken};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn ts(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
}

fn create_user(db: &Database, name: &str, shelves_only: bool) -> User {
    let user = User {
        id: 0,
        name: name.to_string(),
        device_token: format!("token-{}", name),
        shelves_only_sync: shelves_only,
        created_at: ts(0),
    };
    db.create_user(&user).unwrap();
    db.get_user_by_name(name).unwrap().unwrap()
}

fn add_book_at(db: &Database, title: &str, last_modified: DateTime<Utc>) -> Book {
    let book = Book {
        id: 0,
        uuid: format!("uuid-{}", title),
        title: title.to_string(),
        author: None,
        created_at: last_modified,
        last_modified,
        archived: false,
    };
    let id = db.add_book(&book).unwrap();
    db.get_book(id).unwrap().unwrap()
}

/// Seed `count` books with strictly increasing last_modified.
fn seed_books(db: &Database, count: usize) -> Vec<Book> {
    (0..count)
        .map(|i| add_book_at(db, &format!("book-{}", i), ts(i as i64 * 60)))
        .collect()
}

fn create_shelf(db: &Database, user_id: i64, name: &str, kobo_sync: bool) -> Shelf {
    let shelf = Shelf {
        id: 0,
        user_id,
        uuid: format!("shelf-{}", name),
        name: name.to_string(),
        kobo_sync,
        created: ts(0),
        last_modified: ts(0),
    };
    let id = db.create_shelf(&shelf).unwrap();
    db.get_shelf_by_uuid(&shelf.uuid).unwrap().unwrap();
    Shelf { id, ..shelf }
}

fn ctx(user: &User, page_limit: usize) -> SyncContext {
    SyncContext {
        user_id: user.id,
        only_subscribed_shelves: user.shelves_only_sync,
        page_limit,
    }
}

fn run(db: &Database, ctx: &SyncContext, token: SyncToken) -> SyncExchange {
    sync::run_sync(db, ctx, token).unwrap()
}

/// Entitlement ids (book uuids) in delivery order, skipping reading states.
fn entitlement_ids(items: &[SyncItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            SyncItem::NewEntitlement(p) | SyncItem::ChangedEntitlement(p) => {
                Some(p.book_entitlement.id.clone())
            }
            SyncItem::ChangedReadingState(_) => None,
        })
        .collect()
}

fn new_count(items: &[SyncItem]) -> usize {
    items
        .iter()
        .filter(|item| matches!(item, SyncItem::NewEntitlement(_)))
        .count()
}

fn changed_count(items: &[SyncItem]) -> usize {
    items
        .iter()
        .filter(|item| matches!(item, SyncItem::ChangedEntitlement(_)))
        .count()
}

// ========== FULL-CATALOG SYNC ==========

#[test]
fn first_sync_delivers_all_books_as_new() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 3);

    let exchange = run(&db, &ctx(&user, 100), SyncToken::default());

    assert_eq!(new_count(&exchange.items), 3);
    assert!(!exchange.continuation);
    let ids = entitlement_ids(&exchange.items);
    assert_eq!(ids, books.iter().map(|b| b.uuid.clone()).collect::<Vec<_>>());

    let ledger = db.synced_book_ids(user.id).unwrap();
    assert_eq!(ledger.len(), 3);
}

#[test]
fn second_sync_with_returned_token_is_quiescent() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    seed_books(&db, 3);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    let second = run(&db, &ctx(&user, 100), first.token);

    assert!(second.items.is_empty());
    assert!(!second.continuation);
}

#[test]
fn token_roundtrips_through_the_header_between_exchanges() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    seed_books(&db, 2);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    let header = first.token.to_header_value();
    let resubmitted = SyncToken::from_header(Some(&header));
    assert_eq!(resubmitted, first.token);

    let second = run(&db, &ctx(&user, 100), resubmitted);
    assert!(second.items.is_empty());
}

#[test]
fn exact_limit_page_is_not_a_continuation() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    seed_books(&db, 5);

    let exchange = run(&db, &ctx(&user, 5), SyncToken::default());

    assert_eq!(exchange.items.len(), 5);
    assert!(!exchange.continuation);

    let next = run(&db, &ctx(&user, 5), exchange.token);
    assert!(next.items.is_empty());
}

#[test]
fn over_limit_paginates_without_repeats() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    seed_books(&db, 7);
    let sync_ctx = ctx(&user, 3);

    let page1 = run(&db, &sync_ctx, SyncToken::default());
    assert_eq!(page1.items.len(), 3);
    assert!(page1.continuation);

    let page2 = run(&db, &sync_ctx, page1.token);
    assert_eq!(page2.items.len(), 3);
    assert!(page2.continuation);

    let page3 = run(&db, &sync_ctx, page2.token);
    assert_eq!(page3.items.len(), 1);
    assert!(!page3.continuation);

    let ids1: HashSet<_> = entitlement_ids(&page1.items).into_iter().collect();
    let ids2: HashSet<_> = entitlement_ids(&page2.items).into_iter().collect();
    let ids3: HashSet<_> = entitlement_ids(&page3.items).into_iter().collect();
    assert!(ids1.is_disjoint(&ids2));
    assert!(ids1.is_disjoint(&ids3));
    assert!(ids2.is_disjoint(&ids3));
    assert_eq!(ids1.len() + ids2.len() + ids3.len(), 7);
}

#[test]
fn duplicate_timestamps_paginate_without_skips_or_repeats() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    // A bulk import: every book shares one last_modified value, so only the
    // id tiebreak separates the pages.
    let shared = ts(0);
    for i in 0..150 {
        add_book_at(&db, &format!("bulk-{}", i), shared);
    }
    let sync_ctx = ctx(&user, 50);

    let mut token = SyncToken::default();
    let mut seen: HashSet<String> = HashSet::new();
    for page in 0..3 {
        let exchange = run(&db, &sync_ctx, token);
        assert_eq!(exchange.items.len(), 50, "page {}", page);
        for id in entitlement_ids(&exchange.items) {
            assert!(seen.insert(id), "book repeated across pages");
        }
        token = exchange.token;
    }
    assert_eq!(seen.len(), 150);

    let final_exchange = run(&db, &sync_ctx, token);
    assert!(final_exchange.items.is_empty());
    assert!(!final_exchange.continuation);
}

#[test]
fn modified_book_is_resent_as_changed() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 3);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());

    db.touch_book(&books[1].uuid, ts(3600)).unwrap();

    let second = run(&db, &ctx(&user, 100), first.token);
    assert_eq!(second.items.len(), 1);
    assert_eq!(changed_count(&second.items), 1);
    assert_eq!(entitlement_ids(&second.items), vec![books[1].uuid.clone()]);

    let third = run(&db, &ctx(&user, 100), second.token);
    assert!(third.items.is_empty());
}

#[test]
fn archived_book_is_delivered_as_removal() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 2);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());

    db.archive_book(&books[0].uuid, ts(3600)).unwrap();

    let second = run(&db, &ctx(&user, 100), first.token);
    assert_eq!(second.items.len(), 1);

    let json = serde_json::to_value(&second.items[0]).unwrap();
    let entitlement = &json["ChangedEntitlement"]["BookEntitlement"];
    assert_eq!(entitlement["Id"], books[0].uuid.as_str());
    assert_eq!(entitlement["IsRemoved"], true);
    assert_eq!(entitlement["Status"], "Deleted");

    let third = run(&db, &ctx(&user, 100), second.token);
    assert!(third.items.is_empty());
}

#[test]
fn empty_ledger_forces_full_resync_despite_future_token() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    seed_books(&db, 3);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(first.items.len(), 3);

    db.reset_sync_ledger(user.id).unwrap();

    // A token claiming everything was seen far in the future. With the
    // ledger wiped it must be discarded, not honored.
    let stale = SyncToken {
        books_last_modified: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
        books_last_created: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
        books_last_id: 9999,
        ..SyncToken::default()
    };

    let resync = run(&db, &ctx(&user, 100), stale);
    assert_eq!(new_count(&resync.items), 3);
}

// ========== SHELVES-ONLY MODE ==========

#[test]
fn shelves_only_limits_catalog_to_synced_shelves() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    let books = seed_books(&db, 2);
    let shelf = create_shelf(&db, user.id, "reading", true);
    db.add_book_to_shelf(shelf.id, books[0].id, ts(300)).unwrap();

    let exchange = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(entitlement_ids(&exchange.items), vec![books[0].uuid.clone()]);
}

#[test]
fn shelves_only_ignores_unsynced_shelves() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    let books = seed_books(&db, 1);
    let shelf = create_shelf(&db, user.id, "private", false);
    db.add_book_to_shelf(shelf.id, books[0].id, ts(300)).unwrap();

    let exchange = run(&db, &ctx(&user, 100), SyncToken::default());
    assert!(exchange.items.is_empty());
}

#[test]
fn shelves_only_does_not_repeat_books_after_sync() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    let books = seed_books(&db, 3);
    let shelf = create_shelf(&db, user.id, "reading", true);
    for book in &books {
        db.add_book_to_shelf(shelf.id, book.id, ts(300)).unwrap();
    }

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(first.items.len(), 3);

    let second = run(&db, &ctx(&user, 100), first.token);
    assert!(second.items.is_empty());
}

#[test]
fn shelves_only_shelf_add_triggers_resync_then_quiescent() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    // The stale book predates the others, so only the shelf membership can
    // trigger its delivery.
    let stale = add_book_at(&db, "stale", ts(-86400));
    let books = seed_books(&db, 2);
    let shelf = create_shelf(&db, user.id, "reading", true);
    for book in &books {
        db.add_book_to_shelf(shelf.id, book.id, ts(300)).unwrap();
    }

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(first.items.len(), 2);

    db.add_book_to_shelf(shelf.id, stale.id, ts(600)).unwrap();

    let second = run(&db, &ctx(&user, 100), first.token);
    assert_eq!(entitlement_ids(&second.items), vec![stale.uuid.clone()]);

    let third = run(&db, &ctx(&user, 100), second.token);
    assert!(third.items.is_empty());
}

#[test]
fn shelves_only_metadata_edit_triggers_resync() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    let books = seed_books(&db, 2);
    let shelf = create_shelf(&db, user.id, "reading", true);
    for book in &books {
        db.add_book_to_shelf(shelf.id, book.id, ts(300)).unwrap();
    }

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(first.items.len(), 2);

    db.touch_book(&books[0].uuid, ts(7200)).unwrap();

    let second = run(&db, &ctx(&user, 100), first.token);
    assert_eq!(entitlement_ids(&second.items), vec![books[0].uuid.clone()]);
    assert_eq!(changed_count(&second.items), 1);

    let third = run(&db, &ctx(&user, 100), second.token);
    assert!(third.items.is_empty());
}

#[test]
fn book_on_multiple_shelves_is_delivered_once() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    let books = seed_books(&db, 1);
    for name in ["a", "b", "c"] {
        let shelf = create_shelf(&db, user.id, name, true);
        db.add_book_to_shelf(shelf.id, books[0].id, ts(300)).unwrap();
    }

    let exchange = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(exchange.items.len(), 1);
    assert_eq!(entitlement_ids(&exchange.items), vec![books[0].uuid.clone()]);
}

#[test]
fn shelves_only_paginates_without_repeats() {
    let db = test_db();
    let user = create_user(&db, "bob", true);
    let books = seed_books(&db, 5);
    let shelf = create_shelf(&db, user.id, "reading", true);
    for book in &books {
        db.add_book_to_shelf(shelf.id, book.id, ts(300)).unwrap();
    }
    let sync_ctx = ctx(&user, 3);

    let page1 = run(&db, &sync_ctx, SyncToken::default());
    assert_eq!(page1.items.len(), 3);
    assert!(page1.continuation);

    let page2 = run(&db, &sync_ctx, page1.token);
    assert_eq!(page2.items.len(), 2);
    assert!(!page2.continuation);

    let ids1: HashSet<_> = entitlement_ids(&page1.items).into_iter().collect();
    let ids2: HashSet<_> = entitlement_ids(&page2.items).into_iter().collect();
    assert!(ids1.is_disjoint(&ids2));
    assert_eq!(ids1.len() + ids2.len(), 5);

    let page3 = run(&db, &sync_ctx, page2.token);
    assert!(page3.items.is_empty());
}

// ========== READING STATES ==========

fn save_progress(db: &Database, user_id: i64, book_id: i64, at: DateTime<Utc>, percent: f64) {
    db.save_reading_state(&ReadingState {
        user_id,
        book_id,
        last_modified: at,
        progress_percent: Some(percent),
        content_source_progress_percent: Some(percent),
        location_value: None,
        location_type: None,
        location_source: None,
    })
    .unwrap();
}

#[test]
fn reading_state_change_is_delivered_once() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 1);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(first.items.len(), 1);

    save_progress(&db, user.id, books[0].id, ts(3600), 42.5);

    let second = run(&db, &ctx(&user, 100), first.token);
    assert_eq!(second.items.len(), 1);
    assert!(matches!(second.items[0], SyncItem::ChangedReadingState(_)));

    let json = serde_json::to_value(&second.items[0]).unwrap();
    let state = &json["ChangedReadingState"]["ReadingState"];
    assert_eq!(state["EntitlementId"], books[0].uuid.as_str());
    assert_eq!(state["CurrentBookmark"]["ProgressPercent"], 42.5);
    assert_eq!(state["StatusInfo"]["Status"], "Reading");

    let third = run(&db, &ctx(&user, 100), second.token);
    assert!(third.items.is_empty());
}

#[test]
fn reading_state_is_embedded_in_the_entitlement() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 1);
    save_progress(&db, user.id, books[0].id, ts(120), 10.0);

    let exchange = run(&db, &ctx(&user, 100), SyncToken::default());

    // One entitlement carrying the state, no standalone record.
    assert_eq!(exchange.items.len(), 1);
    match &exchange.items[0] {
        SyncItem::NewEntitlement(payload) => assert!(payload.reading_state.is_some()),
        other => panic!("expected NewEntitlement, got {:?}", other),
    }

    let quiescent = run(&db, &ctx(&user, 100), exchange.token);
    assert!(quiescent.items.is_empty());
}

#[test]
fn finished_book_reports_finished_status() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 1);
    save_progress(&db, user.id, books[0].id, ts(120), 100.0);

    let exchange = run(&db, &ctx(&user, 100), SyncToken::default());
    let json = serde_json::to_value(&exchange.items[0]).unwrap();
    let state = &json["NewEntitlement"]["ReadingState"];
    assert_eq!(state["StatusInfo"]["Status"], "Finished");
    // Whole-number progress serializes as an integer.
    assert_eq!(state["CurrentBookmark"]["ProgressPercent"], 100);
    assert!(state["CurrentBookmark"]["ProgressPercent"].is_i64());
}

// ========== TIMESTAMP NORMALIZATION ==========

#[test]
fn stored_timestamp_suffix_variants_compare_equal() {
    let instant = db::parse_timestamp("2024-03-01 12:30:45.123456");
    assert_eq!(db::parse_timestamp("2024-03-01 12:30:45.123456+00:00"), instant);
    assert_eq!(db::parse_timestamp("2024-03-01 12:30:45.123456+0000"), instant);
    assert_eq!(db::parse_timestamp("2024-03-01 12:30:45.123456Z"), instant);
    assert_eq!(db::parse_timestamp("2024-03-01T12:30:45.123456"), instant);
}

#[test]
fn unparseable_timestamp_falls_back_to_epoch() {
    assert_eq!(db::parse_timestamp("not a date"), DateTime::UNIX_EPOCH);
    assert_eq!(db::parse_timestamp(""), DateTime::UNIX_EPOCH);
}

#[test]
fn database_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.db");

    {
        let db = Database::open(&path).unwrap();
        create_user(&db, "alice", false);
        seed_books(&db, 2);
    }

    let db = Database::open(&path).unwrap();
    assert!(db.get_user_by_name("alice").unwrap().is_some());
    assert_eq!(db.all_books().unwrap().len(), 2);
}

#[test]
fn stored_timestamps_roundtrip_through_the_database() {
    let db = test_db();
    let written = ts(12345) + Duration::microseconds(654_321);
    let book = add_book_at(&db, "roundtrip", written);
    assert_eq!(book.last_modified, written);
    assert_eq!(book.created_at, written);
}

// ========== MIXED FLOWS ==========

#[test]
fn mixed_new_and_changed_books_classify_correctly() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 2);

    let first = run(&db, &ctx(&user, 100), SyncToken::default());
    assert_eq!(new_count(&first.items), 2);

    db.touch_book(&books[0].uuid, ts(3600)).unwrap();
    let late = add_book_at(&db, "late", ts(3700));

    let second = run(&db, &ctx(&user, 100), first.token);
    assert_eq!(second.items.len(), 2);
    assert_eq!(changed_count(&second.items), 1);
    assert_eq!(new_count(&second.items), 1);
    assert_eq!(
        entitlement_ids(&second.items),
        vec![books[0].uuid.clone(), late.uuid.clone()]
    );
}

#[test]
fn resolver_classifies_against_the_ledger() {
    let db = test_db();
    let user = create_user(&db, "alice", false);
    let books = seed_books(&db, 2);
    db.record_synced_books(user.id, &[books[0].id]).unwrap();

    let resolved =
        sync::resolver::resolve(&db, &ctx(&user, 100), &SyncToken::default()).unwrap();
    assert_eq!(resolved.changes.len(), 2);
    assert!(matches!(resolved.changes[0].change, BookChange::Changed(_)));
    assert!(matches!(resolved.changes[1].change, BookChange::New(_)));
}
