//! Incremental library sync.
//!
//! One sync exchange: decode the device's token, resolve the eligible change
//! set, slice one page, record the delivery, and assemble the wire records.

pub mod paginate;
pub mod resolver;
pub mod response;
pub mod token;

pub use response::SyncItem;
pub use token::{SYNC_TOKEN_HEADER, SyncToken};

use crate::db::Database;
use crate::error::Result;

/// Response header signalling that more pages remain.
pub const SYNC_CONTINUE_HEADER: &str = "x-kobo-sync";
/// Value of [`SYNC_CONTINUE_HEADER`] when a continuation is pending.
pub const SYNC_CONTINUE_VALUE: &str = "continue";

/// Per-request sync parameters.
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// The authenticated user.
    pub user_id: i64,
    /// Restrict the catalog to the user's synced shelves.
    pub only_subscribed_shelves: bool,
    /// Maximum book changes per page.
    pub page_limit: usize,
}

/// Result of one sync exchange.
#[derive(Debug)]
pub struct SyncExchange {
    /// Response body records, in delivery order.
    pub items: Vec<SyncItem>,
    /// Token the device must carry into the next exchange.
    pub token: SyncToken,
    /// Whether the device should sync again immediately.
    pub continuation: bool,
}

/// Run one full sync exchange for a device.
///
/// If the delivery ledger for this user is empty, the submitted token is
/// discarded and the sync restarts from the beginning; a stale cursor
/// pointing past a wiped ledger would otherwise silently skip the whole
/// library. The delivered book ids are recorded in the ledger before the
/// new token is handed out.
pub fn run_sync(db: &Database, ctx: &SyncContext, submitted: SyncToken) -> Result<SyncExchange> {
    let token = if db.sync_ledger_is_empty(ctx.user_id)? {
        SyncToken {
            raw_store_token: submitted.raw_store_token,
            ..SyncToken::default()
        }
    } else {
        submitted
    };

    let resolved = resolver::resolve(db, ctx, &token)?;
    let page = paginate::paginate(resolved, ctx.page_limit, &token);

    let delivered: Vec<i64> = page
        .changes
        .iter()
        .map(|candidate| candidate.change.book().id)
        .collect();
    db.record_synced_books(ctx.user_id, &delivered)?;

    let items = response::assemble(db, ctx, &page)?;

    tracing::debug!(
        user_id = ctx.user_id,
        books = page.changes.len(),
        reading_states = page.reading_states.len(),
        continuation = page.continuation,
        "Sync page delivered"
    );

    Ok(SyncExchange {
        items,
        token: page.token,
        continuation: page.continuation,
    })
}
