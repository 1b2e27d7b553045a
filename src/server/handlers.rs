//! Request handlers for the Kobo device API.

use crate::auth;
use crate::db;
use crate::error::{AppError, Result};
use crate::server::AppState;
use crate::sync::{
    self, SYNC_CONTINUE_HEADER, SYNC_CONTINUE_VALUE, SYNC_TOKEN_HEADER, SyncContext, SyncToken,
};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

/// GET /kobo/{device_token}/v1/library/sync
///
/// One sync exchange. The updated token is returned in the sync token header
/// on every response; the continuation header is present only when more pages
/// remain.
pub async fn sync(
    State(state): State<AppState>,
    Path(device_token): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let user = auth::authenticate_device(&state.db, &device_token)?;

    let submitted = SyncToken::from_header(
        headers
            .get(SYNC_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok()),
    );

    let ctx = SyncContext {
        user_id: user.id,
        only_subscribed_shelves: user.shelves_only_sync,
        page_limit: state.config.sync.page_limit,
    };

    let exchange = sync::run_sync(&state.db, &ctx, submitted)?;

    let mut response = Json(exchange.items).into_response();
    let token_value = HeaderValue::from_str(&exchange.token.to_header_value())
        .map_err(|e| AppError::Internal(format!("Failed to encode sync token: {}", e)))?;
    response
        .headers_mut()
        .insert(SYNC_TOKEN_HEADER, token_value);
    if exchange.continuation {
        response.headers_mut().insert(
            SYNC_CONTINUE_HEADER,
            HeaderValue::from_static(SYNC_CONTINUE_VALUE),
        );
    }

    Ok(response)
}

/// GET /kobo/{device_token}/v1/library/{book_uuid}/state
pub async fn get_reading_state(
    State(state): State<AppState>,
    Path((device_token, book_uuid)): Path<(String, String)>,
) -> Result<Response> {
    let user = auth::authenticate_device(&state.db, &device_token)?;

    let book = state
        .db
        .get_book_by_uuid(&book_uuid)?
        .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", book_uuid)))?;

    let reading_state = state
        .db
        .get_reading_state(user.id, book.id)?
        .ok_or_else(|| AppError::NotFound(format!("No reading state for: {}", book_uuid)))?;

    let body = vec![sync::response::reading_state_response(
        &reading_state,
        &book,
    )];
    Ok(Json(body).into_response())
}

/// Reading state update as sent by the device.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadingStateUpdate {
    /// Updated states, one per book.
    pub reading_states: Vec<ReadingStateEntry>,
}

/// One updated reading state.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadingStateEntry {
    /// Bookmark position.
    #[serde(default)]
    pub current_bookmark: Option<BookmarkEntry>,
}

/// Bookmark fields the device reports.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BookmarkEntry {
    /// Percent progress through the book.
    #[serde(default)]
    pub progress_percent: Option<f64>,
    /// Percent progress through the content source.
    #[serde(default)]
    pub content_source_progress_percent: Option<f64>,
    /// Bookmark location.
    #[serde(default)]
    pub location: Option<LocationEntry>,
}

/// Bookmark location triple.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocationEntry {
    /// Location value, format-specific.
    #[serde(default)]
    pub value: Option<String>,
    /// Location type.
    #[serde(default, rename = "Type")]
    pub kind: Option<String>,
    /// Location source.
    #[serde(default)]
    pub source: Option<String>,
}

/// PUT /kobo/{device_token}/v1/library/{book_uuid}/state
pub async fn put_reading_state(
    State(state): State<AppState>,
    Path((device_token, book_uuid)): Path<(String, String)>,
    Json(update): Json<ReadingStateUpdate>,
) -> Result<Response> {
    let user = auth::authenticate_device(&state.db, &device_token)?;

    let book = state
        .db
        .get_book_by_uuid(&book_uuid)?
        .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", book_uuid)))?;

    let entry = update
        .reading_states
        .into_iter()
        .next()
        .ok_or_else(|| AppError::InvalidRequest("Empty reading state update".to_string()))?;
    let bookmark = entry.current_bookmark.unwrap_or(BookmarkEntry {
        progress_percent: None,
        content_source_progress_percent: None,
        location: None,
    });
    let location = bookmark.location.unwrap_or(LocationEntry {
        value: None,
        kind: None,
        source: None,
    });

    let reading_state = db::ReadingState {
        user_id: user.id,
        book_id: book.id,
        last_modified: db::now(),
        progress_percent: bookmark.progress_percent,
        content_source_progress_percent: bookmark.content_source_progress_percent,
        location_value: location.value,
        location_type: location.kind,
        location_source: location.source,
    };
    state.db.save_reading_state(&reading_state)?;

    tracing::debug!(user_id = user.id, book = %book_uuid, "Reading state updated");

    let body = json!({
        "RequestResult": "Success",
        "UpdateResults": [{
            "EntitlementId": book.uuid,
            "CurrentBookmarkResult": { "Result": "Success" },
            "StatusInfoResult": { "Result": "Success" },
        }],
    });
    Ok(Json(body).into_response())
}
