use crate::db::*;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                device_token TEXT UNIQUE NOT NULL,
                shelves_only_sync INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            -- Books table (catalog metadata)
            CREATE TABLE IF NOT EXISTS books (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                created_at TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0
            );

            -- Shelves table
            CREATE TABLE IF NOT EXISTS shelves (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                uuid TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                kobo_sync INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Shelf membership table
            CREATE TABLE IF NOT EXISTS book_shelf (
                shelf_id INTEGER NOT NULL,
                book_id INTEGER NOT NULL,
                date_added TEXT NOT NULL,
                PRIMARY KEY (shelf_id, book_id),
                FOREIGN KEY (shelf_id) REFERENCES shelves(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Reading state table
            CREATE TABLE IF NOT EXISTS reading_states (
                user_id INTEGER NOT NULL,
                book_id INTEGER NOT NULL,
                last_modified TEXT NOT NULL,
                progress_percent REAL,
                content_source_progress_percent REAL,
                location_value TEXT,
                location_type TEXT,
                location_source TEXT,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Delivery ledger: rows mean "delivered to this user at least once"
            CREATE TABLE IF NOT EXISTS kobo_synced_books (
                user_id INTEGER NOT NULL,
                book_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_books_modified ON books(last_modified);
            CREATE INDEX IF NOT EXISTS idx_shelves_user ON shelves(user_id);
            CREATE INDEX IF NOT EXISTS idx_book_shelf_book ON book_shelf(book_id);
            CREATE INDEX IF NOT EXISTS idx_reading_states_user ON reading_states(user_id);
            CREATE INDEX IF NOT EXISTS idx_synced_user ON kobo_synced_books(user_id);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user, returning the assigned id.
    pub fn create_user(&self, user: &User) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (name, device_token, shelves_only_sync, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user.name,
                user.device_token,
                user.shelves_only_sync,
                format_timestamp(user.created_at),
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidRequest(format!("User '{}' already exists", user.name))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Get user by device token.
    pub fn get_user_by_token(&self, token: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, device_token, shelves_only_sync, created_at
             FROM users WHERE device_token = ?1",
            params![token],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by name.
    pub fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, device_token, shelves_only_sync, created_at
             FROM users WHERE name = ?1",
            params![name],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, device_token, shelves_only_sync, created_at
                 FROM users ORDER BY name",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Delete user.
    pub fn delete_user(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE name = ?1", params![name])
            .map_err(|e| AppError::Internal(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            device_token: row.get(2)?,
            shelves_only_sync: row.get(3)?,
            created_at: parse_timestamp(&row.get::<_, String>(4)?),
        })
    }

    // ========== BOOK OPERATIONS ==========

    /// Insert a book, returning the assigned id. The `id` field of the
    /// argument is ignored.
    pub fn add_book(&self, book: &Book) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books (uuid, title, author, created_at, last_modified, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                book.uuid,
                book.title,
                book.author,
                format_timestamp(book.created_at),
                format_timestamp(book.last_modified),
                book.archived,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to add book: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// Get book by id.
    pub fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, uuid, title, author, created_at, last_modified, archived
             FROM books WHERE id = ?1",
            params![id],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// Get book by external identifier.
    pub fn get_book_by_uuid(&self, uuid: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, uuid, title, author, created_at, last_modified, archived
             FROM books WHERE uuid = ?1",
            params![uuid],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// All books in id order. Sync ordering by (last_modified, id) is applied
    /// after timestamp normalization, not here.
    pub fn all_books(&self) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, uuid, title, author, created_at, last_modified, archived
                 FROM books ORDER BY id",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map([], Self::row_to_book)
            .map_err(|e| AppError::Internal(format!("Failed to get books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Update a book's last_modified timestamp.
    pub fn touch_book(&self, uuid: &str, last_modified: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET last_modified = ?1 WHERE uuid = ?2",
                params![format_timestamp(last_modified), uuid],
            )
            .map_err(|e| AppError::Internal(format!("Failed to touch book: {}", e)))?;
        Ok(rows > 0)
    }

    /// Mark a book archived, bumping last_modified so devices pick it up.
    pub fn archive_book(&self, uuid: &str, last_modified: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET archived = 1, last_modified = ?1 WHERE uuid = ?2",
                params![format_timestamp(last_modified), uuid],
            )
            .map_err(|e| AppError::Internal(format!("Failed to archive book: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            uuid: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            created_at: parse_timestamp(&row.get::<_, String>(4)?),
            last_modified: parse_timestamp(&row.get::<_, String>(5)?),
            archived: row.get(6)?,
        })
    }

    // ========== SHELF OPERATIONS ==========

    /// Create a shelf, returning the assigned id.
    pub fn create_shelf(&self, shelf: &Shelf) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shelves (user_id, uuid, name, kobo_sync, created, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                shelf.user_id,
                shelf.uuid,
                shelf.name,
                shelf.kobo_sync,
                format_timestamp(shelf.created),
                format_timestamp(shelf.last_modified),
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create shelf: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// Get shelf by external identifier.
    pub fn get_shelf_by_uuid(&self, uuid: &str) -> Result<Option<Shelf>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, uuid, name, kobo_sync, created, last_modified
             FROM shelves WHERE uuid = ?1",
            params![uuid],
            Self::row_to_shelf,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get shelf: {}", e)))
    }

    /// List shelves of a user.
    pub fn shelves_for_user(&self, user_id: i64) -> Result<Vec<Shelf>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, uuid, name, kobo_sync, created, last_modified
                 FROM shelves WHERE user_id = ?1 ORDER BY name",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let shelves = stmt
            .query_map(params![user_id], Self::row_to_shelf)
            .map_err(|e| AppError::Internal(format!("Failed to get shelves: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect shelves: {}", e)))?;

        Ok(shelves)
    }

    /// Add a book to a shelf. Idempotent per (shelf, book).
    pub fn add_book_to_shelf(
        &self,
        shelf_id: i64,
        book_id: i64,
        date_added: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO book_shelf (shelf_id, book_id, date_added)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (shelf_id, book_id) DO NOTHING",
            params![shelf_id, book_id, format_timestamp(date_added)],
        )
        .map_err(|e| AppError::Internal(format!("Failed to add book to shelf: {}", e)))?;
        Ok(())
    }

    /// Books on the user's kobo-synced shelves, one row per membership.
    ///
    /// A book appears once per shelf it is on; the resolver folds duplicates
    /// down to a single change per book.
    pub fn kobo_shelf_books(&self, user_id: i64) -> Result<Vec<(Book, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT b.id, b.uuid, b.title, b.author, b.created_at, b.last_modified,
                        b.archived, bs.date_added
                 FROM books b
                 JOIN book_shelf bs ON bs.book_id = b.id
                 JOIN shelves s ON s.id = bs.shelf_id
                 WHERE s.user_id = ?1 AND s.kobo_sync = 1
                 ORDER BY b.id",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                let book = Self::row_to_book(row)?;
                let date_added = parse_timestamp(&row.get::<_, String>(7)?);
                Ok((book, date_added))
            })
            .map_err(|e| AppError::Internal(format!("Failed to get shelf books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect shelf books: {}", e)))?;

        Ok(rows)
    }

    fn row_to_shelf(row: &rusqlite::Row<'_>) -> rusqlite::Result<Shelf> {
        Ok(Shelf {
            id: row.get(0)?,
            user_id: row.get(1)?,
            uuid: row.get(2)?,
            name: row.get(3)?,
            kobo_sync: row.get(4)?,
            created: parse_timestamp(&row.get::<_, String>(5)?),
            last_modified: parse_timestamp(&row.get::<_, String>(6)?),
        })
    }

    // ========== READING STATE OPERATIONS ==========

    /// Save or update a reading state.
    pub fn save_reading_state(&self, state: &ReadingState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reading_states
             (user_id, book_id, last_modified, progress_percent,
              content_source_progress_percent, location_value, location_type, location_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                last_modified = excluded.last_modified,
                progress_percent = excluded.progress_percent,
                content_source_progress_percent = excluded.content_source_progress_percent,
                location_value = excluded.location_value,
                location_type = excluded.location_type,
                location_source = excluded.location_source",
            params![
                state.user_id,
                state.book_id,
                format_timestamp(state.last_modified),
                state.progress_percent,
                state.content_source_progress_percent,
                state.location_value,
                state.location_type,
                state.location_source,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to save reading state: {}", e)))?;
        Ok(())
    }

    /// Get the reading state for a book.
    pub fn get_reading_state(&self, user_id: i64, book_id: i64) -> Result<Option<ReadingState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, book_id, last_modified, progress_percent,
                    content_source_progress_percent, location_value, location_type, location_source
             FROM reading_states WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            Self::row_to_reading_state,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get reading state: {}", e)))
    }

    /// All reading states of a user.
    pub fn reading_states_for_user(&self, user_id: i64) -> Result<Vec<ReadingState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, book_id, last_modified, progress_percent,
                        content_source_progress_percent, location_value, location_type,
                        location_source
                 FROM reading_states WHERE user_id = ?1 ORDER BY book_id",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let states = stmt
            .query_map(params![user_id], Self::row_to_reading_state)
            .map_err(|e| AppError::Internal(format!("Failed to get reading states: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect reading states: {}", e)))?;

        Ok(states)
    }

    fn row_to_reading_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadingState> {
        Ok(ReadingState {
            user_id: row.get(0)?,
            book_id: row.get(1)?,
            last_modified: parse_timestamp(&row.get::<_, String>(2)?),
            progress_percent: row.get(3)?,
            content_source_progress_percent: row.get(4)?,
            location_value: row.get(5)?,
            location_type: row.get(6)?,
            location_source: row.get(7)?,
        })
    }

    // ========== DELIVERY LEDGER OPERATIONS ==========

    /// Record a page of delivered books for a user.
    ///
    /// Runs as a single transaction: either the whole page is recorded or
    /// none of it. Idempotent per (user, book), so a retried page cannot
    /// corrupt the ledger.
    pub fn record_synced_books(&self, user_id: i64, book_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("Failed to start transaction: {}", e)))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO kobo_synced_books (user_id, book_id)
                     VALUES (?1, ?2)
                     ON CONFLICT (user_id, book_id) DO NOTHING",
                )
                .map_err(|e| AppError::Internal(format!("Failed to prepare upsert: {}", e)))?;

            for book_id in book_ids {
                stmt.execute(params![user_id, book_id]).map_err(|e| {
                    AppError::Internal(format!("Failed to record synced book: {}", e))
                })?;
            }
        }

        tx.commit()
            .map_err(|e| AppError::Internal(format!("Failed to commit ledger update: {}", e)))
    }

    /// Whether the user has no delivered books recorded at all.
    pub fn sync_ledger_is_empty(&self, user_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM kobo_synced_books WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to check ledger: {}", e)))?;
        Ok(count == 0)
    }

    /// Ids of all books ever delivered to the user.
    pub fn synced_book_ids(&self, user_id: i64) -> Result<HashSet<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT book_id FROM kobo_synced_books WHERE user_id = ?1")
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to get synced books: {}", e)))?
            .collect::<std::result::Result<HashSet<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect synced books: {}", e)))?;

        Ok(ids)
    }

    /// Clear the delivery ledger for a user, forcing a full resync on the
    /// next exchange regardless of the token the device submits.
    pub fn reset_sync_ledger(&self, user_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM kobo_synced_books WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to reset ledger: {}", e)))?;
        Ok(rows)
    }
}
