use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Kobo-compatible library sync server.
#[derive(Parser, Debug, Clone)]
#[command(name = "kobo-sync-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "KOBO_SYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Book catalog commands.
    Book {
        /// Book subcommand action.
        #[command(subcommand)]
        action: BookCommand,
    },

    /// Shelf management commands.
    Shelf {
        /// Shelf subcommand action.
        #[command(subcommand)]
        action: ShelfCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user and print its device token.
    Add {
        /// Username.
        name: String,
        /// Only sync books on shelves marked for device sync.
        #[arg(long)]
        shelves_only: bool,
    },

    /// Delete a user.
    Del {
        /// Username to delete.
        name: String,
    },

    /// List all users with their device tokens.
    List,

    /// Clear a user's delivery ledger, forcing a full resync.
    ResetSync {
        /// Username.
        name: String,
    },
}

/// Book catalog subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum BookCommand {
    /// Add a book to the catalog.
    Add {
        /// Book title.
        title: String,
        /// Author name.
        #[arg(short, long)]
        author: Option<String>,
    },

    /// Archive a book (devices will remove it).
    Archive {
        /// Book UUID.
        uuid: String,
    },

    /// Bump a book's modification timestamp.
    Touch {
        /// Book UUID.
        uuid: String,
    },

    /// List all books.
    List,
}

/// Shelf management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ShelfCommand {
    /// Create a shelf for a user.
    Add {
        /// Owning username.
        user: String,
        /// Shelf name.
        name: String,
        /// Mark the shelf for device sync.
        #[arg(long)]
        kobo_sync: bool,
    },

    /// Add a book to a shelf.
    AddBook {
        /// Shelf UUID.
        shelf: String,
        /// Book UUID.
        book: String,
    },

    /// List a user's shelves.
    List {
        /// Username.
        user: String,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/library.db")
}

/// Sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum book changes delivered per sync page.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
        }
    }
}

fn default_page_limit() -> usize {
    100
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("kobo-sync-rs.toml"),
            dirs::config_dir()
                .map(|p| p.join("kobo-sync-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/kobo-sync-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# kobo-sync-rs configuration

[server]
bind = "0.0.0.0:8080"

[database]
# path = "/var/lib/kobo-sync-rs/library.db"

[sync]
# Maximum book changes delivered per sync page
page_limit = 100
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(&Config::generate_default()).unwrap();
        assert_eq!(config.sync.page_limit, 100);
        assert_eq!(config.server.bind.port(), 8080);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.page_limit, 100);
        assert_eq!(config.database.path, PathBuf::from("data/library.db"));
    }
}
