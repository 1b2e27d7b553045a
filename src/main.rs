//! kobo-sync-rs server entry point.

use clap::Parser;
use kobo_sync_rs::{
    auth,
    config::{BookCommand, Cli, Command, Config, ShelfCommand, UserCommand},
    db::{self, Database},
    server,
};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Book { action }) => cmd_book(action, &config).await,
        Some(Command::Shelf { action }) => cmd_shelf(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
    }
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to configure your server.");
    println!("Then run: kobo-sync-rs user add <name>");
    println!("And point the device at http://<host>:8080/kobo/<token>/");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        UserCommand::Add { name, shelves_only } => {
            let token = auth::generate_token();
            let user = db::User {
                id: 0,
                name: name.clone(),
                device_token: token.clone(),
                shelves_only_sync: shelves_only,
                created_at: db::now(),
            };
            let id = db.create_user(&user)?;
            println!("Created user: {} (id: {})", name, id);
            println!("Device token: {}", token);
            println!("Sync endpoint: /kobo/{}/v1/library/sync", token);
        }

        UserCommand::Del { name } => {
            if db.delete_user(&name)? {
                println!("Deleted user: {}", name);
            } else {
                println!("User not found: {}", name);
            }
        }

        UserCommand::List => {
            let users = db.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<20} {:<6} {:<44} SHELVES-ONLY", "NAME", "ID", "TOKEN");
                println!("{}", "-".repeat(80));
                for user in users {
                    println!(
                        "{:<20} {:<6} {:<44} {}",
                        user.name,
                        user.id,
                        user.device_token,
                        if user.shelves_only_sync { "yes" } else { "no" }
                    );
                }
            }
        }

        UserCommand::ResetSync { name } => {
            let user = db
                .get_user_by_name(&name)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", name))?;
            let cleared = db.reset_sync_ledger(user.id)?;
            println!(
                "Cleared {} ledger entries for {}; next sync will be full.",
                cleared, name
            );
        }
    }

    Ok(())
}

/// Book catalog commands.
async fn cmd_book(action: BookCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        BookCommand::Add { title, author } => {
            let now = db::now();
            let book = db::Book {
                id: 0,
                uuid: uuid::Uuid::new_v4().to_string(),
                title: title.clone(),
                author,
                created_at: now,
                last_modified: now,
                archived: false,
            };
            let id = db.add_book(&book)?;
            println!("Added book: {} (id: {}, uuid: {})", title, id, book.uuid);
        }

        BookCommand::Archive { uuid } => {
            if db.archive_book(&uuid, db::now())? {
                println!("Archived book: {}", uuid);
            } else {
                println!("Book not found: {}", uuid);
            }
        }

        BookCommand::Touch { uuid } => {
            if db.touch_book(&uuid, db::now())? {
                println!("Touched book: {}", uuid);
            } else {
                println!("Book not found: {}", uuid);
            }
        }

        BookCommand::List => {
            let books = db.all_books()?;
            if books.is_empty() {
                println!("No books found.");
            } else {
                println!("{:<36} {:<40} MODIFIED", "UUID", "TITLE");
                println!("{}", "-".repeat(96));
                for book in books {
                    println!(
                        "{:<36} {:<40} {}{}",
                        book.uuid,
                        book.title,
                        book.last_modified.format("%Y-%m-%d %H:%M"),
                        if book.archived { " (archived)" } else { "" }
                    );
                }
            }
        }
    }

    Ok(())
}

/// Shelf management commands.
async fn cmd_shelf(action: ShelfCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        ShelfCommand::Add {
            user,
            name,
            kobo_sync,
        } => {
            let user = db
                .get_user_by_name(&user)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", user))?;
            let now = db::now();
            let shelf = db::Shelf {
                id: 0,
                user_id: user.id,
                uuid: uuid::Uuid::new_v4().to_string(),
                name: name.clone(),
                kobo_sync,
                created: now,
                last_modified: now,
            };
            let id = db.create_shelf(&shelf)?;
            println!("Created shelf: {} (id: {}, uuid: {})", name, id, shelf.uuid);
        }

        ShelfCommand::AddBook { shelf, book } => {
            let shelf = db
                .get_shelf_by_uuid(&shelf)?
                .ok_or_else(|| anyhow::anyhow!("Shelf not found: {}", shelf))?;
            let book = db
                .get_book_by_uuid(&book)?
                .ok_or_else(|| anyhow::anyhow!("Book not found: {}", book))?;
            db.add_book_to_shelf(shelf.id, book.id, db::now())?;
            println!("Added {} to shelf {}", book.title, shelf.name);
        }

        ShelfCommand::List { user } => {
            let user = db
                .get_user_by_name(&user)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", user))?;
            let shelves = db.shelves_for_user(user.id)?;
            if shelves.is_empty() {
                println!("No shelves found.");
            } else {
                println!("{:<36} {:<30} KOBO-SYNC", "UUID", "NAME");
                println!("{}", "-".repeat(80));
                for shelf in shelves {
                    println!(
                        "{:<36} {:<30} {}",
                        shelf.uuid,
                        shelf.name,
                        if shelf.kobo_sync { "yes" } else { "no" }
                    );
                }
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kobo_sync_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&config.database.path)?;

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        "Starting kobo-sync-rs server"
    );

    let state = server::AppState::new(config.clone(), db);
    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
