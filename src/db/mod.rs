pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Open or create the database at `path` and run migrations.
pub fn open(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  // The cache and outbox stores hold separate connections to one file.
  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

  run_migrations(&conn)?;
  Ok(conn)
}

/// Open a private in-memory database with the full schema.
pub fn open_in_memory() -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
  run_migrations(&conn)?;
  Ok(conn)
}

/// Get the default database path
pub fn default_path() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("saferoute").join("saferoute.db"))
}

/// Run database migrations
fn run_migrations(conn: &Connection) -> Result<()> {
  conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  Ok(())
}
