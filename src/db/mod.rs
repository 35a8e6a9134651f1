pub mod history;

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

/// Global database connection wrapped in a Mutex for thread-safe access.
/// Series chunks run concurrently, so writes to the processed-record store
/// must be serialized through this single connection.
static DB: OnceLock<Mutex<Connection>> = OnceLock::new();

/// Opens the history database and creates the schema if needed.
pub fn init_connection(path: &Path) -> Result<()> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open history database {}", path.display()))?;
    history::init_database(&conn)?;

    DB.set(Mutex::new(conn))
        .map_err(|_| anyhow::anyhow!("database already initialized"))?;
    Ok(())
}

/// Execute an operation against the shared connection.
pub async fn with_db<F, T>(f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = DB
        .get()
        .ok_or_else(|| anyhow::anyhow!("database not initialized, call init_connection() first"))?;
    let conn = db.lock().await;
    f(&conn)
}
