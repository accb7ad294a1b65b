use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// SQL DDL for the context store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 2;

/// Base tables as first shipped. Later columns arrive through [`MIGRATIONS`]
/// so databases created by older builds open unchanged.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS contexts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    start_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    context_id TEXT NOT NULL REFERENCES contexts(id) ON DELETE CASCADE,
    ts TEXT NOT NULL,
    kind INTEGER NOT NULL,
    content TEXT NOT NULL,
    live INTEGER NOT NULL,
    est_tokens INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS context_tools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    context_id TEXT NOT NULL REFERENCES contexts(id) ON DELETE CASCADE,
    tool_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(context_id, tool_name)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Additive column migrations: (table, column, definition).
pub const MIGRATIONS: &[(&str, &str, &str)] = &[
    (
        "contexts",
        "server_side_threading",
        "INTEGER NOT NULL DEFAULT 0",
    ),
    ("contexts", "last_continuation_token", "TEXT NULL"),
    ("records", "continuation_token", "TEXT NULL"),
];

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_records_context_live ON records(context_id, live);
CREATE INDEX IF NOT EXISTS idx_records_context_ts ON records(context_id, ts);
CREATE INDEX IF NOT EXISTS idx_context_tools_context ON context_tools(context_id);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// Bring a connection's schema up to date. Safe to run on every open.
pub fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(PRAGMAS)
        .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

    conn.execute_batch(CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    for (table, column, definition) in MIGRATIONS {
        add_column_if_not_exists(conn, table, column, definition)?;
    }

    conn.execute_batch(CREATE_INDEXES)
        .map_err(|e| StoreError::Database(format!("indexes: {e}")))?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])
                .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
            info!(from = v, to = SCHEMA_VERSION, "schema migrated");
        }
        Some(_) => {}
    }

    Ok(())
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

fn add_column_if_not_exists(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), StoreError> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {table} ADD COLUMN {column} {definition}"
    ))
    .map_err(|e| StoreError::Database(format!("add {table}.{column}: {e}")))?;
    info!(table, column, "column added");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn migrates_legacy_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE contexts (id TEXT PRIMARY KEY, name TEXT NOT NULL UNIQUE, start_time TEXT NOT NULL);
             CREATE TABLE records (id INTEGER PRIMARY KEY AUTOINCREMENT, context_id TEXT NOT NULL,
                 ts TEXT NOT NULL, kind INTEGER NOT NULL, content TEXT NOT NULL,
                 live INTEGER NOT NULL, est_tokens INTEGER NOT NULL);
             CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version) VALUES (1);
             INSERT INTO contexts VALUES ('ctx_old', 'old', '2024-01-01T00:00:00.000000Z');",
        )
        .unwrap();

        initialize(&conn).unwrap();

        assert!(column_exists(&conn, "contexts", "server_side_threading").unwrap());
        assert!(column_exists(&conn, "contexts", "last_continuation_token").unwrap());
        assert!(column_exists(&conn, "records", "continuation_token").unwrap());

        let threading: bool = conn
            .query_row(
                "SELECT server_side_threading FROM contexts WHERE id = 'ctx_old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!threading);

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
