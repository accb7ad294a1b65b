use rusqlite::Connection;
use tracing::instrument;

use ctxwin_core::context::ToolHint;
use ctxwin_core::ids::ContextId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persisted tool names per context. The executable handlers live in
/// process memory; these rows only record which tools a context used.
#[derive(Clone)]
pub struct ToolHintRepo {
    db: Database,
}

impl ToolHintRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a tool name. Re-adding an existing name returns the original row.
    #[instrument(skip(self), fields(context_id = %context_id, tool_name))]
    pub fn add(&self, context_id: &ContextId, tool_name: &str) -> Result<ToolHint, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO context_tools (context_id, tool_name, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![context_id.as_str(), tool_name, row_helpers::now_ts()],
            )
            .map_err(|e| match &e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
                {
                    StoreError::NotFound(format!("context {context_id}"))
                }
                _ => StoreError::from(e),
            })?;

            let mut stmt = conn.prepare(&format!(
                "{SELECT_HINTS} WHERE context_id = ?1 AND tool_name = ?2"
            ))?;
            let mut rows = stmt.query([context_id.as_str(), tool_name])?;
            match rows.next()? {
                Some(row) => row_to_hint(row),
                None => Err(StoreError::NotFound(format!("tool {tool_name}"))),
            }
        })
    }

    /// Hints in registration order.
    #[instrument(skip(self), fields(context_id = %context_id))]
    pub fn list(&self, context_id: &ContextId) -> Result<Vec<ToolHint>, StoreError> {
        self.db.with_conn(|conn| select_hints(conn, context_id))
    }

    pub fn names(&self, context_id: &ContextId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .list(context_id)?
            .into_iter()
            .map(|hint| hint.tool_name)
            .collect())
    }

    #[instrument(skip(self), fields(context_id = %context_id, tool_name))]
    pub fn has(&self, context_id: &ContextId, tool_name: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM context_tools WHERE context_id = ?1 AND tool_name = ?2",
                [context_id.as_str(), tool_name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Returns whether a row was removed.
    #[instrument(skip(self), fields(context_id = %context_id, tool_name))]
    pub fn remove(&self, context_id: &ContextId, tool_name: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM context_tools WHERE context_id = ?1 AND tool_name = ?2",
                [context_id.as_str(), tool_name],
            )?;
            Ok(removed > 0)
        })
    }
}

const SELECT_HINTS: &str = "SELECT id, context_id, tool_name, created_at FROM context_tools";

pub(crate) fn select_hints(
    conn: &Connection,
    context_id: &ContextId,
) -> Result<Vec<ToolHint>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_HINTS} WHERE context_id = ?1 ORDER BY id"))?;
    let mut rows = stmt.query([context_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_hint(row)?);
    }
    Ok(results)
}

fn row_to_hint(row: &rusqlite::Row<'_>) -> Result<ToolHint, StoreError> {
    let created_at: String = row_helpers::get(row, 3, "context_tools", "created_at")?;
    Ok(ToolHint {
        id: row_helpers::get(row, 0, "context_tools", "id")?,
        context_id: ContextId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "context_tools",
            "context_id",
        )?),
        tool_name: row_helpers::get(row, 2, "context_tools", "tool_name")?,
        created_at: row_helpers::parse_ts(&created_at, "context_tools", "created_at")?,
    })
}
