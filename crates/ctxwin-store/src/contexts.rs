use rusqlite::Connection;
use tracing::{info, instrument};

use ctxwin_core::context::{Context, ContextExport, ContextStats};
use ctxwin_core::ids::ContextId;

use crate::database::Database;
use crate::error::StoreError;
use crate::records::select_records;
use crate::row_helpers;
use crate::tool_hints::select_hints;

/// Name -> context registry.
#[derive(Clone)]
pub struct ContextRepo {
    db: Database,
}

impl ContextRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Strict create. Fails with Conflict if the name is taken.
    #[instrument(skip(self), fields(name, server_side_threading))]
    pub fn create(&self, name: &str, server_side_threading: bool) -> Result<Context, StoreError> {
        self.db
            .with_conn(|conn| insert_context(conn, name, server_side_threading))
    }

    /// Return the named context, creating it if absent. An existing context
    /// whose threading flag differs is updated to the requested mode.
    #[instrument(skip(self), fields(name, server_side_threading))]
    pub fn resume_or_create(
        &self,
        name: &str,
        server_side_threading: bool,
    ) -> Result<Context, StoreError> {
        self.db.with_tx(|conn| {
            match select_context(conn, "name", name)? {
                Some(mut ctx) => {
                    if ctx.server_side_threading != server_side_threading {
                        update_threading(conn, &ctx.id, server_side_threading)?;
                        ctx.server_side_threading = server_side_threading;
                    }
                    Ok(ctx)
                }
                None => insert_context(conn, name, server_side_threading),
            }
        })
    }

    /// Return the named context as stored, creating it with
    /// `default_threading` if absent.
    #[instrument(skip(self), fields(name, default_threading))]
    pub fn get_or_create(&self, name: &str, default_threading: bool) -> Result<Context, StoreError> {
        self.db.with_tx(|conn| match select_context(conn, "name", name)? {
            Some(ctx) => Ok(ctx),
            None => insert_context(conn, name, default_threading),
        })
    }

    #[instrument(skip(self), fields(context_id = %id))]
    pub fn get(&self, id: &ContextId) -> Result<Context, StoreError> {
        self.db.with_conn(|conn| {
            select_context(conn, "id", id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("context {id}")))
        })
    }

    #[instrument(skip(self), fields(name))]
    pub fn get_by_name(&self, name: &str) -> Result<Context, StoreError> {
        self.db.with_conn(|conn| {
            select_context(conn, "name", name)?
                .ok_or_else(|| StoreError::NotFound(format!("context '{name}'")))
        })
    }

    /// All contexts, newest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Context>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_CONTEXTS} ORDER BY start_time DESC, id DESC"))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_context(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self, token), fields(context_id = %id))]
    pub fn update_continuation_token(&self, id: &ContextId, token: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE contexts SET last_continuation_token = ?1 WHERE id = ?2",
                [token, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("context {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(context_id = %id, enabled))]
    pub fn set_threading(&self, id: &ContextId, enabled: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| update_threading(conn, id, enabled))
    }

    /// Delete a context with its records and tool hints.
    #[instrument(skip(self), fields(context_id = %id))]
    pub fn delete(&self, id: &ContextId) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            let records = conn.execute("DELETE FROM records WHERE context_id = ?1", [id.as_str()])?;
            conn.execute(
                "DELETE FROM context_tools WHERE context_id = ?1",
                [id.as_str()],
            )?;
            let deleted = conn.execute("DELETE FROM contexts WHERE id = ?1", [id.as_str()])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("context {id}")));
            }
            info!(records, "context deleted");
            Ok(())
        })
    }

    /// Single aggregate read over the context's records.
    #[instrument(skip(self), fields(context_id = %id))]
    pub fn stats(&self, id: &ContextId) -> Result<ContextStats, StoreError> {
        self.db.with_conn(|conn| {
            let (total, live, live_tokens, last): (i64, i64, i64, Option<String>) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(live), 0),
                            COALESCE(SUM(CASE WHEN live = 1 THEN est_tokens ELSE 0 END), 0),
                            MAX(ts)
                     FROM records WHERE context_id = ?1",
                    [id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            Ok(ContextStats {
                total_records: total.max(0) as u64,
                live_records: live.max(0) as u64,
                live_tokens: live_tokens.max(0) as u64,
                last_activity: last
                    .map(|ts| row_helpers::parse_ts(&ts, "records", "ts"))
                    .transpose()?,
            })
        })
    }

    /// Context plus every record and tool hint, read in one transaction.
    #[instrument(skip(self), fields(context_id = %id))]
    pub fn export(&self, id: &ContextId) -> Result<ContextExport, StoreError> {
        self.db.with_tx(|conn| {
            let context = select_context(conn, "id", id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("context {id}")))?;
            Ok(ContextExport {
                records: select_records(conn, id, false)?,
                tools: select_hints(conn, id)?,
                context,
            })
        })
    }

    pub fn export_json(&self, id: &ContextId) -> Result<String, StoreError> {
        let export = self.export(id)?;
        Ok(serde_json::to_string_pretty(&export)?)
    }
}

const SELECT_CONTEXTS: &str =
    "SELECT id, name, start_time, server_side_threading, last_continuation_token FROM contexts";

fn insert_context(
    conn: &Connection,
    name: &str,
    server_side_threading: bool,
) -> Result<Context, StoreError> {
    let id = ContextId::new();
    let start_time = row_helpers::now_ts();
    conn.execute(
        "INSERT INTO contexts (id, name, start_time, server_side_threading) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![id.as_str(), name, start_time, server_side_threading],
    )
    .map_err(|e| row_helpers::conflict_or(e, || format!("context '{name}' already exists")))?;

    info!(context_id = %id, name, "context created");

    Ok(Context {
        id,
        name: name.to_string(),
        start_time: row_helpers::parse_ts(&start_time, "contexts", "start_time")?,
        server_side_threading,
        last_continuation_token: None,
    })
}

fn select_context(
    conn: &Connection,
    column: &'static str,
    value: &str,
) -> Result<Option<Context>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_CONTEXTS} WHERE {column} = ?1"))?;
    let mut rows = stmt.query([value])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_context(row)?)),
        None => Ok(None),
    }
}

fn update_threading(conn: &Connection, id: &ContextId, enabled: bool) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE contexts SET server_side_threading = ?1 WHERE id = ?2",
        rusqlite::params![enabled, id.as_str()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("context {id}")));
    }
    Ok(())
}

fn row_to_context(row: &rusqlite::Row<'_>) -> Result<Context, StoreError> {
    let start_time: String = row_helpers::get(row, 2, "contexts", "start_time")?;
    Ok(Context {
        id: ContextId::from_raw(row_helpers::get::<String>(row, 0, "contexts", "id")?),
        name: row_helpers::get(row, 1, "contexts", "name")?,
        start_time: row_helpers::parse_ts(&start_time, "contexts", "start_time")?,
        server_side_threading: row_helpers::get(row, 3, "contexts", "server_side_threading")?,
        last_continuation_token: row_helpers::get_opt::<String>(
            row,
            4,
            "contexts",
            "last_continuation_token",
        )?
        .filter(|t| !t.is_empty()),
    })
}
