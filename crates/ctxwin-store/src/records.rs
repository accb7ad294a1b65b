use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, instrument};

use ctxwin_core::ids::{ContextId, RecordId};
use ctxwin_core::record::{Entry, Record, RecordKind};
use ctxwin_core::tokens::TokenCounter;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Atomicity boundary for a multi-record append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Atomicity {
    /// All entries commit together or none do.
    Transaction,
    /// Each entry commits on its own. On failure, entries already written
    /// stay written and the error is returned.
    PerRecord,
}

/// Append-only record log. Content never changes after insert; `live`
/// only goes from true to false.
#[derive(Clone)]
pub struct RecordRepo {
    db: Database,
    counter: Arc<dyn TokenCounter>,
}

impl RecordRepo {
    pub fn new(db: Database, counter: Arc<dyn TokenCounter>) -> Self {
        Self { db, counter }
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    #[instrument(skip(self, entry), fields(context_id = %context_id, kind = %entry.kind))]
    pub fn append(
        &self,
        context_id: &ContextId,
        entry: &Entry,
        live: bool,
    ) -> Result<Record, StoreError> {
        self.db
            .with_conn(|conn| insert_record(conn, context_id, entry, live, self.counter.as_ref()))
    }

    /// Append live records in order under the given atomicity.
    #[instrument(skip(self, entries), fields(context_id = %context_id, count = entries.len()))]
    pub fn append_batch(
        &self,
        context_id: &ContextId,
        entries: &[Entry],
        atomicity: Atomicity,
    ) -> Result<Vec<Record>, StoreError> {
        let counter = self.counter.as_ref();
        match atomicity {
            Atomicity::Transaction => self.db.with_tx(|conn| {
                entries
                    .iter()
                    .map(|entry| insert_record(conn, context_id, entry, true, counter))
                    .collect()
            }),
            Atomicity::PerRecord => {
                let mut written = Vec::with_capacity(entries.len());
                for entry in entries {
                    let record = self
                        .db
                        .with_conn(|conn| insert_record(conn, context_id, entry, true, counter))?;
                    written.push(record);
                }
                Ok(written)
            }
        }
    }

    #[instrument(skip(self), fields(record_id = %id))]
    pub fn get(&self, id: RecordId) -> Result<Record, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_RECORDS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_to_record(row),
                None => Err(StoreError::NotFound(format!("record {id}"))),
            }
        })
    }

    /// Live records in timestamp order.
    #[instrument(skip(self), fields(context_id = %context_id))]
    pub fn list_live(&self, context_id: &ContextId) -> Result<Vec<Record>, StoreError> {
        self.db
            .with_conn(|conn| select_records(conn, context_id, true))
    }

    /// Every record, live or retired, in timestamp order.
    #[instrument(skip(self), fields(context_id = %context_id))]
    pub fn list_all(&self, context_id: &ContextId) -> Result<Vec<Record>, StoreError> {
        self.db
            .with_conn(|conn| select_records(conn, context_id, false))
    }

    /// Mark a record non-live. Retiring an already retired record is a no-op.
    #[instrument(skip(self), fields(record_id = %id))]
    pub fn retire(&self, id: RecordId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("UPDATE records SET live = 0 WHERE id = ?1", [id.get()])?;
            Ok(())
        })
    }

    /// Retire `ids` and append `entry` as a live record in one transaction.
    #[instrument(skip(self, ids, entry), fields(context_id = %context_id, retired = ids.len()))]
    pub fn retire_and_append(
        &self,
        context_id: &ContextId,
        ids: &[RecordId],
        entry: &Entry,
    ) -> Result<Record, StoreError> {
        self.db.with_tx(|conn| {
            for id in ids {
                conn.execute("UPDATE records SET live = 0 WHERE id = ?1", [id.get()])?;
            }
            insert_record(conn, context_id, entry, true, self.counter.as_ref())
        })
    }

    /// Retire every live system prompt in the context and append the new
    /// one, atomically.
    #[instrument(skip(self, content), fields(context_id = %context_id))]
    pub fn replace_system_prompt(
        &self,
        context_id: &ContextId,
        content: &str,
    ) -> Result<Record, StoreError> {
        self.db.with_tx(|conn| {
            let retired = conn.execute(
                "UPDATE records SET live = 0 WHERE context_id = ?1 AND kind = ?2 AND live = 1",
                rusqlite::params![context_id.as_str(), RecordKind::SystemPrompt.code()],
            )?;
            if retired > 0 {
                debug!(retired, "previous system prompt retired");
            }
            insert_record(
                conn,
                context_id,
                &Entry::system(content),
                true,
                self.counter.as_ref(),
            )
        })
    }

    /// Sum of live records' token estimates.
    #[instrument(skip(self), fields(context_id = %context_id))]
    pub fn live_tokens(&self, context_id: &ContextId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let sum: i64 = conn.query_row(
                "SELECT COALESCE(SUM(est_tokens), 0) FROM records WHERE context_id = ?1 AND live = 1",
                [context_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(sum.max(0) as u64)
        })
    }
}

const SELECT_RECORDS: &str =
    "SELECT id, context_id, ts, kind, content, live, est_tokens, continuation_token FROM records";

pub(crate) fn select_records(
    conn: &Connection,
    context_id: &ContextId,
    live_only: bool,
) -> Result<Vec<Record>, StoreError> {
    let sql = if live_only {
        format!("{SELECT_RECORDS} WHERE context_id = ?1 AND live = 1 ORDER BY ts, id")
    } else {
        format!("{SELECT_RECORDS} WHERE context_id = ?1 ORDER BY ts, id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([context_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_record(row)?);
    }
    Ok(results)
}

/// Insert one record. The timestamp is clamped to the context's newest so
/// timestamp order always matches insertion order.
fn insert_record(
    conn: &Connection,
    context_id: &ContextId,
    entry: &Entry,
    live: bool,
    counter: &dyn TokenCounter,
) -> Result<Record, StoreError> {
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(ts) FROM records WHERE context_id = ?1",
        [context_id.as_str()],
        |row| row.get(0),
    )?;
    let now = row_helpers::now_ts();
    let ts = match latest {
        Some(latest) if latest > now => latest,
        _ => now,
    };
    let est_tokens = counter.count(&entry.content);
    let token = entry.continuation_token.as_deref().filter(|t| !t.is_empty());

    conn.execute(
        "INSERT INTO records (context_id, ts, kind, content, live, est_tokens, continuation_token)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            context_id.as_str(),
            ts,
            entry.kind.code(),
            entry.content,
            live,
            est_tokens,
            token,
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            StoreError::NotFound(format!("context {context_id}"))
        }
        _ => StoreError::from(e),
    })?;

    Ok(Record {
        id: RecordId::from_raw(conn.last_insert_rowid()),
        context_id: context_id.clone(),
        timestamp: row_helpers::parse_ts(&ts, "records", "ts")?,
        kind: entry.kind,
        content: entry.content.clone(),
        live,
        est_tokens,
        continuation_token: token.map(str::to_owned),
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<Record, StoreError> {
    let ts: String = row_helpers::get(row, 2, "records", "ts")?;
    Ok(Record {
        id: RecordId::from_raw(row_helpers::get(row, 0, "records", "id")?),
        context_id: ContextId::from_raw(row_helpers::get::<String>(row, 1, "records", "context_id")?),
        timestamp: row_helpers::parse_ts(&ts, "records", "ts")?,
        kind: row_helpers::parse_kind(row_helpers::get(row, 3, "records", "kind")?)?,
        content: row_helpers::get(row, 4, "records", "content")?,
        live: row_helpers::get(row, 5, "records", "live")?,
        est_tokens: row_helpers::get(row, 6, "records", "est_tokens")?,
        continuation_token: row_helpers::get_opt(row, 7, "records", "continuation_token")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::ContextRepo;
    use ctxwin_core::tokens::WordCounter;

    fn setup() -> (Database, RecordRepo, ContextId) {
        let db = Database::in_memory().unwrap();
        let ctx = ContextRepo::new(db.clone())
            .resume_or_create("test", false)
            .unwrap();
        let repo = RecordRepo::new(db.clone(), Arc::new(WordCounter));
        (db, repo, ctx.id)
    }

    fn install_failing_trigger(db: &Database) {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER fail_on_boom BEFORE INSERT ON records
                 WHEN NEW.content = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn append_assigns_id_and_estimate() {
        let (_, repo, ctx) = setup();
        let rec = repo.append(&ctx, &Entry::prompt("a b c"), true).unwrap();
        assert!(rec.id.get() > 0);
        assert_eq!(rec.est_tokens, 3);
        assert!(rec.live);
        assert_eq!(rec.kind, RecordKind::Prompt);
        assert_eq!(repo.get(rec.id).unwrap(), rec);
    }

    #[test]
    fn append_to_missing_context_is_not_found() {
        let (_, repo, _) = setup();
        let err = repo
            .append(&ContextId::from_raw("ctx_missing"), &Entry::prompt("x"), true)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_live_is_ordered_and_filtered() {
        let (_, repo, ctx) = setup();
        let first = repo.append(&ctx, &Entry::prompt("one"), true).unwrap();
        repo.append(&ctx, &Entry::prompt("hidden"), false).unwrap();
        let third = repo
            .append(&ctx, &Entry::model_response("two", None), true)
            .unwrap();

        let live = repo.list_live(&ctx).unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].id, first.id);
        assert_eq!(live[1].id, third.id);
        assert!(live.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let all = repo.list_all(&ctx).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn timestamps_clamped_after_future_record() {
        let (db, repo, ctx) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (context_id, ts, kind, content, live, est_tokens)
                 VALUES (?1, '2999-01-01T00:00:00.000000Z', 0, 'future', 1, 1)",
                [ctx.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let rec = repo.append(&ctx, &Entry::prompt("now"), true).unwrap();
        let live = repo.list_live(&ctx).unwrap();
        assert_eq!(live.last().unwrap().id, rec.id);
        assert_eq!(live[0].timestamp, rec.timestamp);
    }

    #[test]
    fn retire_is_idempotent() {
        let (_, repo, ctx) = setup();
        let rec = repo.append(&ctx, &Entry::prompt("x"), true).unwrap();
        repo.retire(rec.id).unwrap();
        repo.retire(rec.id).unwrap();
        assert!(repo.list_live(&ctx).unwrap().is_empty());
        assert!(!repo.get(rec.id).unwrap().live);
    }

    #[test]
    fn empty_token_not_stored() {
        let (_, repo, ctx) = setup();
        let rec = repo
            .append(&ctx, &Entry::model_response("hi", Some(String::new())), true)
            .unwrap();
        assert!(rec.continuation_token.is_none());
        let rec = repo
            .append(&ctx, &Entry::model_response("hi", Some("resp_1".into())), true)
            .unwrap();
        assert_eq!(
            repo.get(rec.id).unwrap().continuation_token.as_deref(),
            Some("resp_1")
        );
    }

    #[test]
    fn replace_system_prompt_keeps_one_live() {
        let (_, repo, ctx) = setup();
        let first = repo.replace_system_prompt(&ctx, "be brief").unwrap();
        let second = repo.replace_system_prompt(&ctx, "be thorough").unwrap();

        let live: Vec<_> = repo
            .list_live(&ctx)
            .unwrap()
            .into_iter()
            .filter(|r| r.kind == RecordKind::SystemPrompt)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);

        let all = repo.list_all(&ctx).unwrap();
        assert!(all.iter().any(|r| r.id == first.id && !r.live));
    }

    #[test]
    fn batch_transaction_rolls_back() {
        let (db, repo, ctx) = setup();
        install_failing_trigger(&db);
        let entries = vec![Entry::prompt("ok"), Entry::prompt("boom")];
        assert!(repo
            .append_batch(&ctx, &entries, Atomicity::Transaction)
            .is_err());
        assert!(repo.list_all(&ctx).unwrap().is_empty());
    }

    #[test]
    fn batch_per_record_keeps_prefix() {
        let (db, repo, ctx) = setup();
        install_failing_trigger(&db);
        let entries = vec![
            Entry::prompt("ok"),
            Entry::prompt("boom"),
            Entry::prompt("never"),
        ];
        assert!(repo
            .append_batch(&ctx, &entries, Atomicity::PerRecord)
            .is_err());
        let all = repo.list_all(&ctx).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "ok");
    }

    #[test]
    fn retire_and_append_rolls_back_on_failure() {
        let (db, repo, ctx) = setup();
        install_failing_trigger(&db);
        let a = repo.append(&ctx, &Entry::prompt("a"), true).unwrap();
        let b = repo.append(&ctx, &Entry::prompt("b"), true).unwrap();

        let result = repo.retire_and_append(&ctx, &[a.id, b.id], &Entry::model_response("boom", None));
        assert!(result.is_err());
        assert_eq!(repo.list_live(&ctx).unwrap().len(), 2);

        let summary = repo
            .retire_and_append(&ctx, &[a.id, b.id], &Entry::model_response("summary", None))
            .unwrap();
        let live = repo.list_live(&ctx).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, summary.id);
        assert_eq!(repo.list_all(&ctx).unwrap().len(), 3);
    }

    #[test]
    fn live_tokens_sums_live_only() {
        let (_, repo, ctx) = setup();
        repo.append(&ctx, &Entry::prompt("a b c"), true).unwrap();
        let gone = repo.append(&ctx, &Entry::prompt("d e"), true).unwrap();
        repo.retire(gone.id).unwrap();
        assert_eq!(repo.live_tokens(&ctx).unwrap(), 3);
    }
}
