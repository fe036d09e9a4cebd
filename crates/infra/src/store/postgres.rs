//! Postgres-backed document store and change feed.
//!
//! ## Layout
//!
//! - `documents(collection, id, doc JSONB)`: one row per aggregate
//! - `change_log(seq BIGSERIAL, ...)`: one row per committed mutation, written in
//!   the same transaction as the document
//! - `feed_cursors(name, last_seq)`: persisted feed positions
//!
//! Appends to one collection's log are serialized by a transaction-scoped
//! advisory lock taken before the row is inserted, so within a collection `seq`
//! order is commit order and a feed reading `seq > last` never skips a row that
//! commits late.
//!
//! Every committed mutation also issues `pg_notify('haulage_changes', collection)`
//! so that [`PgChangeFeed`] wakes up without polling. Notifications are only a
//! wake-up hint: the feed always reads `change_log` by sequence number, so a
//! missed notification delays an event by at most one idle poll.
//!
//! ## Error Mapping
//!
//! All SQLx errors map to `StoreError::Storage` with the failing operation in the
//! message, except unique violations on insert which map to
//! `StoreError::AlreadyExists`.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use haulage_core::{VersionedAggregate, WatermarkField};
use haulage_events::{ChangeEvent, EventSource, FeedError, FeedFilter, OperationKind};

use super::{
    DocumentStore, Filter, Patch, StoreError, decode, encode, matches_all, read_version,
    write_version,
};
use crate::feed_cursor::FeedCursorStore;

/// NOTIFY channel used for change wake-ups.
pub const CHANGE_CHANNEL: &str = "haulage_changes";

/// Held until commit; two-key form so it never collides with `insert_unless`.
const APPEND_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtext('change_log'), hashtext($1))";

const FEED_BATCH_SIZE: i64 = 256;
const FEED_IDLE_POLL: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        id UUID NOT NULL,
        doc JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (collection, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_log (
        seq BIGSERIAL PRIMARY KEY,
        collection TEXT NOT NULL,
        document_id UUID NOT NULL,
        operation TEXT NOT NULL,
        version BIGINT NOT NULL,
        changed_fields TEXT[] NOT NULL DEFAULT '{}',
        before JSONB,
        after JSONB,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS change_log_collection_seq
        ON change_log (collection, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_cursors (
        name TEXT PRIMARY KEY,
        last_seq BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Create the tables used by the store, the change log and feed cursors.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    Ok(())
}

/// Postgres document store for one aggregate type.
pub struct PostgresDocumentStore<A: VersionedAggregate> {
    pool: Arc<PgPool>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: VersionedAggregate> Clone for PostgresDocumentStore<A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: VersionedAggregate> core::fmt::Debug for PostgresDocumentStore<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresDocumentStore")
            .field("collection", &A::COLLECTION)
            .finish()
    }
}

impl<A: VersionedAggregate> PostgresDocumentStore<A> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            _aggregate: PhantomData,
        }
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    async fn insert_in(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        mut doc: A,
    ) -> Result<A, StoreError> {
        let id: Uuid = doc.id().into();
        doc.set_version(1);
        let encoded = encode(&doc)?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(A::COLLECTION)
        .bind(id)
        .bind(Json(&encoded))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_document", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                collection: A::COLLECTION,
                id,
            });
        }

        record_change(tx, A::COLLECTION, id, OperationKind::Insert, 1, &[], None, &encoded)
            .await?;
        Ok(doc)
    }

    /// Conditional patch of a row already locked by the caller.
    ///
    /// Returns the document and whether it changed, or `None` if a filter failed.
    async fn update_locked(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
        stored: Value,
        filters: &[Filter],
        patch: &Patch,
    ) -> Result<Option<(A, bool)>, StoreError> {
        if !matches_all(filters, &stored) {
            return Ok(None);
        }

        let mut next = stored.clone();
        let changed = patch.apply(&mut next)?;
        if changed.is_empty() {
            return Ok(Some((decode(next)?, false)));
        }

        let version = read_version(&stored) + 1;
        write_version(&mut next, version);
        let after: A = decode(next.clone())?;

        sqlx::query(
            r#"
            UPDATE documents
            SET doc = $3, updated_at = NOW()
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(A::COLLECTION)
        .bind(id)
        .bind(Json(&next))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_document", e))?;

        record_change(
            tx,
            A::COLLECTION,
            id,
            OperationKind::Update,
            version,
            &changed,
            Some(&stored),
            &next,
        )
        .await?;

        Ok(Some((after, true)))
    }
}

#[async_trait]
impl<A: VersionedAggregate> DocumentStore<A> for PostgresDocumentStore<A> {
    async fn get(&self, id: A::Id) -> Result<Option<A>, StoreError> {
        let id: Uuid = id.into();
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
            .bind(A::COLLECTION)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_document", e))?;

        row.map(|r| read_doc(&r)).transpose()?.map(decode).transpose()
    }

    #[instrument(skip(self, doc), fields(collection = A::COLLECTION), err)]
    async fn insert(&self, doc: A) -> Result<A, StoreError> {
        let mut tx = self.begin("insert").await?;
        let doc = self.insert_in(&mut tx, doc).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_insert", e))?;
        Ok(doc)
    }

    #[instrument(skip(self, doc, unless), fields(collection = A::COLLECTION), err)]
    async fn insert_unless(&self, doc: A, unless: &[Filter]) -> Result<Option<A>, StoreError> {
        let mut tx = self.begin("insert_unless").await?;

        // Serializes concurrent insert_unless calls per collection.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(A::COLLECTION)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_unless_lock", e))?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM documents WHERE collection = ");
        qb.push_bind(A::COLLECTION);
        push_filters(&mut qb, unless);
        qb.push(" LIMIT 1");

        let existing = qb
            .build()
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_unless_lookup", e))?;

        if existing.is_some() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        }

        let doc = self.insert_in(&mut tx, doc).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_insert_unless", e))?;
        Ok(Some(doc))
    }

    #[instrument(skip(self), fields(collection = A::COLLECTION, document_id = %id), err)]
    async fn claim(
        &self,
        id: A::Id,
        field: WatermarkField,
        version: u64,
    ) -> Result<Option<A>, StoreError> {
        let id: Uuid = id.into();
        let row = sqlx::query(
            r#"
            UPDATE documents
            SET doc = jsonb_set(
                    jsonb_set(doc, '{watermarks}', COALESCE(doc -> 'watermarks', '{}'::jsonb)),
                    ARRAY['watermarks', $3::text],
                    to_jsonb($4::bigint),
                    true
                ),
                updated_at = NOW()
            WHERE collection = $1
              AND id = $2
              AND COALESCE((doc #>> ARRAY['watermarks', $3::text])::bigint, -1) < $4::bigint
            RETURNING doc
            "#,
        )
        .bind(A::COLLECTION)
        .bind(id)
        .bind(field.name())
        .bind(version_param(version)?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.map(|r| read_doc(&r)).transpose()?.map(decode).transpose()
    }

    #[instrument(skip(self, filters, patch), fields(collection = A::COLLECTION, document_id = %id), err)]
    async fn update_where(
        &self,
        id: A::Id,
        filters: &[Filter],
        patch: Patch,
    ) -> Result<Option<A>, StoreError> {
        patch.validate()?;
        let id: Uuid = id.into();
        let mut tx = self.begin("update_where").await?;

        let row = sqlx::query(
            "SELECT doc FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(A::COLLECTION)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_document", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let stored = read_doc(&row)?;
        let outcome = self
            .update_locked(&mut tx, id, stored, filters, &patch)
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_update", e))?;
        Ok(outcome.map(|(doc, _)| doc))
    }

    #[instrument(skip(self, filters, patch), fields(collection = A::COLLECTION), err)]
    async fn update_many_where(
        &self,
        filters: &[Filter],
        patch: Patch,
    ) -> Result<Vec<A>, StoreError> {
        patch.validate()?;
        let mut tx = self.begin("update_many_where").await?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT id, doc FROM documents WHERE collection = ");
        qb.push_bind(A::COLLECTION);
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY id FOR UPDATE");

        let rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_documents", e))?;

        let mut updated = Vec::new();
        for row in rows {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("read_id", e))?;
            let stored = read_doc(&row)?;
            if let Some((doc, true)) = self
                .update_locked(&mut tx, id, stored, filters, &patch)
                .await?
            {
                updated.push(doc);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_update_many", e))?;
        Ok(updated)
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<A>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT doc FROM documents WHERE collection = ");
        qb.push_bind(A::COLLECTION);
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY id");

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        rows.iter().map(|r| read_doc(r).and_then(decode)).collect()
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) {
    for filter in filters {
        match filter {
            Filter::Eq(field, Value::Null) => {
                qb.push(" AND (doc -> ")
                    .push_bind(*field)
                    .push(" IS NULL OR doc -> ")
                    .push_bind(*field)
                    .push(" = 'null'::jsonb)");
            }
            Filter::Eq(field, value) => {
                qb.push(" AND doc -> ")
                    .push_bind(*field)
                    .push(" = ")
                    .push_bind(Json(value.clone()));
            }
            Filter::Before(field, cutoff) => {
                qb.push(" AND (doc ->> ")
                    .push_bind(*field)
                    .push(")::timestamptz < ")
                    .push_bind(*cutoff);
            }
        }
    }
}

fn read_doc(row: &PgRow) -> Result<Value, StoreError> {
    row.try_get::<Json<Value>, _>("doc")
        .map(|Json(v)| v)
        .map_err(|e| StoreError::Decode(format!("doc column: {e}")))
}

#[allow(clippy::too_many_arguments)]
async fn record_change(
    tx: &mut Transaction<'static, Postgres>,
    collection: &'static str,
    id: Uuid,
    operation: OperationKind,
    version: u64,
    changed_fields: &[String],
    before: Option<&Value>,
    after: &Value,
) -> Result<(), StoreError> {
    sqlx::query(APPEND_LOCK)
        .bind(collection)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("change_log_lock", e))?;

    sqlx::query(
        r#"
        INSERT INTO change_log (
            collection,
            document_id,
            operation,
            version,
            changed_fields,
            before,
            after
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(collection)
    .bind(id)
    .bind(operation.as_str())
    .bind(version_param(version)?)
    .bind(changed_fields.to_vec())
    .bind(before.map(Json))
    .bind(Json(after))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("record_change", e))?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANGE_CHANNEL)
        .bind(collection)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("notify_change", e))?;

    Ok(())
}

fn version_param(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Storage(format!("version {version} does not fit in BIGINT")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Change feed over `change_log` for one collection.
///
/// - Ordered by `seq`, which is commit order within a collection (see the
///   append lock in the module docs)
/// - Starts from "now" unless a named cursor exists, in which case it resumes
///   right after the persisted position
/// - The cursor is persisted once per fetched batch, after every event of the
///   previous batch has been handed out
pub struct PgChangeFeed<A: VersionedAggregate> {
    pool: PgPool,
    listener: Option<PgListener>,
    filter: FeedFilter<A>,
    last_seq: i64,
    saved_seq: i64,
    buffer: VecDeque<ChangeEvent<A>>,
    cursor: Option<(Arc<dyn FeedCursorStore>, String)>,
}

impl<A: VersionedAggregate> core::fmt::Debug for PgChangeFeed<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgChangeFeed")
            .field("collection", &A::COLLECTION)
            .field("last_seq", &self.last_seq)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl<A: VersionedAggregate> PgChangeFeed<A> {
    pub async fn open(
        pool: PgPool,
        filter: FeedFilter<A>,
        cursor: Option<(Arc<dyn FeedCursorStore>, String)>,
    ) -> Result<Self, FeedError> {
        let resumed = match &cursor {
            Some((store, name)) => store
                .load(name)
                .await
                .map_err(|e| FeedError::Unavailable(e.to_string()))?,
            None => None,
        };

        let start = match resumed {
            Some(seq) => seq,
            None => {
                let row = sqlx::query(
                    "SELECT COALESCE(MAX(seq), 0) AS head FROM change_log WHERE collection = $1",
                )
                .bind(A::COLLECTION)
                .fetch_one(&pool)
                .await
                .map_err(|e| FeedError::Unavailable(e.to_string()))?;
                row.try_get::<i64, _>("head")
                    .map_err(|e| FeedError::Decode(e.to_string()))?
            }
        };

        debug!(collection = A::COLLECTION, start_seq = start, resumed = resumed.is_some(), "change feed opened");

        Ok(Self {
            pool,
            listener: None,
            filter,
            last_seq: start,
            saved_seq: start,
            buffer: VecDeque::new(),
            cursor,
        })
    }

    async fn persist_cursor(&mut self) -> Result<(), FeedError> {
        if self.saved_seq == self.last_seq {
            return Ok(());
        }
        if let Some((store, name)) = &self.cursor {
            store
                .save(name, self.last_seq)
                .await
                .map_err(|e| FeedError::Unavailable(e.to_string()))?;
        }
        self.saved_seq = self.last_seq;
        Ok(())
    }

    /// Read the next batch of log rows. Returns the number of rows read
    /// (including rows the filter dropped).
    async fn fetch_batch(&mut self) -> Result<usize, FeedError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, operation, document_id, version, changed_fields, before, after
            FROM change_log
            WHERE collection = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(A::COLLECTION)
        .bind(self.last_seq)
        .bind(FEED_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        let count = rows.len();
        for row in rows {
            let seq: i64 = row
                .try_get("seq")
                .map_err(|e| FeedError::Decode(e.to_string()))?;
            self.last_seq = seq;

            match decode_change::<A>(&row) {
                Ok(event) if self.filter.matches(&event) => self.buffer.push_back(event),
                Ok(_) => {}
                Err(e) => {
                    warn!(collection = A::COLLECTION, seq, error = %e, "skipping undecodable change");
                }
            }
        }
        Ok(count)
    }

    async fn wait_for_wakeup(&mut self) -> Result<(), FeedError> {
        if self.listener.is_none() {
            let mut listener = PgListener::connect_with(&self.pool)
                .await
                .map_err(|e| FeedError::Unavailable(e.to_string()))?;
            listener
                .listen(CHANGE_CHANNEL)
                .await
                .map_err(|e| FeedError::Unavailable(e.to_string()))?;
            self.listener = Some(listener);
        }

        let Some(listener) = self.listener.as_mut() else {
            return Ok(());
        };

        match tokio::time::timeout(FEED_IDLE_POLL, listener.recv()).await {
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(e)) => {
                self.listener = None;
                Err(FeedError::Unavailable(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl<A: VersionedAggregate> EventSource<ChangeEvent<A>> for PgChangeFeed<A> {
    async fn next(&mut self) -> Result<Option<ChangeEvent<A>>, FeedError> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(Some(event));
            }

            self.persist_cursor().await?;

            if self.fetch_batch().await? == 0 {
                self.wait_for_wakeup().await?;
            }
        }
    }
}

fn decode_change<A: VersionedAggregate>(row: &PgRow) -> Result<ChangeEvent<A>, FeedError> {
    let get_err = |e: sqlx::Error| FeedError::Decode(e.to_string());

    let operation: String = row.try_get("operation").map_err(get_err)?;
    let document_id: Uuid = row.try_get("document_id").map_err(get_err)?;
    let version: i64 = row.try_get("version").map_err(get_err)?;
    let changed_fields: Vec<String> = row.try_get("changed_fields").map_err(get_err)?;
    let before: Option<Json<Value>> = row.try_get("before").map_err(get_err)?;
    let after: Option<Json<Value>> = row.try_get("after").map_err(get_err)?;

    let decode_doc = |doc: Option<Json<Value>>| -> Result<Option<A>, FeedError> {
        doc.map(|Json(v)| serde_json::from_value::<A>(v))
            .transpose()
            .map_err(|e| FeedError::Decode(e.to_string()))
    };

    let version = u64::try_from(version)
        .map_err(|_| FeedError::Decode(format!("negative version {version}")))?;

    match OperationKind::parse(&operation) {
        Some(OperationKind::Insert) => {
            let after = decode_doc(after)?
                .ok_or_else(|| FeedError::Decode("insert without after-image".to_string()))?;
            Ok(ChangeEvent::Insert {
                document_id: document_id.into(),
                version,
                after,
            })
        }
        Some(OperationKind::Update) => Ok(ChangeEvent::Update {
            document_id: document_id.into(),
            version,
            changed_fields,
            before: decode_doc(before)?,
            after: decode_doc(after)?,
        }),
        None => Err(FeedError::Decode(format!("unknown operation '{operation}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use haulage_fleet::Truck;

    /// Live-database tests run only when this points at a scratch Postgres.
    const TEST_DATABASE_ENV: &str = "HAULAGE_TEST_DATABASE_URL";

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var(TEST_DATABASE_ENV).ok()?;
        let pool = PgPool::connect(&url).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        Some(pool)
    }

    fn truck_doc() -> (Uuid, Value) {
        let truck = Truck::new("T-1");
        (truck.id().into(), serde_json::to_value(&truck).unwrap())
    }

    #[test]
    fn versions_beyond_bigint_are_rejected() {
        assert_eq!(version_param(7).unwrap(), 7);
        assert!(matches!(
            version_param(u64::MAX),
            Err(StoreError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn later_append_waits_for_earlier_commit() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let (first_id, first_doc) = truck_doc();
        let (second_id, second_doc) = truck_doc();

        let mut first = pool.begin().await.unwrap();
        record_change(
            &mut first,
            Truck::COLLECTION,
            first_id,
            OperationKind::Insert,
            1,
            &[],
            None,
            &first_doc,
        )
        .await
        .unwrap();

        let writer_pool = pool.clone();
        let second = tokio::spawn(async move {
            let mut tx = writer_pool.begin().await.unwrap();
            record_change(
                &mut tx,
                Truck::COLLECTION,
                second_id,
                OperationKind::Insert,
                1,
                &[],
                None,
                &second_doc,
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished(), "second append must wait for the first commit");

        first.commit().await.unwrap();
        second.await.unwrap();

        let rows = sqlx::query(
            "SELECT document_id FROM change_log WHERE document_id = ANY($1) ORDER BY seq",
        )
        .bind(vec![first_id, second_id])
        .fetch_all(&pool)
        .await
        .unwrap();
        let order: Vec<Uuid> = rows.iter().map(|r| r.get("document_id")).collect();
        assert_eq!(order, vec![first_id, second_id]);
    }

    #[tokio::test]
    async fn feed_sees_every_committed_append_in_order() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut feed = PgChangeFeed::<Truck>::open(pool.clone(), FeedFilter::all(), None)
            .await
            .unwrap();

        let mut expected = Vec::new();
        let mut writers = Vec::new();
        for _ in 0..8 {
            let truck = Truck::new("T-9");
            expected.push(truck.id);
            let store = PostgresDocumentStore::<Truck>::new(pool.clone());
            writers.push(tokio::spawn(async move { store.insert(truck).await.unwrap() }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < expected.len() {
            let event = tokio::time::timeout(Duration::from_secs(10), feed.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if expected.contains(&event.document_id()) {
                seen.push(event.document_id());
            }
        }
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
