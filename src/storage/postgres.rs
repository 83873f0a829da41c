//! PostgreSQL storage engine
//!
//! One table per partition (see `migrations/`). Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers compete only for disjoint
//! rows and never wait on each other. Every move is a single
//! `WITH moved AS (DELETE ... RETURNING ...) INSERT ... SELECT` statement.
//!
//! Every timestamp (create, visible, timeout, complete, dead) and the sweep's
//! notion of "due" come from the database's `NOW()`, so processes with skewed
//! clocks still agree on when a message is due.

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{
    delay_millis, validate_batch, validate_claim, validate_delay, validate_enqueue,
    AdvisoryLockKey, QueueStore,
};
use crate::config::StoreConfig;
use crate::constants::tables;
use crate::database::UnitOfWork;
use crate::error::Result;
use crate::models::{Message, NewMessage, QueueMetrics};

/// SQL for every storage operation, with table names taken from [`tables`]
#[derive(Debug)]
struct Statements {
    insert_pending: String,
    insert_invisible: String,
    insert_pending_batch: String,
    insert_invisible_batch: String,
    claim: String,
    complete: String,
    dead: String,
    retry_pending: String,
    retry_invisible: String,
    delete_processing: String,
    reclaim_invisible: String,
    reclaim_processing: String,
    metrics: String,
}

static STATEMENTS: OnceLock<Statements> = OnceLock::new();

fn sql() -> &'static Statements {
    STATEMENTS.get_or_init(Statements::build)
}

impl Statements {
    fn build() -> Self {
        use tables::{COMPLETE, DEAD, INVISIBLE, PENDING, PROCESSING};

        let moved = format!(
            "WITH moved AS (
                DELETE FROM {PROCESSING} WHERE id = ANY($1)
                RETURNING id, create_time, topic, priority, payload, attempt
            )"
        );

        Self {
            insert_pending: format!(
                "INSERT INTO {PENDING} (create_time, topic, priority, payload, attempt)
                 VALUES (NOW(), $1, $2, $3, 0)
                 RETURNING id"
            ),
            insert_invisible: format!(
                "INSERT INTO {INVISIBLE} (create_time, topic, priority, payload, attempt, visible_time)
                 VALUES (NOW(), $1, $2, $3, 0, NOW() + $4 * INTERVAL '1 millisecond')
                 RETURNING id"
            ),
            insert_pending_batch: format!(
                "INSERT INTO {PENDING} (create_time, topic, priority, payload, attempt)
                 SELECT NOW(), $1, m.priority, m.payload, 0
                 FROM UNNEST($2::INT4[], $3::TEXT[]) WITH ORDINALITY AS m(priority, payload, ord)
                 ORDER BY m.ord
                 RETURNING id"
            ),
            insert_invisible_batch: format!(
                "INSERT INTO {INVISIBLE} (create_time, topic, priority, payload, attempt, visible_time)
                 SELECT NOW(), $1, m.priority, m.payload, 0, NOW() + $4 * INTERVAL '1 millisecond'
                 FROM UNNEST($2::INT4[], $3::TEXT[]) WITH ORDINALITY AS m(priority, payload, ord)
                 ORDER BY m.ord
                 RETURNING id"
            ),
            claim: format!(
                "WITH claimed AS (
                    DELETE FROM {PENDING}
                    WHERE id IN (
                        SELECT id FROM {PENDING}
                        WHERE topic = $1
                        ORDER BY priority DESC, id ASC
                        LIMIT $2
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING id, create_time, topic, priority, payload, attempt
                )
                INSERT INTO {PROCESSING} (id, create_time, topic, priority, payload, attempt, timeout_time)
                SELECT id, create_time, topic, priority, payload, attempt + 1,
                       NOW() + $3 * INTERVAL '1 millisecond'
                FROM claimed
                RETURNING id, create_time, topic, priority, payload, attempt, timeout_time"
            ),
            complete: format!(
                "{moved}
                INSERT INTO {COMPLETE} (id, create_time, topic, priority, payload, attempt, complete_time)
                SELECT id, create_time, topic, priority, payload, attempt, NOW() FROM moved"
            ),
            dead: format!(
                "{moved}
                INSERT INTO {DEAD} (id, create_time, topic, priority, payload, attempt, dead_time)
                SELECT id, create_time, topic, priority, payload, attempt, NOW() FROM moved"
            ),
            retry_pending: format!(
                "{moved}
                INSERT INTO {PENDING} (id, create_time, topic, priority, payload, attempt)
                SELECT id, create_time, topic, priority, payload, attempt FROM moved"
            ),
            retry_invisible: format!(
                "{moved}
                INSERT INTO {INVISIBLE} (id, create_time, topic, priority, payload, attempt, visible_time)
                SELECT id, create_time, topic, priority, payload, attempt,
                       NOW() + $2 * INTERVAL '1 millisecond'
                FROM moved"
            ),
            delete_processing: format!("DELETE FROM {PROCESSING} WHERE id = ANY($1)"),
            reclaim_invisible: format!(
                "WITH due AS (
                    DELETE FROM {INVISIBLE} WHERE visible_time <= NOW()
                    RETURNING id, create_time, topic, priority, payload, attempt
                )
                INSERT INTO {PENDING} (id, create_time, topic, priority, payload, attempt)
                SELECT id, create_time, topic, priority, payload, attempt FROM due
                RETURNING topic"
            ),
            reclaim_processing: format!(
                "WITH due AS (
                    DELETE FROM {PROCESSING} WHERE timeout_time <= NOW()
                    RETURNING id, create_time, topic, priority, payload, attempt
                )
                INSERT INTO {PENDING} (id, create_time, topic, priority, payload, attempt)
                SELECT id, create_time, topic, priority, payload, attempt FROM due
                RETURNING topic"
            ),
            metrics: format!(
                "SELECT
                    (SELECT COUNT(*) FROM {PENDING} WHERE topic = $1) AS pending,
                    (SELECT COUNT(*) FROM {INVISIBLE} WHERE topic = $1) AS invisible,
                    (SELECT COUNT(*) FROM {PROCESSING} WHERE topic = $1) AS processing,
                    (SELECT COUNT(*) FROM {COMPLETE} WHERE topic = $1) AS complete,
                    (SELECT COUNT(*) FROM {DEAD} WHERE topic = $1) AS dead,
                    (SELECT EXTRACT(EPOCH FROM (NOW() - MIN(create_time)))::BIGINT
                       FROM {PENDING} WHERE topic = $1) AS oldest_pending_age_seconds"
            ),
        }
    }
}

#[derive(Debug, FromRow)]
struct MetricsRow {
    pending: i64,
    invisible: i64,
    processing: i64,
    complete: i64,
    dead: i64,
    oldest_pending_age_seconds: Option<i64>,
}

/// Canonical storage engine backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    config: StoreConfig,
}

impl PgQueueStore {
    pub fn new(pool: PgPool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Round trip to the database
    pub async fn health_check(&self) -> bool {
        crate::database::health_check(&self.pool).await
    }

    /// Enqueue inside a caller-owned unit of work
    ///
    /// The row becomes visible to claimers only when the unit of work commits.
    /// Pair with `PgNotifySender::publish_after_commit` to wake consumers.
    #[instrument(skip(self, uow, message), fields(topic = %topic))]
    pub async fn enqueue_in(
        &self,
        uow: &mut UnitOfWork,
        topic: &str,
        message: NewMessage,
        delay: Option<Duration>,
    ) -> Result<i64> {
        validate_enqueue(topic, delay)?;
        Self::insert_one(uow.conn(), topic, message, delay).await
    }

    /// Batch enqueue inside a caller-owned unit of work
    #[instrument(skip(self, uow, messages), fields(topic = %topic, count = messages.len()))]
    pub async fn enqueue_batch_in(
        &self,
        uow: &mut UnitOfWork,
        topic: &str,
        messages: Vec<NewMessage>,
        delay: Option<Duration>,
    ) -> Result<Vec<i64>> {
        validate_enqueue(topic, delay)?;
        validate_batch(&messages)?;
        Self::insert_many(uow.conn(), topic, messages, delay).await
    }

    async fn insert_one(
        conn: &mut PgConnection,
        topic: &str,
        message: NewMessage,
        delay: Option<Duration>,
    ) -> Result<i64> {
        let id = match delay {
            None => {
                sqlx::query_scalar::<_, i64>(&sql().insert_pending)
                    .bind(topic)
                    .bind(message.priority)
                    .bind(&message.payload)
                    .fetch_one(&mut *conn)
                    .await?
            }
            Some(delay) => {
                sqlx::query_scalar::<_, i64>(&sql().insert_invisible)
                    .bind(topic)
                    .bind(message.priority)
                    .bind(&message.payload)
                    .bind(delay_millis(delay)?)
                    .fetch_one(&mut *conn)
                    .await?
            }
        };

        debug!(topic = %topic, msg_id = id, delayed = delay.is_some(), "Message enqueued");
        Ok(id)
    }

    async fn insert_many(
        conn: &mut PgConnection,
        topic: &str,
        mut messages: Vec<NewMessage>,
        delay: Option<Duration>,
    ) -> Result<Vec<i64>> {
        if messages.len() == 1 {
            let message = messages.remove(0);
            return Ok(vec![Self::insert_one(conn, topic, message, delay).await?]);
        }

        let count = messages.len();
        let (priorities, payloads): (Vec<i32>, Vec<String>) = messages
            .into_iter()
            .map(|m| (m.priority, m.payload))
            .unzip();

        let mut ids = match delay {
            None => {
                sqlx::query_scalar::<_, i64>(&sql().insert_pending_batch)
                    .bind(topic)
                    .bind(&priorities)
                    .bind(&payloads)
                    .fetch_all(&mut *conn)
                    .await?
            }
            Some(delay) => {
                sqlx::query_scalar::<_, i64>(&sql().insert_invisible_batch)
                    .bind(topic)
                    .bind(&priorities)
                    .bind(&payloads)
                    .bind(delay_millis(delay)?)
                    .fetch_all(&mut *conn)
                    .await?
            }
        };
        ids.sort_unstable();

        debug!(topic = %topic, count, delayed = delay.is_some(), "Message batch enqueued");
        Ok(ids)
    }

    async fn move_from_processing(
        &self,
        operation: &'static str,
        statement: &'static str,
        ids: &[i64],
        delay_ms: Option<i64>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query = sqlx::query(statement).bind(ids);
        if let Some(delay_ms) = delay_ms {
            query = query.bind(delay_ms);
        }
        let affected = query.execute(&self.pool).await?.rows_affected();

        if affected < ids.len() as u64 {
            warn!(
                operation,
                requested = ids.len(),
                affected,
                "Some messages were not in processing (already reclaimed or resolved)"
            );
        } else {
            debug!(operation, affected, "Messages moved out of processing");
        }
        Ok(affected)
    }

    async fn reclaim_in(conn: &mut PgConnection) -> Result<Vec<String>> {
        let visible: Vec<String> = sqlx::query_scalar(&sql().reclaim_invisible)
            .fetch_all(&mut *conn)
            .await?;
        let timed_out: Vec<String> = sqlx::query_scalar(&sql().reclaim_processing)
            .fetch_all(&mut *conn)
            .await?;

        if !visible.is_empty() || !timed_out.is_empty() {
            info!(
                became_visible = visible.len(),
                timed_out = timed_out.len(),
                "Reclaimed due messages into pending"
            );
        }

        let topics: BTreeSet<String> = visible.into_iter().chain(timed_out).collect();
        Ok(topics.into_iter().collect())
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    fn store_config(&self) -> &StoreConfig {
        &self.config
    }

    #[instrument(skip(self, message), fields(topic = %topic))]
    async fn enqueue(
        &self,
        topic: &str,
        message: NewMessage,
        delay: Option<Duration>,
    ) -> Result<i64> {
        validate_enqueue(topic, delay)?;
        let mut conn = self.pool.acquire().await?;
        Self::insert_one(&mut conn, topic, message, delay).await
    }

    #[instrument(skip(self, messages), fields(topic = %topic, count = messages.len()))]
    async fn enqueue_batch(
        &self,
        topic: &str,
        messages: Vec<NewMessage>,
        delay: Option<Duration>,
    ) -> Result<Vec<i64>> {
        validate_enqueue(topic, delay)?;
        validate_batch(&messages)?;
        let mut conn = self.pool.acquire().await?;
        Self::insert_many(&mut conn, topic, messages, delay).await
    }

    #[instrument(skip(self), fields(topic = %topic))]
    async fn claim(
        &self,
        topic: &str,
        max_count: usize,
        processing_timeout: Duration,
    ) -> Result<Vec<Message>> {
        validate_claim(&self.config, topic, max_count, processing_timeout)?;
        let timeout_ms = delay_millis(processing_timeout)?;

        let mut messages = sqlx::query_as::<_, Message>(&sql().claim)
            .bind(topic)
            .bind(max_count as i64)
            .bind(timeout_ms)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING order is unspecified
        messages.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        if !messages.is_empty() {
            debug!(topic = %topic, claimed = messages.len(), "Claimed messages");
        }
        Ok(messages)
    }

    async fn complete(&self, ids: &[i64]) -> Result<u64> {
        if self.config.retain_completed {
            self.move_from_processing("complete", &sql().complete, ids, None).await
        } else {
            self.move_from_processing("complete", &sql().delete_processing, ids, None).await
        }
    }

    async fn dead(&self, ids: &[i64]) -> Result<u64> {
        self.move_from_processing("dead", &sql().dead, ids, None).await
    }

    async fn retry(&self, ids: &[i64], delay: Option<Duration>) -> Result<u64> {
        validate_delay(delay)?;
        match delay {
            None => {
                self.move_from_processing("retry", &sql().retry_pending, ids, None).await
            }
            Some(delay) => {
                let delay_ms = delay_millis(delay)?;
                self.move_from_processing("retry", &sql().retry_invisible, ids, Some(delay_ms))
                    .await
            }
        }
    }

    async fn delete(&self, ids: &[i64]) -> Result<u64> {
        self.move_from_processing("delete", &sql().delete_processing, ids, None).await
    }

    #[instrument(skip(self))]
    async fn reclaim_due(&self) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let topics = Self::reclaim_in(&mut tx).await?;
        tx.commit().await?;
        Ok(topics)
    }

    #[instrument(skip(self), fields(engine_id = key.engine_id, sub_id = key.sub_id))]
    async fn try_reclaim_due_exclusive(
        &self,
        key: AdvisoryLockKey,
    ) -> Result<Option<Vec<String>>> {
        let mut tx = self.pool.begin().await?;

        // Released automatically when the transaction ends, commit or rollback
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1, $2)")
            .bind(key.engine_id)
            .bind(key.sub_id)
            .fetch_one(&mut *tx)
            .await?;

        if !acquired {
            tx.rollback().await?;
            debug!("Reclaim lock held by another session, skipping");
            return Ok(None);
        }

        let topics = Self::reclaim_in(&mut tx).await?;
        tx.commit().await?;
        Ok(Some(topics))
    }

    #[instrument(skip(self), fields(topic = %topic))]
    async fn queue_metrics(&self, topic: &str) -> Result<QueueMetrics> {
        let row = sqlx::query_as::<_, MetricsRow>(&sql().metrics)
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueMetrics {
            topic: topic.to_string(),
            pending: row.pending,
            invisible: row.invisible,
            processing: row.processing,
            complete: row.complete,
            dead: row.dead,
            oldest_pending_age_seconds: row.oldest_pending_age_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_partition_tables() {
        let sql = sql();
        assert!(sql.claim.contains(&format!("DELETE FROM {}", tables::PENDING)));
        assert!(sql.claim.contains(&format!("INSERT INTO {}", tables::PROCESSING)));
        assert!(sql.complete.contains(&format!("INSERT INTO {}", tables::COMPLETE)));
        assert!(sql.dead.contains(&format!("INSERT INTO {}", tables::DEAD)));
        assert!(sql
            .retry_invisible
            .contains(&format!("INSERT INTO {}", tables::INVISIBLE)));
        for table in [
            tables::PENDING,
            tables::INVISIBLE,
            tables::PROCESSING,
            tables::COMPLETE,
            tables::DEAD,
        ] {
            assert!(sql.metrics.contains(table));
        }
    }

    #[test]
    fn test_statements_never_take_client_timestamps() {
        let sql = sql();
        for statement in [&sql.reclaim_invisible, &sql.reclaim_processing, &sql.complete] {
            assert!(statement.contains("NOW()"));
            assert!(!statement.contains("$2"));
        }
        assert!(sql.claim.contains("NOW() + $3"));
    }
}
