//! Shared helpers for database-backed tests

#![allow(dead_code)]

use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tasker_queue::config::StoreConfig;
use tasker_queue::models::Partition;
use tasker_queue::storage::PgQueueStore;

pub const TIMEOUT: Duration = Duration::from_secs(30);

pub fn store(pool: &PgPool) -> PgQueueStore {
    PgQueueStore::new(pool.clone(), StoreConfig::default())
}

/// Partition currently holding `id`, if any
pub async fn partition_of(pool: &PgPool, id: i64) -> Option<Partition> {
    for partition in Partition::ALL {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            partition.table_name()
        );
        let found: bool = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_one(pool)
            .await
            .expect("partition lookup");
        if found {
            return Some(partition);
        }
    }
    None
}

/// Move every invisible and processing deadline into the past
pub async fn expire_deadlines(pool: &PgPool) {
    sqlx::query(&format!(
        "UPDATE {} SET visible_time = NOW() - INTERVAL '1 second'",
        Partition::Invisible.table_name()
    ))
    .execute(pool)
    .await
    .expect("expire invisible");
    sqlx::query(&format!(
        "UPDATE {} SET timeout_time = NOW() - INTERVAL '1 second'",
        Partition::Processing.table_name()
    ))
    .execute(pool)
    .await
    .expect("expire processing");
}

/// Poll `condition` until it holds or `within` elapses
pub async fn wait_until<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
