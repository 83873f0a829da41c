//! Storage engine tests against PostgreSQL
//!
//! Each test gets its own database with `migrations/` applied.

mod common;

use chrono::{DateTime, Utc};
use common::{expire_deadlines, partition_of, store, TIMEOUT};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tasker_queue::config::StoreConfig;
use tasker_queue::database::UnitOfWork;
use tasker_queue::models::{NewMessage, Partition};
use tasker_queue::storage::{AdvisoryLockKey, PgQueueStore, QueueStore};

#[sqlx::test]
async fn test_enqueue_and_claim(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let id = store
        .enqueue("orders", NewMessage::new("x"), None)
        .await
        .unwrap();
    assert_eq!(partition_of(&pool, id).await, Some(Partition::Pending));

    let claimed = store.claim("orders", 10, TIMEOUT).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let message = &claimed[0];
    assert_eq!(message.id, id);
    assert_eq!(message.payload, "x");
    assert_eq!(message.attempt, 1);
    let db_now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()").fetch_one(&pool).await?;
    assert!(message.timeout_time.unwrap() > db_now);
    assert_eq!(partition_of(&pool, id).await, Some(Partition::Processing));

    assert!(store.claim("orders", 10, TIMEOUT).await.unwrap().is_empty());
    Ok(())
}

#[sqlx::test]
async fn test_claim_orders_by_priority_then_id(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    for priority in [1, 5, 10] {
        store
            .enqueue("t", NewMessage::new(priority.to_string()).with_priority(priority), None)
            .await
            .unwrap();
    }
    let tie = store
        .enqueue("t", NewMessage::new("5b").with_priority(5), None)
        .await
        .unwrap();

    let claimed = store.claim("t", 4, TIMEOUT).await.unwrap();
    let priorities: Vec<i32> = claimed.iter().map(|m| m.priority).collect();
    assert_eq!(priorities, vec![10, 5, 5, 1]);
    // ties keep insertion order
    assert_eq!(claimed[1].payload, "5");
    assert_eq!(claimed[2].id, tie);
    Ok(())
}

#[sqlx::test]
async fn test_concurrent_claimers_never_double_claim(pool: PgPool) -> sqlx::Result<()> {
    let store = Arc::new(store(&pool));
    let messages = (0..200).map(|i| NewMessage::new(i.to_string())).collect();
    let ids = store.enqueue_batch("t", messages, None).await.unwrap();
    assert_eq!(ids.len(), 200);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let batch = store.claim("t", 7, TIMEOUT).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                seen.extend(batch.into_iter().map(|m| m.id));
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
    Ok(())
}

#[sqlx::test]
async fn test_delayed_message_becomes_visible(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let id = store
        .enqueue("t", NewMessage::new("x"), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(partition_of(&pool, id).await, Some(Partition::Invisible));
    assert!(store.claim("t", 1, TIMEOUT).await.unwrap().is_empty());

    // not due yet
    assert!(store.reclaim_due().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(
        store.reclaim_due().await.unwrap(),
        vec!["t".to_string()]
    );

    let claimed = store.claim("t", 1, TIMEOUT).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].payload, "x");
    assert_eq!(claimed[0].id, id);
    Ok(())
}

#[sqlx::test]
async fn test_timestamps_come_from_database_clock(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);

    // NOW() is fixed for the whole transaction
    let mut uow = UnitOfWork::begin(&pool).await.unwrap();
    let id = store
        .enqueue_in(&mut uow, "t", NewMessage::new("x"), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    let (db_now, create_time, visible_time): (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) =
        sqlx::query_as(&format!(
            "SELECT NOW(), create_time, visible_time FROM {} WHERE id = $1",
            Partition::Invisible.table_name()
        ))
        .bind(id)
        .fetch_one(uow.conn())
        .await?;
    uow.commit().await.unwrap();

    assert_eq!(create_time, db_now);
    assert_eq!(visible_time - db_now, chrono::Duration::seconds(30));
    Ok(())
}

#[sqlx::test]
async fn test_timed_out_claim_is_reclaimed(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let id = store.enqueue("t", NewMessage::new("x"), None).await.unwrap();
    store.claim("t", 1, Duration::from_secs(1)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        store.reclaim_due().await.unwrap(),
        vec!["t".to_string()]
    );
    assert_eq!(partition_of(&pool, id).await, Some(Partition::Pending));

    let again = store.claim("t", 1, TIMEOUT).await.unwrap();
    assert_eq!(again[0].id, id);
    assert_eq!(again[0].attempt, 2);
    Ok(())
}

#[sqlx::test]
async fn test_outcome_moves(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let messages = (0..5).map(|i| NewMessage::new(i.to_string())).collect();
    let ids = store.enqueue_batch("t", messages, None).await.unwrap();
    store.claim("t", 5, TIMEOUT).await.unwrap();

    assert_eq!(store.complete(&ids[0..1]).await.unwrap(), 1);
    assert_eq!(store.dead(&ids[1..2]).await.unwrap(), 1);
    assert_eq!(store.retry(&ids[2..3], None).await.unwrap(), 1);
    assert_eq!(
        store
            .retry(&ids[3..4], Some(Duration::from_secs(60)))
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.delete(&ids[4..5]).await.unwrap(), 1);

    assert_eq!(partition_of(&pool, ids[0]).await, Some(Partition::Complete));
    assert_eq!(partition_of(&pool, ids[1]).await, Some(Partition::Dead));
    assert_eq!(partition_of(&pool, ids[2]).await, Some(Partition::Pending));
    assert_eq!(partition_of(&pool, ids[3]).await, Some(Partition::Invisible));
    assert_eq!(partition_of(&pool, ids[4]).await, None);

    // retry keeps the attempt count; the next claim increments it
    let again = store.claim("t", 1, TIMEOUT).await.unwrap();
    assert_eq!(again[0].id, ids[2]);
    assert_eq!(again[0].attempt, 2);
    Ok(())
}

#[sqlx::test]
async fn test_unknown_ids_affect_nothing(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    assert_eq!(store.complete(&[]).await.unwrap(), 0);
    assert_eq!(store.complete(&[12345]).await.unwrap(), 0);
    assert_eq!(store.dead(&[12345]).await.unwrap(), 0);
    assert_eq!(store.retry(&[12345], None).await.unwrap(), 0);
    assert_eq!(store.delete(&[12345]).await.unwrap(), 0);

    // a pending (unclaimed) message is not affected by outcomes
    let id = store.enqueue("t", NewMessage::new("x"), None).await.unwrap();
    assert_eq!(store.complete(&[id]).await.unwrap(), 0);
    assert_eq!(partition_of(&pool, id).await, Some(Partition::Pending));
    Ok(())
}

#[sqlx::test]
async fn test_complete_without_retention_deletes(pool: PgPool) -> sqlx::Result<()> {
    let store = PgQueueStore::new(
        pool.clone(),
        StoreConfig {
            retain_completed: false,
            ..StoreConfig::default()
        },
    );
    let id = store.enqueue("t", NewMessage::new("x"), None).await.unwrap();
    store.claim("t", 1, TIMEOUT).await.unwrap();
    assert_eq!(store.complete(&[id]).await.unwrap(), 1);
    assert_eq!(partition_of(&pool, id).await, None);
    Ok(())
}

#[sqlx::test]
async fn test_batch_enqueue(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let messages = vec![
        NewMessage::new("a"),
        NewMessage::new("b").with_priority(3),
        NewMessage::new("c"),
    ];
    let ids = store.enqueue_batch("t", messages, None).await.unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let single = store
        .enqueue_batch("t", vec![NewMessage::new("d")], Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(partition_of(&pool, single[0]).await, Some(Partition::Invisible));

    let claimed = store.claim("t", 10, TIMEOUT).await.unwrap();
    let payloads: Vec<&str> = claimed.iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, vec!["b", "a", "c"]);
    Ok(())
}

#[sqlx::test]
async fn test_invalid_arguments_rejected(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    assert!(store.enqueue("", NewMessage::new("x"), None).await.is_err());
    assert!(store
        .enqueue("t", NewMessage::new("x"), Some(Duration::ZERO))
        .await
        .is_err());
    assert!(store.enqueue_batch("t", vec![], None).await.is_err());
    assert!(store.claim("t", 0, TIMEOUT).await.is_err());
    assert!(store.claim("t", 5001, TIMEOUT).await.is_err());
    assert!(store.claim("t", 1, Duration::ZERO).await.is_err());
    Ok(())
}

#[sqlx::test]
async fn test_racing_sweeps_move_each_row_once(pool: PgPool) -> sqlx::Result<()> {
    let first = store(&pool);
    let second = store(&pool);
    let key = AdvisoryLockKey::new(42, 1);

    for i in 0..50 {
        first
            .enqueue(&format!("t{i}"), NewMessage::new("x"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
    }
    expire_deadlines(&pool).await;

    let (a, b) = tokio::join!(
        first.try_reclaim_due_exclusive(key),
        second.try_reclaim_due_exclusive(key)
    );
    let a: HashSet<String> = a.unwrap().unwrap_or_default().into_iter().collect();
    let b: HashSet<String> = b.unwrap().unwrap_or_default().into_iter().collect();

    assert!(a.is_disjoint(&b));
    assert_eq!(a.len() + b.len(), 50);
    assert_eq!(first.queue_metrics("t0").await.unwrap().pending, 1);
    Ok(())
}

#[sqlx::test]
async fn test_sweep_skips_while_lock_held(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let key = AdvisoryLockKey::new(42, 1);
    store
        .enqueue("t", NewMessage::new("x"), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    expire_deadlines(&pool).await;

    let mut holder = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(key.engine_id)
        .bind(key.sub_id)
        .execute(&mut *holder)
        .await?;

    assert!(store
        .try_reclaim_due_exclusive(key)
        .await
        .unwrap()
        .is_none());
    // a different key is not blocked
    assert!(store
        .try_reclaim_due_exclusive(AdvisoryLockKey::new(42, 2))
        .await
        .unwrap()
        .is_some());

    holder.rollback().await?;
    let outcome = store
        .try_reclaim_due_exclusive(key)
        .await
        .unwrap();
    assert!(outcome.is_some());
    Ok(())
}

#[sqlx::test]
async fn test_enqueue_in_unit_of_work(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);

    let mut uow = UnitOfWork::begin(&pool).await.unwrap();
    let rolled_back = store
        .enqueue_in(&mut uow, "t", NewMessage::new("gone"), None)
        .await
        .unwrap();
    uow.rollback().await.unwrap();
    assert_eq!(partition_of(&pool, rolled_back).await, None);

    let mut uow = UnitOfWork::begin(&pool).await.unwrap();
    let ids = store
        .enqueue_batch_in(
            &mut uow,
            "t",
            vec![NewMessage::new("a"), NewMessage::new("b")],
            None,
        )
        .await
        .unwrap();
    // not visible to other connections before commit
    assert!(store.claim("t", 10, TIMEOUT).await.unwrap().is_empty());
    uow.commit().await.unwrap();

    let claimed = store.claim("t", 10, TIMEOUT).await.unwrap();
    let claimed_ids: Vec<i64> = claimed.iter().map(|m| m.id).collect();
    assert_eq!(claimed_ids, ids);
    Ok(())
}

#[sqlx::test]
async fn test_queue_metrics(pool: PgPool) -> sqlx::Result<()> {
    let store = store(&pool);
    let messages = (0..4).map(|i| NewMessage::new(i.to_string())).collect();
    let ids = store.enqueue_batch("t", messages, None).await.unwrap();
    store
        .enqueue("t", NewMessage::new("later"), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    store.claim("t", 2, TIMEOUT).await.unwrap();
    store.complete(&ids[0..1]).await.unwrap();
    store.dead(&ids[1..2]).await.unwrap();

    let metrics = store.queue_metrics("t").await.unwrap();
    assert_eq!(metrics.pending, 2);
    assert_eq!(metrics.invisible, 1);
    assert_eq!(metrics.processing, 0);
    assert_eq!(metrics.complete, 1);
    assert_eq!(metrics.dead, 1);
    assert!(metrics.oldest_pending_age_seconds.unwrap() >= 0);

    let empty = store.queue_metrics("other").await.unwrap();
    assert_eq!(empty.outstanding(), 0);
    assert_eq!(empty.oldest_pending_age_seconds, None);

    assert!(store.health_check().await);
    Ok(())
}
