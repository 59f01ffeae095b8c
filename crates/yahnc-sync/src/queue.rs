//! Durable "run this later, at least once" queue for delivery tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;
use yahnc_core::DeliveryTask;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("enqueue rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A task handed to a worker. It stays invisible to other claimers until its
/// lease lapses; completing it removes it for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub task: DeliveryTask,
    pub attempt: u32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably accept a task; returns once the queue has acknowledged it.
    async fn enqueue(&self, task: DeliveryTask) -> Result<Uuid, QueueError>;

    /// Lease up to `limit` runnable tasks.
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError>;

    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Push a running task's lease out by a full lease period (heartbeat).
    /// Returns `false` when the task is no longer leased to anyone.
    async fn extend_lease(&self, id: Uuid) -> Result<bool, QueueError>;

    /// How long a claim stays exclusive without a heartbeat.
    fn lease(&self) -> Duration;
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: VecDeque<(Uuid, DeliveryTask, u32)>,
    leased: HashMap<Uuid, (DeliveryTask, u32, Instant)>,
}

/// Process-local queue. Same at-least-once contract as [`PgTaskQueue`] while the
/// process lives; tasks are lost on exit.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<MemoryState>,
    lease: Duration,
    rejecting: AtomicBool,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl InMemoryTaskQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lease,
            rejecting: AtomicBool::new(false),
        }
    }

    /// Make subsequent enqueues fail, for exercising dispatch failures.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Tasks waiting to be claimed, oldest first.
    pub async fn pending(&self) -> Vec<DeliveryTask> {
        self.state
            .lock()
            .await
            .ready
            .iter()
            .map(|(_, task, _)| *task)
            .collect()
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.leased.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: DeliveryTask) -> Result<Uuid, QueueError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected(format!("{} refused", task.kind())));
        }
        let id = Uuid::new_v4();
        self.state.lock().await.ready.push_back((id, task, 0));
        Ok(id)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let lapsed: Vec<Uuid> = state
            .leased
            .iter()
            .filter(|(_, (_, _, until))| *until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            if let Some((task, attempt, _)) = state.leased.remove(&id) {
                warn!(task_id = %id, kind = %task.kind(), "lease lapsed; redelivering");
                state.ready.push_back((id, task, attempt));
            }
        }

        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some((id, task, attempt)) = state.ready.pop_front() else {
                break;
            };
            let attempt = attempt + 1;
            state.leased.insert(id, (task, attempt, now + self.lease));
            claimed.push(ClaimedTask { id, task, attempt });
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.leased.remove(&id);
        // a lapsed lease may already have been put back
        state.ready.retain(|(ready_id, _, _)| *ready_id != id);
        Ok(())
    }

    async fn extend_lease(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.leased.get_mut(&id) {
            Some((_, _, until)) => {
                *until = Instant::now() + self.lease;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lease(&self) -> Duration {
        self.lease
    }
}

/// Postgres-backed queue. Claims use `FOR UPDATE SKIP LOCKED` so concurrent
/// workers never lease the same row; a crashed worker's lease simply expires.
#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_tasks (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                payload JSONB NOT NULL,
                attempts INT NOT NULL DEFAULT 0,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                lease_expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS delivery_tasks_runnable_idx ON delivery_tasks (lease_expires_at, enqueued_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: DeliveryTask) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO delivery_tasks (id, kind, payload) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(task.kind().as_str())
            .bind(Json(task))
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET lease_expires_at = NOW() + make_interval(secs => $1),
                attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM delivery_tasks
                WHERE lease_expires_at IS NULL OR lease_expires_at < NOW()
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(self.lease.as_secs_f64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let attempt: i32 = row.try_get("attempts")?;
            match row.try_get::<Json<DeliveryTask>, _>("payload") {
                Ok(Json(task)) => claimed.push(ClaimedTask {
                    id,
                    task,
                    attempt: attempt.max(0) as u32,
                }),
                Err(err) => {
                    warn!(task_id = %id, error = %err, "dropping undecodable task");
                    self.complete(id).await?;
                }
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM delivery_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn extend_lease(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET lease_expires_at = NOW() + make_interval(secs => $2)
            WHERE id = $1 AND lease_expires_at IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    fn lease(&self) -> Duration {
        self.lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yahnc_core::{ItemId, MessageId};

    #[tokio::test]
    async fn claim_leases_in_enqueue_order() {
        let queue = InMemoryTaskQueue::default();
        queue
            .enqueue(DeliveryTask::SendMessage { item_id: ItemId(1) })
            .await
            .unwrap();
        queue
            .enqueue(DeliveryTask::EditMessage {
                item_id: ItemId(2),
                message_id: MessageId(20),
            })
            .await
            .unwrap();

        let claimed = queue.claim(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task.item_id(), ItemId(1));
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(queue.pending().await.len(), 1);
        assert_eq!(queue.len().await, 2);

        queue.complete(claimed[0].id).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn lapsed_lease_is_redelivered() {
        let queue = InMemoryTaskQueue::new(Duration::from_millis(10));
        let id = queue
            .enqueue(DeliveryTask::SendMessage { item_id: ItemId(9) })
            .await
            .unwrap();

        let first = queue.claim(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.claim(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(25)).await;
        let again = queue.claim(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn rejecting_queue_fails_enqueue() {
        let queue = InMemoryTaskQueue::default();
        queue.set_rejecting(true);
        let err = queue
            .enqueue(DeliveryTask::SendMessage { item_id: ItemId(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn extended_lease_is_not_redelivered() {
        let queue = InMemoryTaskQueue::new(Duration::from_millis(40));
        let id = queue
            .enqueue(DeliveryTask::SendMessage { item_id: ItemId(5) })
            .await
            .unwrap();
        assert_eq!(queue.claim(1).await.unwrap().len(), 1);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(queue.extend_lease(id).await.unwrap());
            assert!(queue.claim(1).await.unwrap().is_empty());
        }

        queue.complete(id).await.unwrap();
        assert!(!queue.extend_lease(id).await.unwrap());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn completing_a_redelivered_task_removes_it() {
        let queue = InMemoryTaskQueue::new(Duration::from_millis(10));
        let id = queue
            .enqueue(DeliveryTask::SendMessage { item_id: ItemId(6) })
            .await
            .unwrap();
        queue.claim(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        // lapses and is requeued by another claimer's sweep
        assert_eq!(queue.claim(0).await.unwrap().len(), 0);
        assert_eq!(queue.pending().await.len(), 1);

        queue.complete(id).await.unwrap();
        assert!(queue.is_empty().await);
    }
}
