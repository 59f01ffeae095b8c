//! Reconciliation of the top-stories feed against delivered messages.
//!
//! A poll tick diffs the current feed batch against stored delivery records and
//! enqueues one send or edit task per item. A cleanup tick enqueues one delete
//! task per record past the retention window. Both ticks only wait for the
//! queue to acknowledge each task; the actuation itself runs later on the
//! worker group.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use yahnc_actuator::{DeliveryActuator, TelegramActuator, TelegramConfig};
use yahnc_core::{
    expiry_cutoff, Clock, DeliveryTask, SystemClock, TaskKind, BATCH_SIZE, DEFAULT_CHAT_ID,
    DEFAULT_HN_API_BASE, DEFAULT_TELEGRAM_API_BASE,
};
use yahnc_storage::{
    dedup_preserving_order, FeedSource, HackerNewsFeed, HttpClientConfig, HttpFetcher,
    InMemoryRecordStore, KeyLookup, PgRecordStore, RateLimit, RecordStore, RetryPolicy,
};

pub mod queue;
pub mod tasks;
pub mod worker;

pub use queue::{ClaimedTask, InMemoryTaskQueue, PgTaskQueue, QueueError, TaskQueue};
pub use tasks::{
    DeleteMessageHandler, EditMessageHandler, HandlerReport, Lifecycle, RegistryError,
    SendMessageHandler, TaskDispatcher, TaskHandler, TaskRegistry,
};
pub use worker::{drain_once, DrainSummary, WorkerConfig, WorkerGroup};

pub const CRATE_NAME: &str = "yahnc-sync";

/// Upper bound on enqueue calls a single tick keeps in flight.
pub const DEFAULT_ENQUEUE_CONCURRENCY: usize = 32;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub bot_key: Option<String>,
    pub chat_id: String,
    pub hn_api_base: String,
    pub telegram_api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Extra attempts for a retryable GET; zero leaves retrying to the next tick.
    pub http_retries: usize,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
    pub cleanup_cron: String,
    pub workers: usize,
    pub task_lease_secs: u64,
    pub enqueue_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bot_key: None,
            chat_id: DEFAULT_CHAT_ID.to_string(),
            hn_api_base: DEFAULT_HN_API_BASE.to_string(),
            telegram_api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            user_agent: "yahnc-bot/0.1".to_string(),
            http_timeout_secs: yahnc_core::DEFAULT_TIMEOUT.as_secs(),
            http_retries: 0,
            scheduler_enabled: false,
            poll_cron: "0 */10 * * * *".to_string(),
            cleanup_cron: "0 0 * * * *".to_string(),
            workers: 4,
            task_lease_secs: 600,
            enqueue_concurrency: DEFAULT_ENQUEUE_CONCURRENCY,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            bot_key: std::env::var("BOT_KEY").ok().filter(|v| !v.is_empty()),
            chat_id: std::env::var("YAHNC_CHAT_ID").unwrap_or(defaults.chat_id),
            hn_api_base: std::env::var("YAHNC_HN_API_BASE").unwrap_or(defaults.hn_api_base),
            telegram_api_base: std::env::var("YAHNC_TELEGRAM_API_BASE")
                .unwrap_or(defaults.telegram_api_base),
            user_agent: std::env::var("YAHNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("YAHNC_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            http_retries: env_parse("YAHNC_HTTP_RETRIES").unwrap_or(defaults.http_retries),
            scheduler_enabled: std::env::var("YAHNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            poll_cron: std::env::var("YAHNC_POLL_CRON").unwrap_or(defaults.poll_cron),
            cleanup_cron: std::env::var("YAHNC_CLEANUP_CRON").unwrap_or(defaults.cleanup_cron),
            workers: env_parse("YAHNC_WORKERS").unwrap_or(defaults.workers),
            task_lease_secs: env_parse("YAHNC_TASK_LEASE_SECS").unwrap_or(defaults.task_lease_secs),
            enqueue_concurrency: env_parse("YAHNC_ENQUEUE_CONCURRENCY")
                .unwrap_or(defaults.enqueue_concurrency),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn task_lease(&self) -> Duration {
        Duration::from_secs(self.task_lease_secs)
    }

    fn http_client(&self, rate_limit: Option<RateLimit>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy::retrying(self.http_retries),
            rate_limit,
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Poll,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TickStatus {
    Completed,
    Aborted(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub run_id: Uuid,
    pub tick: TickKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: TickStatus,
    pub sends: usize,
    pub edits: usize,
    pub deletes: usize,
    /// Keys whose individual lookup failed; no task was enqueued for them.
    pub skipped: usize,
    pub enqueue_failures: usize,
}

impl TickSummary {
    fn begin(tick: TickKind, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tick,
            started_at,
            finished_at: started_at,
            status: TickStatus::Completed,
            sends: 0,
            edits: 0,
            deletes: 0,
            skipped: 0,
            enqueue_failures: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TickStatus::Completed
    }

    pub fn enqueued(&self) -> usize {
        self.sends + self.edits + self.deletes
    }

    fn abort(mut self, reason: String, at: DateTime<Utc>) -> Self {
        self.status = TickStatus::Aborted(reason);
        self.finished_at = at;
        self
    }

    fn count(&mut self, kind: TaskKind) {
        match kind {
            TaskKind::SendMessage => self.sends += 1,
            TaskKind::EditMessage => self.edits += 1,
            TaskKind::DeleteMessage => self.deletes += 1,
        }
    }
}

/// Enqueue every task concurrently, at most `max_in_flight` at a time, and
/// return once each enqueue has been acknowledged or has failed.
async fn fan_out(
    queue: &Arc<dyn TaskQueue>,
    tasks: Vec<DeliveryTask>,
    max_in_flight: usize,
    summary: &mut TickSummary,
) {
    let mut in_flight = JoinSet::new();
    for task in tasks {
        if in_flight.len() >= max_in_flight.max(1) {
            if let Some(joined) = in_flight.join_next().await {
                settle(joined, summary);
            }
        }
        let queue = Arc::clone(queue);
        in_flight.spawn(async move { (task, queue.enqueue(task).await) });
    }
    while let Some(joined) = in_flight.join_next().await {
        settle(joined, summary);
    }
}

fn settle(
    joined: Result<(DeliveryTask, Result<Uuid, QueueError>), tokio::task::JoinError>,
    summary: &mut TickSummary,
) {
    match joined {
        Ok((task, Ok(task_id))) => {
            debug!(%task_id, kind = %task.kind(), item_id = %task.item_id(), "task enqueued");
            summary.count(task.kind());
        }
        Ok((task, Err(err))) => {
            error!(kind = %task.kind(), item_id = %task.item_id(), error = %err, "enqueue failed");
            summary.enqueue_failures += 1;
        }
        Err(err) => {
            error!(error = %err, "enqueue task panicked");
            summary.enqueue_failures += 1;
        }
    }
}

/// Poll-tick entry point: send unknown stories, edit known ones.
pub struct Reconciler {
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    max_in_flight: usize,
}

impl Reconciler {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            feed,
            store,
            queue,
            clock,
            batch_size: BATCH_SIZE,
            max_in_flight: DEFAULT_ENQUEUE_CONCURRENCY,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub async fn run_tick(&self) -> TickSummary {
        let summary = TickSummary::begin(TickKind::Poll, self.clock.now());
        let span = info_span!("poll_tick", run_id = %summary.run_id);
        self.reconcile(summary).instrument(span).await
    }

    async fn reconcile(&self, mut summary: TickSummary) -> TickSummary {
        let ids = match self.feed.top_stories(self.batch_size).await {
            Ok(ids) => dedup_preserving_order(ids)
                .into_iter()
                .take(self.batch_size)
                .collect::<Vec<_>>(),
            Err(err) => {
                error!(error = %err, timeout = err.is_timeout(), "fetching top stories failed");
                return summary.abort(format!("feed: {err}"), self.clock.now());
            }
        };

        let lookup = match self.store.get_many(&ids).await {
            Ok(lookup) => lookup,
            Err(err) => {
                error!(error = %err, "batched record lookup failed");
                return summary.abort(format!("store: {err}"), self.clock.now());
            }
        };
        if lookup.is_fully_known() {
            info!(items = lookup.len(), "no unknown news");
        } else if lookup.is_cold() {
            debug!(items = lookup.len(), "no stored records for batch");
        }

        let mut tasks = Vec::with_capacity(lookup.len());
        for (item_id, entry) in lookup.into_entries() {
            match entry {
                KeyLookup::Found(record) => tasks.push(DeliveryTask::EditMessage {
                    item_id,
                    message_id: record.message_id,
                }),
                KeyLookup::Missing => tasks.push(DeliveryTask::SendMessage { item_id }),
                KeyLookup::Failed(reason) => {
                    error!(%item_id, %reason, "record lookup failed; skipping item");
                    summary.skipped += 1;
                }
            }
        }

        fan_out(&self.queue, tasks, self.max_in_flight, &mut summary).await;
        summary.finished_at = self.clock.now();
        info!(
            sends = summary.sends,
            edits = summary.edits,
            skipped = summary.skipped,
            enqueue_failures = summary.enqueue_failures,
            "poll tick complete"
        );
        summary
    }
}

/// Cleanup-tick entry point: delete messages whose records aged out.
pub struct Expirer {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    max_in_flight: usize,
}

impl Expirer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            max_in_flight: DEFAULT_ENQUEUE_CONCURRENCY,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub async fn run_tick(&self) -> TickSummary {
        let summary = TickSummary::begin(TickKind::Cleanup, self.clock.now());
        let span = info_span!("cleanup_tick", run_id = %summary.run_id);
        self.expire(summary).instrument(span).await
    }

    async fn expire(&self, mut summary: TickSummary) -> TickSummary {
        let cutoff = expiry_cutoff(summary.started_at);
        let expired = match self.store.saved_before(cutoff).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "querying expired records failed");
                return summary.abort(format!("store: {err}"), self.clock.now());
            }
        };

        let tasks = expired
            .iter()
            .map(|record| DeliveryTask::DeleteMessage {
                item_id: record.item_id,
                message_id: record.message_id,
            })
            .collect();
        fan_out(&self.queue, tasks, self.max_in_flight, &mut summary).await;
        summary.finished_at = self.clock.now();
        info!(
            %cutoff,
            deletes = summary.deletes,
            enqueue_failures = summary.enqueue_failures,
            "cleanup tick complete"
        );
        summary
    }
}

async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("connecting to DATABASE_URL")
}

async fn migrate_pool(pool: &PgPool, config: &SyncConfig) -> Result<()> {
    PgRecordStore::new(pool.clone())
        .migrate()
        .await
        .context("migrating delivery_records")?;
    PgTaskQueue::new(pool.clone(), config.task_lease())
        .migrate()
        .await
        .context("migrating delivery_tasks")?;
    info!("delivery tables ready");
    Ok(())
}

/// Create the tables without wiring the rest of the runtime.
pub async fn migrate_from_config(config: &SyncConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to migrate")?;
    migrate_pool(&connect(url).await?, config).await
}

/// Everything a running deployment needs, wired from [`SyncConfig`].
pub struct SyncRuntime {
    config: SyncConfig,
    pool: Option<PgPool>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    reconciler: Arc<Reconciler>,
    expirer: Arc<Expirer>,
    dispatcher: Arc<TaskDispatcher>,
}

impl SyncRuntime {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let bot_key = config
            .bot_key
            .clone()
            .context("BOT_KEY must be set to reach the Telegram Bot API")?;

        let feed_http = Arc::new(HttpFetcher::new(config.http_client(None))?);
        let telegram_http = Arc::new(HttpFetcher::new(
            config.http_client(Some(RateLimit::TELEGRAM_CHANNEL)),
        )?);

        let feed = HackerNewsFeed::new(feed_http, config.hn_api_base.clone());
        let actuator = TelegramActuator::new(
            feed.clone(),
            telegram_http,
            TelegramConfig {
                api_base: config.telegram_api_base.clone(),
                bot_key,
                chat_id: config.chat_id.clone(),
            },
        );

        let (pool, store, queue): (Option<PgPool>, Arc<dyn RecordStore>, Arc<dyn TaskQueue>) =
            match &config.database_url {
                Some(url) => {
                    let pool = connect(url).await?;
                    (
                        Some(pool.clone()),
                        Arc::new(PgRecordStore::new(pool.clone())),
                        Arc::new(PgTaskQueue::new(pool, config.task_lease())),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; delivery state lives in memory only");
                    (
                        None,
                        Arc::new(InMemoryRecordStore::new()),
                        Arc::new(InMemoryTaskQueue::new(config.task_lease())),
                    )
                }
            };

        let mut runtime = Self::from_parts(
            config,
            Arc::new(feed),
            store,
            queue,
            Arc::new(actuator),
            Arc::new(SystemClock),
        )?;
        runtime.pool = pool;
        Ok(runtime)
    }

    pub fn from_parts(
        config: SyncConfig,
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        actuator: Arc<dyn DeliveryActuator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = TaskRegistry::lifecycle(Lifecycle::new(
            actuator,
            Arc::clone(&store),
            Arc::clone(&clock),
        ))?;
        let reconciler = Reconciler::new(
            feed,
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&clock),
        )
        .with_max_in_flight(config.enqueue_concurrency);
        let expirer = Expirer::new(Arc::clone(&store), Arc::clone(&queue), clock)
            .with_max_in_flight(config.enqueue_concurrency);

        Ok(Self {
            config,
            pool: None,
            store,
            queue,
            reconciler: Arc::new(reconciler),
            expirer: Arc::new(expirer),
            dispatcher: Arc::new(TaskDispatcher::new(Arc::new(registry))),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    pub fn expirer(&self) -> Arc<Expirer> {
        Arc::clone(&self.expirer)
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Create the Postgres tables; a no-op for the in-memory setup.
    pub async fn migrate(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => migrate_pool(pool, &self.config).await,
            None => {
                info!("no database configured; nothing to migrate");
                Ok(())
            }
        }
    }

    pub fn spawn_workers(&self) -> WorkerGroup {
        WorkerGroup::spawn(
            self.config.workers.max(1),
            self.queue(),
            self.dispatcher(),
            WorkerConfig::default(),
        )
    }

    pub async fn drain(&self) -> Result<DrainSummary> {
        drain_once(self.queue.as_ref(), &self.dispatcher)
            .await
            .context("draining task queue")
    }

    /// Cron-driven poll and cleanup ticks, when enabled. The caller starts it.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let reconciler = self.reconciler();
        let poll = Job::new_async(self.config.poll_cron.as_str(), move |_uuid, _l| {
            let reconciler = Arc::clone(&reconciler);
            Box::pin(async move {
                reconciler.run_tick().await;
            })
        })
        .with_context(|| format!("creating poll job for cron {}", self.config.poll_cron))?;
        sched.add(poll).await.context("adding poll job")?;

        let expirer = self.expirer();
        let cleanup = Job::new_async(self.config.cleanup_cron.as_str(), move |_uuid, _l| {
            let expirer = Arc::clone(&expirer);
            Box::pin(async move {
                expirer.run_tick().await;
            })
        })
        .with_context(|| format!("creating cleanup job for cron {}", self.config.cleanup_cron))?;
        sched.add(cleanup).await.context("adding cleanup job")?;

        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::tests::{noon, saved, ScriptedActuator};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use yahnc_core::{FixedClock, ItemId, MessageId};
    use yahnc_storage::{FetchError, StoreError};

    struct StaticFeed(Mutex<Result<Vec<ItemId>, String>>);

    impl StaticFeed {
        fn ok(ids: impl IntoIterator<Item = i64>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Ok(ids.into_iter().map(ItemId).collect()))))
        }

        fn malformed() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Err(r#"{"error":"nope"}"#.into()))))
        }
    }

    #[async_trait]
    impl FeedSource for StaticFeed {
        async fn top_stories(&self, limit: usize) -> Result<Vec<ItemId>, FetchError> {
            let current = self.0.lock().unwrap().clone();
            match current {
                Ok(ids) => Ok(ids.into_iter().take(limit).collect()),
                Err(body) => Err(FetchError::Decode {
                    url: "topstories.json".into(),
                    source: serde_json::from_str::<Vec<i64>>(&body).unwrap_err(),
                }),
            }
        }
    }

    struct Harness {
        store: Arc<InMemoryRecordStore>,
        queue: Arc<InMemoryTaskQueue>,
        clock: Arc<FixedClock>,
    }

    impl Harness {
        async fn new(records: Vec<yahnc_core::DeliveryRecord>) -> Self {
            Self {
                store: Arc::new(InMemoryRecordStore::with_records(records).await),
                queue: Arc::new(InMemoryTaskQueue::default()),
                clock: Arc::new(FixedClock::new(noon())),
            }
        }

        fn reconciler(&self, feed: Arc<StaticFeed>) -> Reconciler {
            Reconciler::new(
                feed,
                self.store.clone(),
                self.queue.clone(),
                self.clock.clone(),
            )
        }

        fn expirer(&self) -> Expirer {
            Expirer::new(self.store.clone(), self.queue.clone(), self.clock.clone())
        }

        async fn kinds(&self) -> (usize, usize, usize) {
            let pending = self.queue.pending().await;
            let count = |k: TaskKind| pending.iter().filter(|t| t.kind() == k).count();
            (
                count(TaskKind::SendMessage),
                count(TaskKind::EditMessage),
                count(TaskKind::DeleteMessage),
            )
        }
    }

    #[tokio::test]
    async fn poll_splits_batch_into_sends_and_edits() {
        let known: Vec<_> = (1..=12).map(|id| saved(id, id * 10, noon())).collect();
        let h = Harness::new(known).await;

        let summary = h.reconciler(StaticFeed::ok(1..=30)).run_tick().await;

        assert!(summary.is_completed());
        assert_eq!((summary.sends, summary.edits), (18, 12));
        assert_eq!(h.kinds().await, (18, 12, 0));

        let pending = h.queue.pending().await;
        for id in 1..=30 {
            let for_item: Vec<_> = pending
                .iter()
                .filter(|t| t.item_id() == ItemId(id))
                .collect();
            assert_eq!(for_item.len(), 1, "item {id} must get exactly one task");
        }
        assert!(pending.contains(&DeliveryTask::EditMessage {
            item_id: ItemId(7),
            message_id: MessageId(70),
        }));
    }

    #[tokio::test]
    async fn cold_batch_sends_everything() {
        let h = Harness::new(vec![]).await;
        let summary = h.reconciler(StaticFeed::ok(1..=30)).run_tick().await;
        assert_eq!((summary.sends, summary.edits), (30, 0));
    }

    #[tokio::test]
    async fn missing_keys_do_not_abort_tick() {
        let known: Vec<_> = (1..=25).map(|id| saved(id, id, noon())).collect();
        let h = Harness::new(known).await;

        let summary = h.reconciler(StaticFeed::ok(1..=30)).run_tick().await;

        assert!(summary.is_completed());
        assert_eq!(summary.enqueued(), 30);
        assert_eq!(h.kinds().await, (5, 25, 0));
    }

    #[tokio::test]
    async fn failed_keys_are_skipped() {
        let h = Harness::new(vec![saved(1, 1, noon())]).await;
        h.store.fail_key(ItemId(2)).await;

        let summary = h.reconciler(StaticFeed::ok([1, 2, 3])).run_tick().await;

        assert!(summary.is_completed());
        assert_eq!(summary.skipped, 1);
        assert_eq!(h.kinds().await, (1, 1, 0));
    }

    #[tokio::test]
    async fn duplicate_feed_ids_get_one_task() {
        let h = Harness::new(vec![]).await;
        let summary = h.reconciler(StaticFeed::ok([5, 5, 6])).run_tick().await;
        assert_eq!(summary.sends, 2);
    }

    #[tokio::test]
    async fn store_outage_aborts_without_tasks() {
        let h = Harness::new(vec![]).await;
        h.store.set_unavailable(true);

        let summary = h.reconciler(StaticFeed::ok(1..=30)).run_tick().await;

        assert!(matches!(summary.status, TickStatus::Aborted(ref r) if r.starts_with("store")));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_feed_aborts_without_tasks() {
        let h = Harness::new(vec![]).await;

        let summary = h.reconciler(StaticFeed::malformed()).run_tick().await;

        assert!(matches!(summary.status, TickStatus::Aborted(ref r) if r.starts_with("feed")));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn enqueue_failures_are_counted_not_raised() {
        let h = Harness::new(vec![]).await;
        h.queue.set_rejecting(true);

        let summary = h.reconciler(StaticFeed::ok([1, 2])).run_tick().await;

        assert!(summary.is_completed());
        assert_eq!(summary.enqueue_failures, 2);
        assert_eq!(summary.enqueued(), 0);
    }

    #[tokio::test]
    async fn bounded_fan_out_still_enqueues_all() {
        let h = Harness::new(vec![]).await;
        let summary = h
            .reconciler(StaticFeed::ok(1..=30))
            .with_max_in_flight(3)
            .run_tick()
            .await;
        assert_eq!(summary.sends, 30);
    }

    #[tokio::test]
    async fn cleanup_selects_only_expired_records() {
        let h = Harness::new(vec![
            saved(1, 10, noon() - chrono::Duration::hours(25)),
            saved(2, 20, noon() - chrono::Duration::hours(23)),
        ])
        .await;

        let summary = h.expirer().run_tick().await;

        assert!(summary.is_completed());
        assert_eq!(summary.deletes, 1);
        assert_eq!(
            h.queue.pending().await,
            vec![DeliveryTask::DeleteMessage {
                item_id: ItemId(1),
                message_id: MessageId(10),
            }]
        );
    }

    #[tokio::test]
    async fn cleanup_store_failure_aborts() {
        let h = Harness::new(vec![saved(1, 10, noon() - chrono::Duration::hours(25))]).await;
        h.store.set_unavailable(true);

        let summary = h.expirer().run_tick().await;

        assert!(!summary.is_completed());
        assert!(h.queue.is_empty().await);
    }

    fn runtime(h: &Harness, feed: Arc<StaticFeed>, actuator: Arc<ScriptedActuator>) -> SyncRuntime {
        SyncRuntime::from_parts(
            SyncConfig::default(),
            feed,
            h.store.clone(),
            h.queue.clone(),
            actuator,
            h.clock.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn poll_then_deliver_end_to_end() {
        let h = Harness::new(vec![saved(102, 42, noon() - chrono::Duration::hours(1))]).await;
        let actuator = Arc::new(ScriptedActuator::default());
        let rt = runtime(&h, StaticFeed::ok([101, 102, 103]), actuator.clone());

        rt.reconciler().run_tick().await;
        let pending = h.queue.pending().await;
        assert_eq!(pending.len(), 3);
        assert!(pending.contains(&DeliveryTask::SendMessage { item_id: ItemId(101) }));
        assert!(pending.contains(&DeliveryTask::SendMessage { item_id: ItemId(103) }));
        assert!(pending.contains(&DeliveryTask::EditMessage {
            item_id: ItemId(102),
            message_id: MessageId(42),
        }));

        // The scripted actuator answers send(101) with message 1101; pin it to 555.
        let claimed = h.queue.claim(10).await.unwrap();
        let send_101 = claimed
            .iter()
            .find(|c| c.task == DeliveryTask::SendMessage { item_id: ItemId(101) })
            .unwrap();
        actuator
            .push(yahnc_actuator::Actuation::Delivered(MessageId(555)))
            .await;
        let report = rt.dispatcher().execute(send_101).await;
        assert_eq!(
            report,
            HandlerReport::Stored {
                message_id: MessageId(555)
            }
        );

        let stored = h.store.get(ItemId(101)).await.unwrap().unwrap();
        assert_eq!(stored.item_id, ItemId(101));
        assert_eq!(stored.message_id, MessageId(555));
        assert_eq!(stored.last_saved, h.clock.now());
    }

    #[tokio::test]
    async fn failed_delete_is_selected_again_next_cleanup() {
        let h = Harness::new(vec![saved(7, 70, noon() - chrono::Duration::hours(25))]).await;
        let actuator = Arc::new(ScriptedActuator::default());
        actuator
            .push(yahnc_actuator::Actuation::Failed(
                yahnc_actuator::ActuatorError::NoMessage(ItemId(7)),
            ))
            .await;
        let rt = runtime(&h, StaticFeed::ok([]), actuator);

        assert_eq!(rt.expirer().run_tick().await.deletes, 1);
        let drained = rt.drain().await.unwrap();
        assert_eq!(drained.failed, 1);
        assert!(h.store.get(ItemId(7)).await.unwrap().is_some());

        assert_eq!(rt.expirer().run_tick().await.deletes, 1);
        let drained = rt.drain().await.unwrap();
        assert_eq!(drained.removed, 1);
        assert!(h.store.get(ItemId(7)).await.unwrap().is_none());

        assert_eq!(rt.expirer().run_tick().await.deletes, 0);
    }

    #[tokio::test]
    async fn ineligible_send_never_produces_a_record() {
        let h = Harness::new(vec![]).await;
        let actuator = Arc::new(ScriptedActuator::default());
        actuator
            .push(yahnc_actuator::Actuation::Ineligible(
                yahnc_core::IneligibleReason::LowScore { score: 10 },
            ))
            .await;
        let rt = runtime(&h, StaticFeed::ok([101]), actuator);

        rt.reconciler().run_tick().await;
        let drained = rt.drain().await.unwrap();

        assert_eq!(drained.ineligible, 1);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let h = Harness::new(vec![]).await;
        let rt = runtime(&h, StaticFeed::ok([]), Arc::new(ScriptedActuator::default()));
        assert!(rt.maybe_build_scheduler().await.unwrap().is_none());
        rt.migrate().await.unwrap();
    }

    #[test]
    fn store_error_message_mentions_store() {
        let err = StoreError::Unavailable("down".into());
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn poll_and_cleanup_share_one_enqueue_bound() {
        let h = Harness::new(Vec::new()).await;
        let reconciler = h.reconciler(StaticFeed::ok(1..=3));
        let expirer = h.expirer();

        assert_eq!(reconciler.max_in_flight, DEFAULT_ENQUEUE_CONCURRENCY);
        assert_eq!(expirer.max_in_flight, reconciler.max_in_flight);
        assert_eq!(
            SyncConfig::default().enqueue_concurrency,
            DEFAULT_ENQUEUE_CONCURRENCY
        );
    }
}
