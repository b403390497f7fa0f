//! Drives automatic feed updates: one task per (system, feed), each on its
//! own ticker, all supervised by a single run loop.
//!
//! Refreshing a system's schedule goes through the run loop, so a swap never
//! races with tick dispatch: the old feed tasks are stopped and joined
//! before the new ones start, and the caller is only acknowledged after the
//! swap is complete.

pub mod ticker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::querier::{Querier, QueryResult};
use crate::db::types::{Feed, Pk, UpdateSchedule};
use ticker::Ticker;

/// Applied when a feed is marked for auto update but carries no schedule.
const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

/// The update entry point the scheduler invokes on every tick, supplied by
/// the orchestration layer. Arguments are the system id and feed id.
pub type UpdateFunc = Arc<
    dyn Fn(String, String) -> BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("the scheduler is not running")]
    NotRunning,
}

struct RefreshRequest {
    system_id: String,
    done: oneshot::Sender<()>,
}

/// Cloneable handle for talking to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    requests: mpsc::Sender<RefreshRequest>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Replaces the system's schedule with one freshly built from the
    /// current feed configuration. Returns once the run loop has stopped the
    /// old feed tasks and started the new ones, so no update for a dropped
    /// feed can fire after this resolves.
    pub async fn refresh(&self, system_id: &str) -> Result<(), SchedulerError> {
        let (done, ack) = oneshot::channel();
        self.requests
            .send(RefreshRequest {
                system_id: system_id.to_string(),
                done,
            })
            .await
            .map_err(|_| SchedulerError::NotRunning)?;
        ack.await.map_err(|_| SchedulerError::NotRunning)
    }

    /// Asks the scheduler to shut down. Awaiting the task running
    /// [`Scheduler::run`] afterwards makes the stop synchronous.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct Scheduler {
    querier: Arc<dyn Querier>,
    update_func: UpdateFunc,
    cancel: CancellationToken,
    request_tx: mpsc::Sender<RefreshRequest>,
    request_rx: mpsc::Receiver<RefreshRequest>,
    /// Feeds per system id, collected at construction, started by `run`.
    pending: HashMap<String, Vec<Feed>>,
}

impl Scheduler {
    /// Reads every system's auto-update feeds and builds an unstarted
    /// scheduler covering them.
    pub async fn new(querier: Arc<dyn Querier>, update_func: UpdateFunc) -> QueryResult<Scheduler> {
        let mut pending = HashMap::new();
        for system in querier.list_systems().await? {
            let feeds = auto_update_feeds(querier.as_ref(), system.pk).await?;
            if !feeds.is_empty() {
                pending.insert(system.id, feeds);
            }
        }
        let (request_tx, request_rx) = mpsc::channel(1);
        Ok(Scheduler {
            querier,
            update_func,
            cancel: CancellationToken::new(),
            request_tx,
            request_rx,
            pending,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            requests: self.request_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Starts every feed task, signals readiness, then serves refresh
    /// requests until shut down. On shutdown every system scheduler is
    /// stopped and joined before this returns.
    pub async fn run(mut self, ready: oneshot::Sender<()>) {
        let mut systems: HashMap<String, SystemScheduler> = self
            .pending
            .drain()
            .map(|(system_id, feeds)| {
                let scheduler = SystemScheduler::start(&system_id, feeds, &self.update_func);
                (system_id, scheduler)
            })
            .collect();
        log::info!("Scheduler running with {} systems", systems.len());
        let _ = ready.send(());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = self.request_rx.recv() => {
                    match request {
                        Some(request) => self.install(&mut systems, request).await,
                        None => break,
                    }
                }
            }
        }

        log::info!("Scheduler stopping {} systems", systems.len());
        for (_, scheduler) in systems.drain() {
            scheduler.stop().await;
        }
    }

    async fn install(
        &self,
        systems: &mut HashMap<String, SystemScheduler>,
        request: RefreshRequest,
    ) {
        if let Some(old) = systems.remove(&request.system_id) {
            old.stop().await;
        }
        match self.feeds_for(&request.system_id).await {
            Ok(feeds) if !feeds.is_empty() => {
                let scheduler = SystemScheduler::start(&request.system_id, feeds, &self.update_func);
                systems.insert(request.system_id.clone(), scheduler);
            }
            Ok(_) => {
                log::info!("System {} has no auto-update feeds", request.system_id);
            }
            Err(err) => {
                log::error!("Failed to refresh system {}: {}", request.system_id, err);
            }
        }
        let _ = request.done.send(());
    }

    async fn feeds_for(&self, system_id: &str) -> QueryResult<Vec<Feed>> {
        match self.querier.get_system(system_id).await? {
            Some(system) => auto_update_feeds(self.querier.as_ref(), system.pk).await,
            None => Ok(Vec::new()),
        }
    }
}

async fn auto_update_feeds(querier: &dyn Querier, system_pk: Pk) -> QueryResult<Vec<Feed>> {
    Ok(querier
        .list_feeds(system_pk)
        .await?
        .into_iter()
        .filter(|f| f.auto_update)
        .collect())
}

/// The running feed tasks of one system, stopped and replaced as a unit.
struct SystemScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SystemScheduler {
    fn start(system_id: &str, feeds: Vec<Feed>, update_func: &UpdateFunc) -> SystemScheduler {
        let cancel = CancellationToken::new();
        let tasks = feeds
            .into_iter()
            .map(|feed| {
                let ticker = ticker_for(&feed);
                tokio::spawn(feed_loop(
                    system_id.to_string(),
                    feed.id,
                    ticker,
                    cancel.clone(),
                    update_func.clone(),
                ))
            })
            .collect();
        SystemScheduler { cancel, tasks }
    }

    /// Cancels and joins every feed task. No update fires after this
    /// returns.
    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn ticker_for(feed: &Feed) -> Ticker {
    match &feed.schedule {
        Some(UpdateSchedule::Periodic { period }) => Ticker::periodic(*period),
        Some(UpdateSchedule::Daily {
            hour,
            minute,
            timezone,
        }) => Ticker::daily(*hour, *minute, *timezone),
        None => Ticker::periodic(DEFAULT_PERIOD),
    }
}

async fn feed_loop(
    system_id: String,
    feed_id: String,
    mut ticker: Ticker,
    cancel: CancellationToken,
    update_func: UpdateFunc,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            tick = ticker.tick() => {
                if tick.is_none() {
                    break;
                }
                if let Err(err) = (update_func)(system_id.clone(), feed_id.clone()).await {
                    log::error!("Scheduled update of {}/{} failed: {}", system_id, feed_id, err);
                }
            }
        }
    }
    ticker.stop().await;
}
