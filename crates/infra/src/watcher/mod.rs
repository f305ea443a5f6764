//! Watchers: the consumer loop of one channel.
//!
//! A watcher claims ids from its channel into the channel's working set,
//! hands each job to a handler, and applies the handler's route token. Many
//! watchers (threads or processes) may serve the same channel; they share
//! nothing but the store.

pub mod context;

pub use context::{ContextError, WatchContext};

use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use switchyard_core::keys::{WATCH_REGISTRY_KEY, watch_registry_member, working_set_key};
use switchyard_core::{ChannelName, JobId, RouteAction, RouteToken, SessionId};

use crate::channel::{CONSTANT_SCORE, ChannelError, ChannelResult, Channels};

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Name used in logs and in the watch registry.
    pub name: String,
    /// Ids claimed per iteration.
    pub batch_size: usize,
    /// Sleep after an empty, paused or failed claim.
    pub poll_interval: Duration,
    /// Upper bound of the blocking pop inside one claim.
    pub pop_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            name: "watcher".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_millis(250),
            pop_timeout: Duration::from_secs(1),
        }
    }
}

impl WatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_pop_timeout(mut self, pop_timeout: Duration) -> Self {
        self.pop_timeout = pop_timeout;
        self
    }
}

/// Watcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub dispatched: u64,
    /// Advanced on the fast path.
    pub advanced: u64,
    /// Advanced through a `sync` log entry.
    pub deferred: u64,
    pub deleted: u64,
    /// Handler returned no token.
    pub released: u64,
    /// Token from another session or for another job.
    pub rejected: u64,
    /// Left in the working set after a store failure.
    pub failed: u64,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Released,
    Rejected,
    Advanced { to: ChannelName, deferred: bool },
    Deleted,
    /// Loading, the routing action or the release failed. The id is still in
    /// the working set; see [`Channels::requeue_orphans`]. If only the release
    /// failed, the action already took effect and a requeue would dispatch the
    /// job a second time.
    Failed,
}

/// Result of one claim-and-dispatch iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing was claimed.
    Idle,
    Dispatched(Vec<(JobId, DispatchOutcome)>),
}

/// Handle to control a running watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WatcherStats>>,
}

impl WatcherHandle {
    /// Request shutdown and wait for the current iteration to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Consumer of one channel, bound to one session.
pub struct Watcher {
    config: WatcherConfig,
    channel: ChannelName,
    working_set: String,
    session: SessionId,
    channels: Channels,
    stats: Arc<Mutex<WatcherStats>>,
}

impl Watcher {
    pub fn new(channels: Channels, channel: ChannelName, config: WatcherConfig) -> Self {
        Self {
            working_set: working_set_key(&channel),
            config,
            channel,
            session: SessionId::new(),
            channels,
            stats: Arc::new(Mutex::new(WatcherStats::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn stats(&self) -> WatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Claim one batch and dispatch every claimed job.
    ///
    /// Channel state errors (paused, missing) and claim failures are
    /// returned; per-job failures are logged and reported as
    /// [`DispatchOutcome::Failed`].
    pub fn run_once<F>(&self, handler: &mut F) -> ChannelResult<Iteration>
    where
        F: FnMut(&mut WatchContext<'_>) -> Option<RouteToken>,
    {
        let ids = self.channels.claim(
            &self.channel,
            &self.working_set,
            self.config.batch_size,
            self.config.pop_timeout,
        )?;
        if ids.is_empty() {
            return Ok(Iteration::Idle);
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = match self.dispatch(&id, handler) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        watcher = %self.config.name,
                        channel = %self.channel,
                        job_id = %id,
                        error = %e,
                        "dispatch failed; job left in working set"
                    );
                    DispatchOutcome::Failed
                }
            };
            self.tally(&outcome);
            outcomes.push((id, outcome));
        }
        Ok(Iteration::Dispatched(outcomes))
    }

    fn dispatch<F>(&self, id: &JobId, handler: &mut F) -> ChannelResult<DispatchOutcome>
    where
        F: FnMut(&mut WatchContext<'_>) -> Option<RouteToken>,
    {
        // A missing record still dispatches, with no fields.
        let record = self.channels.load_record(id)?.unwrap_or_default();
        let mut ctx = WatchContext::new(
            id.clone(),
            self.channel.clone(),
            record,
            self.session.clone(),
            self.channels.store(),
        );
        let token = handler(&mut ctx);
        let mutated = ctx.has_changes();

        self.apply(id, token, mutated)
    }

    fn apply(
        &self,
        id: &JobId,
        token: Option<RouteToken>,
        mutated: bool,
    ) -> ChannelResult<DispatchOutcome> {
        let Some(token) = token else {
            self.channels.release(&self.working_set, id)?;
            return Ok(DispatchOutcome::Released);
        };

        if !token.is_issued_for(id, &self.session) {
            warn!(
                watcher = %self.config.name,
                job_id = %id,
                token_job_id = %token.job_id(),
                "route token was not issued for this dispatch; releasing only"
            );
            self.channels.release(&self.working_set, id)?;
            return Ok(DispatchOutcome::Rejected);
        }

        // Release only once the action is applied, so a failed action keeps
        // the id recoverable from the working set.
        let outcome = match token.action() {
            RouteAction::Delete => {
                self.channels.delete(id)?;
                DispatchOutcome::Deleted
            }
            RouteAction::Advance(to) => {
                self.channels.advance(id, &self.channel, to, mutated)?;
                DispatchOutcome::Advanced {
                    to: to.clone(),
                    deferred: mutated,
                }
            }
        };
        self.channels.release(&self.working_set, id)?;
        Ok(outcome)
    }

    fn tally(&self, outcome: &DispatchOutcome) {
        let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.dispatched += 1;
        match outcome {
            DispatchOutcome::Released => s.released += 1,
            DispatchOutcome::Rejected => s.rejected += 1,
            DispatchOutcome::Advanced { deferred: true, .. } => s.deferred += 1,
            DispatchOutcome::Advanced { deferred: false, .. } => s.advanced += 1,
            DispatchOutcome::Deleted => s.deleted += 1,
            DispatchOutcome::Failed => s.failed += 1,
        }
    }

    /// Run until a shutdown signal arrives or its sender is dropped.
    ///
    /// The signal is checked between iterations only: an in-flight batch is
    /// always finished first.
    pub fn run<F>(self, mut handler: F, shutdown_rx: mpsc::Receiver<()>)
    where
        F: FnMut(&mut WatchContext<'_>) -> Option<RouteToken>,
    {
        let member = watch_registry_member(&self.config.name, &self.channel);
        if let Err(e) = self
            .channels
            .store()
            .push_sorted(WATCH_REGISTRY_KEY, &member, CONSTANT_SCORE)
        {
            warn!(watcher = %self.config.name, error = %e, "failed to register watcher");
        }
        info!(watcher = %self.config.name, channel = %self.channel, "watcher started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match self.run_once(&mut handler) {
                Ok(Iteration::Dispatched(outcomes)) => {
                    debug!(
                        watcher = %self.config.name,
                        channel = %self.channel,
                        count = outcomes.len(),
                        "dispatched batch"
                    );
                }
                Ok(Iteration::Idle) => thread::sleep(self.config.poll_interval),
                Err(ChannelError::ChannelPaused(_)) => thread::sleep(self.config.poll_interval),
                Err(e @ ChannelError::ChannelMissing(_)) => {
                    warn!(watcher = %self.config.name, error = %e, "channel not initialised yet");
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) => {
                    error!(watcher = %self.config.name, channel = %self.channel, error = %e, "failed to claim jobs");
                    thread::sleep(self.config.poll_interval);
                }
            }
        }

        if let Err(e) = self.channels.store().remove_sorted(WATCH_REGISTRY_KEY, &member) {
            warn!(watcher = %self.config.name, error = %e, "failed to deregister watcher");
        }
        info!(watcher = %self.config.name, channel = %self.channel, "watcher stopped");
    }

    /// Run the loop on a background thread.
    pub fn spawn<F>(self, handler: F) -> WatcherHandle
    where
        F: FnMut(&mut WatchContext<'_>) -> Option<RouteToken> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let name = self.config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || self.run(handler, shutdown_rx))
            .expect("failed to spawn watcher thread");

        WatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use switchyard_core::keys::{COMMAND_LOG_KEY, channel_queue_key};

    use crate::store::{InMemoryStore, SharedStore, Store};

    const NO_FIELDS: [(&str, &str); 0] = [];

    fn ch(name: &str) -> ChannelName {
        ChannelName::new(name).unwrap()
    }

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn setup() -> (SharedStore, Channels) {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let channels = Channels::new(store.clone());
        (store, channels)
    }

    fn config() -> WatcherConfig {
        WatcherConfig::default()
            .with_name("w-test")
            .with_poll_interval(Duration::from_millis(5))
            .with_pop_timeout(Duration::from_millis(20))
    }

    #[test]
    fn empty_channel_is_idle() {
        let (_, channels) = setup();
        channels.ensure_status(&ch("intake")).unwrap();
        let w = Watcher::new(channels, ch("intake"), config());
        assert_eq!(w.run_once(&mut |_| None).unwrap(), Iteration::Idle);
    }

    #[test]
    fn no_token_only_releases() {
        let (store, channels) = setup();
        channels.enqueue(&ch("intake"), &job("j1"), NO_FIELDS).unwrap();
        let w = Watcher::new(channels.clone(), ch("intake"), config());

        let it = w.run_once(&mut |_| None).unwrap();
        assert_eq!(
            it,
            Iteration::Dispatched(vec![(job("j1"), DispatchOutcome::Released)])
        );
        assert!(!store.exists("workingset_intake").unwrap());
        assert!(channels.load_record(&job("j1")).unwrap().is_some());
        assert_eq!(w.stats().released, 1);
    }

    #[test]
    fn delete_token_removes_record() {
        let (store, channels) = setup();
        channels.enqueue(&ch("intake"), &job("j1"), NO_FIELDS).unwrap();
        let w = Watcher::new(channels.clone(), ch("intake"), config());

        w.run_once(&mut |ctx| Some(ctx.no_op())).unwrap();

        assert_eq!(channels.load_record(&job("j1")).unwrap(), None);
        assert_eq!(store.list_range(COMMAND_LOG_KEY).unwrap(), vec!["j1||delete"]);
        assert_eq!(w.stats().deleted, 1);
    }

    #[test]
    fn handler_sees_loaded_record() {
        let (_, channels) = setup();
        channels
            .enqueue(&ch("intake"), &job("j1"), [("status", "new")])
            .unwrap();
        let w = Watcher::new(channels, ch("intake"), config());

        let mut seen = String::new();
        w.run_once(&mut |ctx| {
            seen = format!("{}:{}", ctx.record().id(), ctx.string("status"));
            None
        })
        .unwrap();
        assert_eq!(seen, "j1:new");
    }

    #[test]
    fn token_from_another_session_is_rejected() {
        let (store, channels) = setup();
        let (intake, done) = (ch("intake"), ch("done"));
        channels.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();

        let a = Watcher::new(channels.clone(), intake.clone(), config());
        let mut captured = None;
        a.run_once(&mut |ctx| {
            captured = Some(ctx.route(&done));
            None
        })
        .unwrap();
        let foreign = captured.unwrap();

        channels.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();
        let b = Watcher::new(channels.clone(), intake.clone(), config());
        let it = b.run_once(&mut |_| Some(foreign.clone())).unwrap();

        assert_eq!(
            it,
            Iteration::Dispatched(vec![(job("j1"), DispatchOutcome::Rejected)])
        );
        assert!(!store.exists(&channel_queue_key(&done)).unwrap());
        assert!(channels.load_record(&job("j1")).unwrap().is_some());
        assert_eq!(b.stats().rejected, 1);
    }

    #[test]
    fn token_for_another_job_is_rejected() {
        let (_, channels) = setup();
        let intake = ch("intake");
        channels.enqueue(&intake, &job("a"), NO_FIELDS).unwrap();
        channels.enqueue(&intake, &job("b"), NO_FIELDS).unwrap();
        let w = Watcher::new(channels.clone(), intake, config());

        // Delete token for "a" returned for every job in the batch.
        let mut first = None;
        let it = w
            .run_once(&mut |ctx| {
                let token = first.get_or_insert_with(|| ctx.no_op()).clone();
                Some(token)
            })
            .unwrap();

        assert_eq!(
            it,
            Iteration::Dispatched(vec![
                (job("a"), DispatchOutcome::Deleted),
                (job("b"), DispatchOutcome::Rejected),
            ])
        );
        assert!(channels.load_record(&job("b")).unwrap().is_some());
    }

    #[test]
    fn failed_advance_keeps_job_in_working_set() {
        let (store, channels) = setup();
        let (intake, done) = (ch("intake"), ch("done"));
        channels.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();
        // A list where the destination queue should be makes the advance fail.
        store.push_list(&channel_queue_key(&done), "x").unwrap();
        let w = Watcher::new(channels.clone(), intake.clone(), config());

        let it = w.run_once(&mut |ctx| Some(ctx.route(&done))).unwrap();

        assert_eq!(
            it,
            Iteration::Dispatched(vec![(job("j1"), DispatchOutcome::Failed)])
        );
        assert_eq!(store.list_range("workingset_intake").unwrap(), vec!["j1"]);
        assert_eq!(w.stats().failed, 1);

        assert_eq!(channels.requeue_orphans(&intake).unwrap(), vec![job("j1")]);
        assert!(store.contains_sorted(&channel_queue_key(&intake), "j1").unwrap());
    }

    #[test]
    fn paused_channel_is_reported() {
        let (_, channels) = setup();
        channels.enqueue(&ch("intake"), &job("j1"), NO_FIELDS).unwrap();
        channels.pause(&ch("intake")).unwrap();
        let w = Watcher::new(channels, ch("intake"), config());
        assert!(matches!(
            w.run_once(&mut |_| None),
            Err(ChannelError::ChannelPaused(_))
        ));
    }

    #[test]
    fn spawned_watcher_routes_and_deregisters() {
        let (store, channels) = setup();
        let (intake, done) = (ch("intake"), ch("done"));
        channels.ensure_status(&intake).unwrap();

        let watcher = Watcher::new(channels.clone(), intake.clone(), config());
        let target = done.clone();
        let handle = watcher.spawn(move |ctx| Some(ctx.route(&target)));

        channels.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().advanced == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(store.contains_sorted(WATCH_REGISTRY_KEY, "w-test|intake").unwrap());

        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.advanced, 1);
        assert!(store.contains_sorted(&channel_queue_key(&done), "j1").unwrap());
        assert!(!store.contains_sorted(WATCH_REGISTRY_KEY, "w-test|intake").unwrap());
    }
}
