// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Drives the reconciler from store notifications.
//!
//! Notifications are turned into [Trigger]s and put on a [WorkQueue]. A fixed number of
//! workers take triggers off the queue and run the reconciler. A trigger is never handled
//! by two workers at once; adding a trigger while it is being handled queues it again once
//! the running attempt is done.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use derive_more::Display;
use tokio::{
    sync::{
        Notify,
        broadcast::{self, error::RecvError},
        mpsc,
    },
    time::MissedTickBehavior,
};
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, RetryPolicy},
    metrics::Metrics,
    reconciler::{ReconcileError, Reconciler},
    store::{ChangeEvent, ChangeKind, ObjectKey},
    tasks::TaskSet,
};

/// What to reconcile.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Trigger {
    /// Commit and sweep the manager state of a namespace.
    #[display("manager {_0}")]
    Manager(String),
    /// Serve the requests of a requester.
    #[display("requester {_0}")]
    Requester(ObjectKey),
}

impl Trigger {
    fn label(&self) -> &'static str {
        match self {
            Trigger::Manager(_) => "manager",
            Trigger::Requester(_) => "requester",
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Trigger>,
    queued: HashSet<Trigger>,
    active: HashSet<Trigger>,
    /// Added while active.
    dirty: HashSet<Trigger>,
}

/// De-duplicating queue of triggers.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `trigger` unless it is already queued.
    pub fn add(&self, trigger: Trigger) {
        let mut state = self.state.lock().unwrap();
        if state.active.contains(&trigger) {
            state.dirty.insert(trigger);
            return;
        }
        if state.queued.insert(trigger.clone()) {
            state.pending.push_back(trigger);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Waits for the next trigger and marks it active.
    ///
    /// Every trigger returned must be passed to [WorkQueue::done].
    pub async fn next(&self) -> Trigger {
        loop {
            if let Some(trigger) = self.try_next() {
                return trigger;
            }
            self.notify.notified().await;
        }
    }

    fn try_next(&self) -> Option<Trigger> {
        let mut state = self.state.lock().unwrap();
        let trigger = state.pending.pop_front()?;
        state.queued.remove(&trigger);
        state.active.insert(trigger.clone());
        if !state.pending.is_empty() {
            self.notify.notify_one();
        }
        Some(trigger)
    }

    /// Marks `trigger` as handled, queueing it again if it was added meanwhile.
    pub fn done(&self, trigger: &Trigger) {
        let requeue = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(trigger);
            state.dirty.remove(trigger)
        };
        if requeue {
            self.add(trigger.clone());
        }
    }

    /// Number of queued triggers, not counting active ones.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if nothing is queued or being handled.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.is_empty() && state.active.is_empty()
    }
}

/// Runs reconcile workers, watches the stores and periodically resyncs.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    namespaces: BTreeSet<String>,
    workers: usize,
    resync_interval: Duration,
    retry: RetryPolicy,
    metrics: Metrics,
    attempts: Mutex<HashMap<Trigger, u32>>,
    /// Requesters that found their namespace busy, by namespace.
    parked: Mutex<BTreeMap<String, BTreeSet<ObjectKey>>>,
    retries: mpsc::UnboundedSender<(Trigger, Duration)>,
    /// Taken by [Controller::start].
    retry_timers: Mutex<Option<mpsc::UnboundedReceiver<(Trigger, Duration)>>>,
}

impl Controller {
    /// Creates a controller for the namespaces of `config`.
    pub fn new(reconciler: Arc<Reconciler>, config: &Config, metrics: Metrics) -> Self {
        let (retries, retry_timers) = mpsc::unbounded_channel();
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            namespaces: config.namespaces.keys().cloned().collect(),
            workers: config.workers,
            resync_interval: config.resync_interval,
            retry: config.retry,
            metrics,
            attempts: Mutex::new(HashMap::new()),
            parked: Mutex::new(BTreeMap::new()),
            retries,
            retry_timers: Mutex::new(Some(retry_timers)),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Spawns the workers, the store watchers and the resync loop on `tasks`.
    pub fn start(self: &Arc<Self>, tasks: &mut TaskSet) {
        // Subscribe before the first resync so no change falls in between.
        let manager_events = self.reconciler.managers().watch();
        let requester_events = self.reconciler.requesters().watch();

        for _ in 0..self.workers {
            let this = self.clone();
            tasks.spawn_cancellable(async move {
                this.run_worker().await;
                Ok(())
            });
        }
        if let Some(scheduled) = self.retry_timers.lock().unwrap().take() {
            tasks.spawn_cancellable(self.clone().run_retries(scheduled));
        }
        tasks.spawn_cancellable(self.clone().watch(manager_events, Self::manager_trigger));
        tasks.spawn_cancellable(self.clone().watch(requester_events, Self::requester_trigger));
        tasks.spawn_cancellable(self.clone().run_resync());

        info!(workers = self.workers, namespaces = ?self.namespaces, "Controller started");
    }

    /// Reconciles a single trigger.
    pub async fn reconcile(&self, trigger: &Trigger) -> Result<(), ReconcileError> {
        let label = trigger.label();
        let timer = self
            .metrics
            .reconcile_latency_seconds
            .with_label_values(&[label])
            .start_timer();

        let result = match trigger {
            Trigger::Manager(namespace) => {
                self.reconciler
                    .reconcile_manager(namespace)
                    .await
                    .map(|_| self.unpark(namespace))
            }
            Trigger::Requester(key) => {
                match self.reconciler.reconcile_requester(key).await {
                    Err(ReconcileError::Busy) => {
                        self.park(key.clone());
                        Err(ReconcileError::Busy)
                    }
                    result => result.map(|_| ()),
                }
            }
        };
        timer.observe_duration();

        let result_label = match &result {
            Ok(()) => "success",
            Err(e) => e.kind(),
        };
        self.metrics
            .reconcile_total
            .with_label_values(&[label, result_label])
            .inc();
        result
    }

    /// Queues every manager and requester of the managed namespaces.
    pub async fn resync(&self) {
        for namespace in &self.namespaces {
            self.queue.add(Trigger::Manager(namespace.clone()));
            match self.reconciler.requesters().list(namespace).await {
                Ok(requesters) => {
                    for requester in requesters {
                        self.queue.add(Trigger::Requester(requester.meta.key));
                    }
                }
                Err(e) => warn!(%namespace, error=%e, "Failed to list requesters"),
            }
        }
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let trigger = self.queue.next().await;
            let result = self.reconcile(&trigger).await;
            self.queue.done(&trigger);

            match result {
                Ok(()) => {
                    self.attempts.lock().unwrap().remove(&trigger);
                }
                Err(e) if e.is_transient() => self.retry_later(trigger, &e),
                Err(e) => {
                    self.attempts.lock().unwrap().remove(&trigger);
                    warn!(%trigger, error=%e, "Reconcile failed");
                }
            }
        }
    }

    fn retry_later(&self, trigger: Trigger, error: &ReconcileError) {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts.entry(trigger.clone()).or_default();
            *attempt += 1;
            *attempt
        };
        if attempt > self.retry.max_attempts {
            self.attempts.lock().unwrap().remove(&trigger);
            warn!(%trigger, error=%error, "Giving up retrying, waiting for resync");
            return;
        }

        let delay = self.retry.backoff(attempt);
        debug!(%trigger, attempt, ?delay, error=%error, "Retrying later");
        // The receiver only goes away once the controller is shutting down.
        let _ = self.retries.send((trigger, delay));
    }

    /// Re-queues triggers once their backoff delay has elapsed.
    async fn run_retries(
        self: Arc<Self>,
        mut scheduled: mpsc::UnboundedReceiver<(Trigger, Duration)>,
    ) -> anyhow::Result<()> {
        enum Timer {
            Scheduled(Option<(Trigger, Duration)>),
            Due(Trigger),
        }

        let mut timers = DelayQueue::new();
        loop {
            let next = tokio::select! {
                retry = scheduled.recv() => Timer::Scheduled(retry),
                Some(expired) = std::future::poll_fn(|cx| timers.poll_expired(cx)),
                    if !timers.is_empty() => Timer::Due(expired.into_inner()),
            };
            match next {
                Timer::Scheduled(Some((trigger, delay))) => {
                    timers.insert(trigger, delay);
                }
                Timer::Scheduled(None) => return Ok(()),
                Timer::Due(trigger) => self.queue.add(trigger),
            }
        }
    }

    fn park(&self, requester: ObjectKey) {
        self.parked
            .lock()
            .unwrap()
            .entry(requester.namespace.clone())
            .or_default()
            .insert(requester);
    }

    fn unpark(&self, namespace: &str) {
        let parked = self.parked.lock().unwrap().remove(namespace);
        for requester in parked.into_iter().flatten() {
            self.queue.add(Trigger::Requester(requester));
        }
    }

    fn manager_trigger(&self, event: ChangeEvent) -> Option<Trigger> {
        (event.key.name == self.reconciler.manager_name())
            .then(|| Trigger::Manager(event.key.namespace))
    }

    fn requester_trigger(&self, event: ChangeEvent) -> Option<Trigger> {
        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => Some(Trigger::Requester(event.key)),
            // Releases the reservations of the deleted requester.
            ChangeKind::Deleted => Some(Trigger::Manager(event.key.namespace)),
        }
    }

    async fn watch(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ChangeEvent>,
        to_trigger: fn(&Self, ChangeEvent) -> Option<Trigger>,
    ) -> anyhow::Result<()> {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !self.namespaces.contains(&event.key.namespace) {
                        continue;
                    }
                    if let Some(trigger) = to_trigger(self.as_ref(), event) {
                        self.queue.add(trigger);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed change notifications, resyncing");
                    self.resync().await;
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn run_resync(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.resync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            debug!("Resyncing");
            self.resync().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use address_manager::manager::dto::ManagerStateDto;
    use ipam_observability::metrics::MetricsRegistry;
    use test_log::test;

    use super::*;
    use crate::{codec::AnnotationCodec, model::Requester, store::memory::InMemoryStore};

    fn requester(name: &str) -> Trigger {
        Trigger::Requester(ObjectKey::new("ns", name))
    }

    fn controller(retry: RetryPolicy) -> Arc<Controller> {
        let metrics = Metrics::new(&MetricsRegistry::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(InMemoryStore::<ManagerStateDto>::new()),
            Arc::new(InMemoryStore::<Requester>::new()),
            AnnotationCodec::default(),
            "ipmanager",
            metrics.clone(),
        ));
        let config = Config {
            retry,
            ..Config::default()
        };
        Arc::new(Controller::new(reconciler, &config, metrics))
    }

    /// Starts only the retry timers so no worker drains the queue.
    fn start_retries(controller: &Arc<Controller>, tasks: &mut TaskSet) {
        let scheduled = controller
            .retry_timers
            .lock()
            .unwrap()
            .take()
            .expect("retry timers not started yet");
        tasks.spawn_cancellable(controller.clone().run_retries(scheduled));
    }

    const SHORT_RETRY: RetryPolicy = RetryPolicy {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(50),
        max_attempts: 2,
    };

    #[test(tokio::test)]
    async fn should_deduplicate_queued_triggers() {
        let queue = WorkQueue::new();
        queue.add(requester("a"));
        queue.add(requester("a"));
        queue.add(Trigger::Manager("ns".into()));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, requester("a"));
        assert_eq!(queue.next().await, Trigger::Manager("ns".into()));
    }

    #[test(tokio::test)]
    async fn should_requeue_trigger_added_while_active() {
        let queue = WorkQueue::new();
        queue.add(requester("a"));
        let active = queue.next().await;

        queue.add(requester("a"));
        assert!(queue.is_empty(), "active trigger must not be handed out twice");

        queue.done(&active);
        assert_eq!(queue.len(), 1);
        let again = queue.next().await;
        queue.done(&again);
        assert!(queue.is_idle());
    }

    #[test(tokio::test)]
    async fn should_wake_waiting_worker() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add(requester("a"));

        let trigger = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("Should wake up")
            .unwrap();
        assert_eq!(trigger, requester("a"));
    }

    #[test(tokio::test)]
    async fn should_requeue_transient_failure_after_backoff() {
        let controller = controller(SHORT_RETRY);
        let mut tasks = TaskSet::new();
        start_retries(&controller, &mut tasks);

        controller.retry_later(requester("a"), &ReconcileError::Busy);
        assert!(controller.queue.is_empty(), "retry must wait for the backoff");

        let trigger = tokio::time::timeout(Duration::from_secs(5), controller.queue.next())
            .await
            .expect("Should be retried");
        assert_eq!(trigger, requester("a"));
        controller.queue.done(&trigger);
    }

    #[test(tokio::test)]
    async fn should_give_up_after_max_attempts() {
        let controller = controller(SHORT_RETRY);
        let mut tasks = TaskSet::new();
        start_retries(&controller, &mut tasks);

        for _ in 0..=SHORT_RETRY.max_attempts {
            controller.retry_later(requester("a"), &ReconcileError::Busy);
        }
        assert!(controller.attempts.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(controller.queue.len(), 1, "retries are deduplicated in the queue");
    }

    #[test(tokio::test)]
    async fn should_drop_pending_retries_on_shutdown() {
        let controller = controller(SHORT_RETRY);
        let mut tasks = TaskSet::new();
        start_retries(&controller, &mut tasks);

        controller.retry_later(requester("a"), &ReconcileError::Busy);
        tasks.cancellation_token().cancel();
        tasks.join_all().await;
        controller.retry_later(requester("b"), &ReconcileError::Busy);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(controller.queue.is_empty());
    }
}
