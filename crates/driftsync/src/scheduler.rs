//! The scheduler: a handle plus a single run loop that owns all task state.
//!
//! Every public call is turned into a [`Command`] and sent to the run loop,
//! which is the only code that mutates the queue. Sync work runs in spawned
//! tasks and reports back over a completion channel.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};

use driftsync_core::{Collection, ErrorClass};
use driftsync_sync::{CancelFlag, SyncPair, SyncReport};

use crate::clock::{Clock, SystemClock};
use crate::environment::{EnvironmentHandle, SchedulerEnvironment};
use crate::error::{Result, SchedulerError};
use crate::events::{EventKind, EventSink, SyncEvent, TracingSink};
use crate::policy::SchedulerPolicy;
use crate::queue::TaskQueue;
use crate::task::{SyncTask, SyncTaskSpec, TaskError, TaskId, TaskState};

const COMMAND_BUFFER: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Configures and spawns a [`SyncScheduler`].
pub struct SchedulerBuilder {
    pairs: HashMap<Collection, Arc<SyncPair>>,
    policy: SchedulerPolicy,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    environment: Option<EnvironmentHandle>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            pairs: HashMap::new(),
            policy: SchedulerPolicy::default(),
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            environment: None,
        }
    }
}

impl SchedulerBuilder {
    /// Register the pair that serves tasks for its collection.
    pub fn pair(mut self, pair: SyncPair) -> Self {
        self.pairs.insert(pair.collection().clone(), Arc::new(pair));
        self
    }

    pub fn policy(mut self, policy: SchedulerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Where events go. Defaults to [`TracingSink`].
    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share an existing environment handle. Defaults to an unmetered,
    /// normal-power environment.
    pub fn environment(mut self, environment: EnvironmentHandle) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Validate the policy and spawn the run loop on the current tokio
    /// runtime. The scheduler starts stopped; call [`SyncScheduler::start`].
    pub fn spawn(self) -> Result<SyncScheduler> {
        self.policy.validate()?;

        let environment = self.environment.unwrap_or_default();
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            commands: command_rx,
            completion_tx,
            completions: completion_rx,
            environment: environment.subscribe(),
            env_open: true,
            pairs: self.pairs,
            policy: self.policy,
            events: Emitter {
                sink: self.sink,
                clock: self.clock.clone(),
            },
            clock: self.clock,
            queue: TaskQueue::new(),
            running: HashMap::new(),
            waiters: HashMap::new(),
            stop_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
            started: false,
            paused: false,
            shutting_down: false,
        };
        tokio::spawn(actor.run());

        Ok(SyncScheduler {
            commands,
            environment,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running scheduler. Cheap to clone.
///
/// The run loop exits after [`shutdown`](Self::shutdown) or once every handle
/// has been dropped.
#[derive(Clone)]
pub struct SyncScheduler {
    commands: mpsc::Sender<Command>,
    environment: EnvironmentHandle,
}

impl SyncScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Queue a task. It starts as `pending` and runs once admitted.
    ///
    /// Fails with [`SchedulerError::UnknownCollection`] when no pair is
    /// registered for the spec's collection.
    pub async fn enqueue(&self, spec: SyncTaskSpec) -> Result<TaskId> {
        self.request(|reply| Command::Enqueue { spec, reply }).await?
    }

    /// Cancel a task.
    ///
    /// Pending and retrying tasks are cancelled at once. A running task is
    /// flagged and stops at its next batch boundary; `true` means the request
    /// was accepted. Returns `false` for unknown or finished tasks.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Snapshot of a task, or `None` if unknown or already collected.
    pub async fn status(&self, id: TaskId) -> Result<Option<SyncTask>> {
        self.request(|reply| Command::Status { id, reply }).await
    }

    /// Wait until the task reaches a terminal state and return its final
    /// snapshot. Returns `None` for unknown tasks.
    pub async fn wait_for(&self, id: TaskId) -> Result<Option<SyncTask>> {
        self.request(|reply| Command::WaitFor { id, reply }).await?
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    /// Begin admitting tasks.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop admitting tasks and interrupt running ones at their next
    /// checkpoint. Returns once nothing is running.
    ///
    /// Interrupted tasks go back to `pending` and resume after the next
    /// [`start`](Self::start).
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await?
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    /// Hold admission. Running tasks are unaffected.
    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Replace the policy. Applies to admission and to retries decided from
    /// now on.
    pub async fn set_policy(&self, policy: SchedulerPolicy) -> Result<()> {
        policy.validate()?;
        self.request(|reply| Command::SetPolicy { policy, reply }).await
    }

    pub async fn policy(&self) -> Result<SchedulerPolicy> {
        self.request(|reply| Command::GetPolicy { reply }).await
    }

    /// Register (or replace) the pair serving a collection.
    pub async fn register(&self, pair: SyncPair) -> Result<()> {
        let pair = Arc::new(pair);
        self.request(|reply| Command::Register { pair, reply }).await
    }

    /// The environment the scheduler paces itself against.
    pub fn environment(&self) -> &EnvironmentHandle {
        &self.environment
    }

    /// Interrupt running tasks, wait for them, and end the run loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await?
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run loop
// ─────────────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Enqueue {
        spec: SyncTaskSpec,
        reply: Reply<Result<TaskId>>,
    },
    Cancel {
        id: TaskId,
        reply: Reply<bool>,
    },
    Status {
        id: TaskId,
        reply: Reply<Option<SyncTask>>,
    },
    WaitFor {
        id: TaskId,
        reply: Reply<oneshot::Receiver<Option<SyncTask>>>,
    },
    Start {
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<oneshot::Receiver<()>>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    SetPolicy {
        policy: SchedulerPolicy,
        reply: Reply<()>,
    },
    GetPolicy {
        reply: Reply<SchedulerPolicy>,
    },
    Register {
        pair: Arc<SyncPair>,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<oneshot::Receiver<()>>,
    },
}

/// How a task execution ended.
enum Outcome {
    Succeeded(SyncReport),
    Cancelled,
    Failed(TaskError),
}

struct Completion {
    id: TaskId,
    outcome: Outcome,
}

struct RunningTask {
    cancel: CancelFlag,
    /// Interrupted by `stop` or `shutdown` rather than by the caller.
    interrupted: bool,
}

struct Emitter {
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl Emitter {
    fn task(&self, kind: EventKind, task: &SyncTask, detail: String) {
        self.sink.publish(SyncEvent {
            kind,
            task_id: Some(task.id),
            collection: Some(task.collection.clone()),
            timestamp_ms: self.clock.timestamp_ms(),
            detail,
        });
    }

    fn scheduler(&self, kind: EventKind, detail: String) {
        self.sink.publish(SyncEvent {
            kind,
            task_id: None,
            collection: None,
            timestamp_ms: self.clock.timestamp_ms(),
            detail,
        });
    }
}

struct Actor {
    commands: mpsc::Receiver<Command>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    environment: watch::Receiver<SchedulerEnvironment>,
    env_open: bool,
    pairs: HashMap<Collection, Arc<SyncPair>>,
    policy: SchedulerPolicy,
    events: Emitter,
    clock: Arc<dyn Clock>,
    queue: TaskQueue,
    running: HashMap<TaskId, RunningTask>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<Option<SyncTask>>>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    started: bool,
    paused: bool,
    shutting_down: bool,
}

impl Actor {
    async fn run(mut self) {
        debug!("scheduler loop running");

        loop {
            self.tick();
            if self.shutting_down && self.running.is_empty() {
                break;
            }

            let wakeup = self.queue.next_wakeup(self.policy.retain_finished);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        // Every handle is gone.
                        self.interrupt_all();
                        break;
                    }
                },
                Some(completion) = self.completions.recv() => self.complete(completion),
                changed = self.environment.changed(), if self.env_open => {
                    if changed.is_err() {
                        self.env_open = false;
                    } else {
                        let env = *self.environment.borrow_and_update();
                        debug!(environment = %env, "environment changed");
                    }
                }
                _ = sleep_until(wakeup.unwrap_or_else(|| self.clock.now())), if wakeup.is_some() => {}
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("scheduler loop exited");
    }

    /// Time-driven bookkeeping followed by admission.
    fn tick(&mut self) {
        let now = self.clock.now();

        let promoted = self.queue.promote_eligible(now);
        if promoted > 0 {
            debug!(promoted, "backoff elapsed");
        }
        let collected = self.queue.collect_garbage(now, self.policy.retain_finished);
        if collected > 0 {
            debug!(collected, remaining = self.queue.len(), "dropped finished tasks");
        }

        if !self.started || self.paused || self.shutting_down {
            return;
        }
        let env = *self.environment.borrow();
        for id in self.queue.admissible(now, &self.policy, &env) {
            self.launch(id);
        }
    }

    fn handle(&mut self, command: Command) {
        if self.shutting_down {
            // Dropping the reply surfaces as `Closed`.
            if let Command::Shutdown { reply } = command {
                let (tx, rx) = oneshot::channel();
                self.shutdown_waiters.push(tx);
                let _ = reply.send(rx);
            }
            return;
        }

        match command {
            Command::Enqueue { spec, reply } => {
                let _ = reply.send(self.enqueue(spec));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.queue.get(id).cloned());
            }
            Command::WaitFor { id, reply } => {
                let (tx, rx) = oneshot::channel();
                match self.queue.get(id) {
                    Some(task) if !task.is_terminal() => {
                        self.waiters.entry(id).or_default().push(tx);
                    }
                    task => {
                        let _ = tx.send(task.cloned());
                    }
                }
                let _ = reply.send(rx);
            }
            Command::Start { reply } => {
                if !self.started {
                    self.started = true;
                    info!("scheduler started");
                }
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                let (tx, rx) = oneshot::channel();
                if self.started {
                    self.started = false;
                    info!(running = self.running.len(), "scheduler stopping");
                }
                self.interrupt_all();
                if self.running.is_empty() {
                    let _ = tx.send(());
                } else {
                    self.stop_waiters.push(tx);
                }
                let _ = reply.send(rx);
            }
            Command::Pause { reply } => {
                if !self.paused {
                    self.paused = true;
                    info!("scheduler paused");
                    self.events
                        .scheduler(EventKind::SchedulerPaused, String::new());
                }
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                if self.paused {
                    self.paused = false;
                    info!("scheduler resumed");
                    self.events
                        .scheduler(EventKind::SchedulerResumed, String::new());
                }
                let _ = reply.send(());
            }
            Command::SetPolicy { policy, reply } => {
                info!(
                    max_parallel_tasks = policy.max_parallel_tasks,
                    max_retries = policy.max_retries,
                    "policy updated"
                );
                self.policy = policy;
                let _ = reply.send(());
            }
            Command::GetPolicy { reply } => {
                let _ = reply.send(self.policy.clone());
            }
            Command::Register { pair, reply } => {
                debug!(collection = %pair.collection(), "pair registered");
                self.pairs.insert(pair.collection().clone(), pair);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                info!(running = self.running.len(), "scheduler shutting down");
                self.shutting_down = true;
                self.started = false;
                self.interrupt_all();

                let (tx, rx) = oneshot::channel();
                self.shutdown_waiters.push(tx);
                let _ = reply.send(rx);
            }
        }
    }

    fn enqueue(&mut self, spec: SyncTaskSpec) -> Result<TaskId> {
        if !self.pairs.contains_key(&spec.collection) {
            return Err(SchedulerError::UnknownCollection(spec.collection));
        }

        let id = self.queue.insert(spec, self.clock.now());
        if let Some(task) = self.queue.get_mut(id) {
            task.jitter_unit = rand::thread_rng().gen();
            info!(
                task_id = %id,
                collection = %task.collection,
                direction = %task.direction,
                priority = ?task.priority,
                "task added"
            );
            self.events.task(
                EventKind::TaskAdded,
                task,
                format!("{} ({:?})", task.direction, task.priority),
            );
        }
        Ok(id)
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        let now = self.clock.now();
        let Some(task) = self.queue.get_mut(id) else {
            return false;
        };

        match task.state {
            TaskState::Pending | TaskState::FailedRetryable => {
                task.finish(TaskState::Cancelled, now);
                info!(task_id = %id, collection = %task.collection, "task cancelled");
                self.events
                    .task(EventKind::TaskCancelled, task, "cancelled before start".into());
                self.settled(id);
                true
            }
            TaskState::Running => {
                task.cancel_requested = true;
                if let Some(running) = self.running.get(&id) {
                    running.cancel.cancel();
                }
                debug!(task_id = %id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    fn interrupt_all(&mut self) {
        for running in self.running.values_mut() {
            running.interrupted = true;
            running.cancel.cancel();
        }
    }

    fn launch(&mut self, id: TaskId) {
        let Some(task) = self.queue.get_mut(id) else {
            return;
        };
        let Some(pair) = self.pairs.get(&task.collection).cloned() else {
            let now = self.clock.now();
            let error = TaskError::new(
                ErrorClass::Fatal,
                format!("no sync pair registered for collection {}", task.collection),
            );
            error!(task_id = %id, collection = %task.collection, "no pair for task");
            task.finish(TaskState::FailedFatal, now);
            self.events.task(EventKind::TaskFailed, task, error.to_string());
            task.last_error = Some(error);
            self.settled(id);
            return;
        };

        task.state = TaskState::Running;
        task.attempt += 1;
        task.next_eligible_at = None;

        let attempt = task.attempt;
        let direction = task.direction;
        info!(
            task_id = %id,
            collection = %task.collection,
            %direction,
            attempt,
            "task started"
        );
        self.events
            .task(EventKind::TaskStarted, task, format!("attempt {attempt}"));

        let cancel = CancelFlag::new();
        self.running.insert(
            id,
            RunningTask {
                cancel: cancel.clone(),
                interrupted: false,
            },
        );

        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let execution = tokio::spawn(async move { pair.run(direction, &cancel).await });
            let outcome = match execution.await {
                Ok(Ok(report)) => Outcome::Succeeded(report),
                Ok(Err(e)) => match TaskError::from_sync(&e) {
                    Some(error) => Outcome::Failed(error),
                    None => Outcome::Cancelled,
                },
                Err(join) => Outcome::Failed(TaskError::new(
                    ErrorClass::Fatal,
                    format!("sync execution aborted: {join}"),
                )),
            };
            let _ = completions.send(Completion { id, outcome });
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { id, outcome } = completion;
        let interrupted = self
            .running
            .remove(&id)
            .map_or(false, |running| running.interrupted);
        let now = self.clock.now();

        if let Some(task) = self.queue.get_mut(id) {
            match outcome {
                Outcome::Succeeded(report) => {
                    task.last_error = None;
                    task.finish(TaskState::Succeeded, now);
                    info!(
                        task_id = %id,
                        collection = %task.collection,
                        attempt = task.attempt,
                        received = report.received(),
                        applied = report.applied(),
                        "task succeeded"
                    );
                    self.events.task(
                        EventKind::TaskSucceeded,
                        task,
                        format!("received {}, applied {}", report.received(), report.applied()),
                    );
                }
                Outcome::Cancelled if interrupted && !task.cancel_requested => {
                    // Stopped, not cancelled: the run did not count.
                    task.state = TaskState::Pending;
                    task.attempt = task.attempt.saturating_sub(1);
                    info!(task_id = %id, collection = %task.collection, "task interrupted, requeued");
                }
                Outcome::Cancelled => {
                    task.finish(TaskState::Cancelled, now);
                    info!(task_id = %id, collection = %task.collection, "task cancelled");
                    self.events
                        .task(EventKind::TaskCancelled, task, "cancelled at checkpoint".into());
                }
                Outcome::Failed(error) => {
                    if error.authentication {
                        task.auth_failures += 1;
                    }

                    let delay = if task.cancel_requested {
                        None
                    } else {
                        self.policy.retry_delay(
                            &error,
                            task.attempt,
                            task.auth_failures,
                            task.jitter_unit,
                        )
                    };

                    match delay {
                        _ if task.cancel_requested && error.class.is_retryable() => {
                            task.finish(TaskState::Cancelled, now);
                            info!(task_id = %id, error = %error, "task cancelled after failure");
                            self.events
                                .task(EventKind::TaskCancelled, task, error.to_string());
                        }
                        Some(delay) => {
                            task.state = TaskState::FailedRetryable;
                            task.next_eligible_at = Some(now + delay);
                            warn!(
                                task_id = %id,
                                collection = %task.collection,
                                attempt = task.attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "task failed, retry scheduled"
                            );
                            self.events.task(
                                EventKind::TaskRetryScheduled,
                                task,
                                format!(
                                    "attempt {} failed: {}; retry in {} ms",
                                    task.attempt,
                                    error,
                                    delay.as_millis()
                                ),
                            );
                        }
                        None => {
                            task.finish(TaskState::FailedFatal, now);
                            error!(
                                task_id = %id,
                                collection = %task.collection,
                                attempt = task.attempt,
                                error = %error,
                                "task failed"
                            );
                            self.events.task(EventKind::TaskFailed, task, error.to_string());
                        }
                    }
                    task.last_error = Some(error);
                }
            }
        }

        self.settled(id);
        if self.running.is_empty() {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Wake `wait_for` callers if the task is now terminal.
    fn settled(&mut self, id: TaskId) {
        let Some(task) = self.queue.get(id).filter(|t| t.is_terminal()) else {
            return;
        };
        if let Some(waiters) = self.waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(Some(task.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use driftsync_core::{Direction, Origin, Priority};
    use driftsync_store::{MemoryService, MemoryStore, RemoteStore, StoreAdapter};
    use tokio::sync::broadcast;

    use super::*;
    use crate::environment::NetworkClass;
    use crate::events::BroadcastSink;

    struct Harness {
        scheduler: SyncScheduler,
        events: broadcast::Receiver<SyncEvent>,
        local: Arc<MemoryStore>,
        service: Arc<MemoryService>,
    }

    fn diaries() -> Collection {
        Collection::new("diaries").unwrap()
    }

    async fn harness(policy: SchedulerPolicy) -> Harness {
        let local = Arc::new(MemoryStore::new(Origin::Local));
        let service = Arc::new(MemoryService::new());
        let remote = Arc::new(RemoteStore::new(service.clone()));
        for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
            service
                .store()
                .set(&diaries(), key, Bytes::from(value))
                .await
                .unwrap();
        }

        let sink = BroadcastSink::new(256);
        let events = sink.subscribe();
        let scheduler = SyncScheduler::builder()
            .pair(SyncPair::new(diaries(), local.clone(), remote).unwrap())
            .policy(policy)
            .sink(sink)
            .spawn()
            .unwrap();

        Harness {
            scheduler,
            events,
            local,
            service,
        }
    }

    fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_task_runs_to_success() {
        let mut h = harness(SchedulerPolicy::default()).await;
        h.scheduler.start().await.unwrap();

        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();

        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempt, 1);
        assert_eq!(h.local.len(&diaries()), 3);
        assert_eq!(
            drain(&mut h.events),
            vec![EventKind::TaskAdded, EventKind::TaskStarted, EventKind::TaskSucceeded]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_collection_rejected() {
        let h = harness(SchedulerPolicy::default()).await;
        let err = h
            .scheduler
            .enqueue(SyncTaskSpec::pull(Collection::new("photos").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownCollection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_runs_before_start() {
        let h = harness(SchedulerPolicy::default()).await;
        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let task = h.scheduler.status(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt, 0);

        h.scheduler.start().await.unwrap();
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries() {
        let policy = SchedulerPolicy::default()
            .with_max_retries(2)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        let mut h = harness(policy).await;
        h.service.set_online(false);
        h.scheduler.start().await.unwrap();

        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();

        assert_eq!(task.state, TaskState::FailedFatal);
        assert_eq!(task.attempt, 3);
        assert_eq!(task.last_error.unwrap().class, ErrorClass::Transient);

        let kinds = drain(&mut h.events);
        let retries = kinds
            .iter()
            .filter(|k| **k == EventKind::TaskRetryScheduled)
            .count();
        assert_eq!(retries, 2);
        assert_eq!(kinds.last(), Some(&EventKind::TaskFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_when_service_returns() {
        let policy = SchedulerPolicy::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(10))
            .with_jitter(0.0);
        let h = harness(policy).await;
        h.service.set_online(false);
        h.scheduler.start().await.unwrap();

        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = h.scheduler.status(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::FailedRetryable);
        assert!(task.next_eligible_at.is_some());

        h.service.set_online(true);
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempt, 2);
        assert!(task.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_task() {
        let mut h = harness(SchedulerPolicy::default()).await;
        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();

        assert!(h.scheduler.cancel(id).await.unwrap());
        assert!(!h.scheduler.cancel(id).await.unwrap());
        assert!(!h.scheduler.cancel(TaskId(999)).await.unwrap());

        h.scheduler.start().await.unwrap();
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.attempt, 0);
        assert_eq!(
            drain(&mut h.events),
            vec![EventKind::TaskAdded, EventKind::TaskCancelled]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let mut h = harness(SchedulerPolicy::default()).await;
        h.scheduler.start().await.unwrap();
        h.scheduler.pause().await.unwrap();
        h.scheduler.pause().await.unwrap();

        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.scheduler.status(id).await.unwrap().unwrap().state,
            TaskState::Pending
        );

        h.scheduler.resume().await.unwrap();
        h.scheduler.wait_for(id).await.unwrap();

        let kinds = drain(&mut h.events);
        assert_eq!(kinds.first(), Some(&EventKind::SchedulerPaused));
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::SchedulerPaused).count(),
            1
        );
        assert!(kinds.contains(&EventKind::SchedulerResumed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_environment_defers() {
        let h = harness(SchedulerPolicy::default()).await;
        h.scheduler.environment().set_network(NetworkClass::None);
        h.scheduler.start().await.unwrap();

        let id = h
            .scheduler
            .enqueue(SyncTaskSpec::push(diaries()).with_priority(Priority::Interactive))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            h.scheduler.status(id).await.unwrap().unwrap().state,
            TaskState::Pending
        );

        h.scheduler.environment().set_network(NetworkClass::Unmetered);
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.direction, Direction::Push);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tasks_are_collected() {
        let retain = Duration::from_secs(30);
        let h = harness(SchedulerPolicy::default().with_retain_finished(retain)).await;
        h.scheduler.start().await.unwrap();

        let id = h.scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();
        h.scheduler.wait_for(id).await.unwrap();
        assert!(h.scheduler.status(id).await.unwrap().is_some());

        tokio::time::sleep(retain + Duration::from_secs(1)).await;
        assert!(h.scheduler.status(id).await.unwrap().is_none());
        assert!(h.scheduler.wait_for(id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_round_trip_and_validation() {
        let h = harness(SchedulerPolicy::default()).await;
        let policy = SchedulerPolicy::default().with_max_parallel_tasks(4);
        h.scheduler.set_policy(policy.clone()).await.unwrap();
        assert_eq!(h.scheduler.policy().await.unwrap(), policy);

        let bad = SchedulerPolicy::default().with_max_parallel_tasks(0);
        assert!(matches!(
            h.scheduler.set_policy(bad).await,
            Err(SchedulerError::InvalidPolicy(_))
        ));
        assert_eq!(h.scheduler.policy().await.unwrap().max_parallel_tasks, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_shutdown() {
        let h = harness(SchedulerPolicy::default()).await;
        let photos = Collection::new("photos").unwrap();
        let pair = SyncPair::new(
            photos.clone(),
            Arc::new(MemoryStore::new(Origin::Local)),
            Arc::new(MemoryStore::new(Origin::Remote)),
        )
        .unwrap();
        h.scheduler.register(pair).await.unwrap();
        h.scheduler.start().await.unwrap();

        let id = h.scheduler.enqueue(SyncTaskSpec::bidirectional(photos)).await.unwrap();
        let task = h.scheduler.wait_for(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Succeeded);

        h.scheduler.shutdown().await.unwrap();
        assert!(matches!(
            h.scheduler.status(id).await,
            Err(SchedulerError::Closed)
        ));
    }

    /// Tokio time for scheduling, a frozen wall clock for event stamps.
    struct FrozenWallClock(u64);

    impl Clock for FrozenWallClock {
        fn now(&self) -> tokio::time::Instant {
            tokio::time::Instant::now()
        }

        fn timestamp_ms(&self) -> u64 {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_stamped_by_the_configured_clock() {
        let local = Arc::new(MemoryStore::new(Origin::Local));
        let remote = Arc::new(MemoryStore::new(Origin::Remote));
        let sink = BroadcastSink::new(16);
        let mut events = sink.subscribe();
        let scheduler = SyncScheduler::builder()
            .pair(SyncPair::new(diaries(), local, remote).unwrap())
            .sink(sink)
            .clock(FrozenWallClock(1_700_000_000_000))
            .spawn()
            .unwrap();
        scheduler.start().await.unwrap();

        let id = scheduler.enqueue(SyncTaskSpec::pull(diaries())).await.unwrap();
        scheduler.wait_for(id).await.unwrap().unwrap();

        let mut seen = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.timestamp_ms, 1_700_000_000_000);
            seen += 1;
        }
        assert!(seen >= 3);
    }
}
