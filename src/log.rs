//! The command log, single-replica binding.
//!
//! `LocalLog` provides the Log contract the core consumes: sequenced
//! command application with per-command priorities, synchronous and
//! correlated-asynchronous replies, leadership surfacing, query favor
//! modes over published snapshots, and snapshot/restore of the machine
//! state. Commands flow through an ingress channel into a single apply
//! task that owns the state machine and the dispatcher; events of command
//! N are fully dispatched before command N+1 is applied.

use crate::config::ArborConfig;
use crate::dispatch::{Dispatcher, DispatcherTelemetry};
use crate::error::ArborError;
use crate::machine::command::{Command, Reply};
use crate::machine::StateMachine;
use crate::sproc::FunRegistry;
use crate::tree::Tree;
use crate::view::ViewStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

/// Read preference for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Favor {
    /// Read-after-quorum semantics: drain the apply queue first.
    Consistency,
    /// Leader read, trusting the last leadership check for a bounded
    /// interval.
    Compromise,
    /// Local replica read, possibly stale.
    #[default]
    LowLatency,
}

/// Asynchronous submission: return immediately, optionally delivering the
/// reply under a caller-chosen correlation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncMode {
    pub correlation: Option<u64>,
    /// Ordering against other pending commands; defaults to the
    /// configured low priority.
    pub priority: Option<i8>,
}

enum ReplySlot {
    Sync(oneshot::Sender<Result<Reply, ArborError>>),
    Async { correlation: Option<u64> },
}

enum RequestKind {
    Apply { command: Command, slot: ReplySlot },
    Barrier { done: oneshot::Sender<u64> },
    FirePending,
    Snapshot { done: oneshot::Sender<Result<Vec<u8>, ArborError>> },
    Restore {
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), ArborError>>,
    },
}

struct LogRequest {
    priority: i8,
    kind: RequestKind,
}

struct PendingEntry {
    priority: i8,
    seq: u64,
    kind: RequestKind,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier arrival.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone)]
struct PublishedState {
    tree: Tree,
    applied_index: u64,
}

#[derive(Default)]
struct AsyncReplies {
    slots: Mutex<HashMap<u64, Result<Reply, ArborError>>>,
    notify: Notify,
}

struct LeaderState {
    leader: AtomicBool,
    cached_leader: AtomicBool,
    last_check: Mutex<Instant>,
}

impl LeaderState {
    fn new() -> Self {
        LeaderState {
            leader: AtomicBool::new(true),
            cached_leader: AtomicBool::new(true),
            last_check: Mutex::new(Instant::now()),
        }
    }
}

#[derive(Debug, Default)]
struct LogTelemetry {
    commands_applied: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMetrics {
    pub commands_applied: u64,
    pub applied_index: u64,
    pub pending_emitted_triggers: usize,
    pub events_dispatched: u64,
    pub projection_failures: u64,
    pub triggers_fired: u64,
    pub trigger_failures: u64,
}

/// Single-replica command log owning the state machine and dispatcher.
pub struct LocalLog {
    ingress: Mutex<Option<mpsc::Sender<LogRequest>>>,
    published: Arc<RwLock<PublishedState>>,
    pending_triggers: Arc<AtomicU64>,
    async_replies: Arc<AsyncReplies>,
    leader: Arc<LeaderState>,
    telemetry: Arc<LogTelemetry>,
    dispatcher_telemetry: Arc<DispatcherTelemetry>,
    task: StdMutex<Option<JoinHandle<()>>>,
    default_async_priority: i8,
    leader_check_interval: Duration,
}

impl LocalLog {
    /// Starts the apply task. Must be called from within a tokio runtime.
    pub fn spawn(config: &ArborConfig, registry: FunRegistry, views: ViewStore) -> LocalLog {
        let machine = StateMachine::new(registry.clone());
        let dispatcher = Dispatcher::new(registry, views);
        let dispatcher_telemetry = dispatcher.telemetry();
        let published = Arc::new(RwLock::new(PublishedState {
            tree: machine.state().tree().clone(),
            applied_index: 0,
        }));
        let pending_triggers = Arc::new(AtomicU64::new(0));
        let async_replies = Arc::new(AsyncReplies::default());
        let leader = Arc::new(LeaderState::new());
        let telemetry = Arc::new(LogTelemetry::default());

        let (tx, rx) = mpsc::channel(config.max_inflight_commands.max(1));
        let task = tokio::spawn(apply_loop(
            rx,
            machine,
            dispatcher,
            Arc::clone(&published),
            Arc::clone(&pending_triggers),
            Arc::clone(&async_replies),
            Arc::clone(&leader),
            Arc::clone(&telemetry),
        ));

        LocalLog {
            ingress: Mutex::new(Some(tx)),
            published,
            pending_triggers,
            async_replies,
            leader,
            telemetry,
            dispatcher_telemetry,
            task: StdMutex::new(Some(task)),
            default_async_priority: config.async_low_priority,
            leader_check_interval: config.leader_check_interval(),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<LogRequest>, ArborError> {
        self.ingress.lock().clone().ok_or(ArborError::Unavailable {
            message: "store is shut down".to_string(),
        })
    }

    async fn send(&self, request: LogRequest) -> Result<(), ArborError> {
        self.sender()?
            .send(request)
            .await
            .map_err(|_| ArborError::Unavailable {
                message: "store is shut down".to_string(),
            })
    }

    /// Appends a command and waits for its reply. An elapsed timeout
    /// returns `Err(Timeout)` without cancelling the accepted command.
    pub async fn submit_sync(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply, ArborError> {
        if !self.leader.leader.load(Ordering::Acquire) {
            return Err(ArborError::NotLeader);
        }
        let (done, wait) = oneshot::channel();
        self.send(LogRequest {
            priority: 0,
            kind: RequestKind::Apply {
                command,
                slot: ReplySlot::Sync(done),
            },
        })
        .await?;
        match tokio::time::timeout(timeout, wait).await {
            Err(_) => Err(ArborError::Timeout),
            Ok(Err(_)) => Err(ArborError::Unavailable {
                message: "store is shut down".to_string(),
            }),
            Ok(Ok(reply)) => reply,
        }
    }

    /// Appends a command and returns immediately. The reply, if a
    /// correlation was given, is delivered through
    /// [`LocalLog::wait_for_async_reply`].
    pub async fn submit_async(
        &self,
        command: Command,
        mode: AsyncMode,
    ) -> Result<(), ArborError> {
        if !self.leader.leader.load(Ordering::Acquire) {
            return Err(ArborError::NotLeader);
        }
        self.send(LogRequest {
            priority: mode.priority.unwrap_or(self.default_async_priority),
            kind: RequestKind::Apply {
                command,
                slot: ReplySlot::Async {
                    correlation: mode.correlation,
                },
            },
        })
        .await
    }

    /// Awaits the reply of a correlated asynchronous command, unwrapping
    /// error replies into the synchronous error taxonomy.
    pub async fn wait_for_async_reply(
        &self,
        correlation: u64,
        timeout: Duration,
    ) -> Result<Reply, ArborError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.async_replies.slots.lock().remove(&correlation) {
                return reply;
            }
            let notified = self.async_replies.notify.notified();
            if let Some(reply) = self.async_replies.slots.lock().remove(&correlation) {
                return reply;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ArborError::Timeout);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(ArborError::Timeout);
            }
        }
    }

    /// Waits until every command accepted before this call has applied.
    pub async fn barrier(&self, timeout: Duration) -> Result<u64, ArborError> {
        let (done, wait) = oneshot::channel();
        self.send(LogRequest {
            priority: 0,
            kind: RequestKind::Barrier { done },
        })
        .await?;
        match tokio::time::timeout(timeout, wait).await {
            Err(_) => Err(ArborError::Timeout),
            Ok(Err(_)) => Err(ArborError::Unavailable {
                message: "store is shut down".to_string(),
            }),
            Ok(Ok(index)) => Ok(index),
        }
    }

    /// The latest locally published tree snapshot and its applied index.
    pub fn latest(&self) -> (Tree, u64) {
        let published = self.published.read();
        (published.tree.clone(), published.applied_index)
    }

    /// Checks whether a read with the given favor may proceed here.
    pub fn read_allowed(&self, favor: Favor) -> Result<(), ArborError> {
        match favor {
            Favor::LowLatency => Ok(()),
            Favor::Consistency => {
                if self.leader.leader.load(Ordering::Acquire) {
                    Ok(())
                } else {
                    Err(ArborError::NoQuorum)
                }
            }
            Favor::Compromise => {
                let mut last_check = self.leader.last_check.lock();
                if last_check.elapsed() >= self.leader_check_interval {
                    self.leader.cached_leader.store(
                        self.leader.leader.load(Ordering::Acquire),
                        Ordering::Release,
                    );
                    *last_check = Instant::now();
                }
                if self.leader.cached_leader.load(Ordering::Acquire) {
                    Ok(())
                } else {
                    Err(ArborError::NotLeader)
                }
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.leader.load(Ordering::Acquire)
    }

    /// Flips the leadership flag. Gaining leadership re-fires any
    /// unacknowledged emitted triggers (at-least-once delivery).
    pub fn set_leader(&self, leader: bool) {
        self.leader.leader.store(leader, Ordering::Release);
        self.leader.cached_leader.store(leader, Ordering::Release);
        *self.leader.last_check.lock() = Instant::now();
        if leader {
            if let Ok(sender) = self.sender() {
                let _ = sender.try_send(LogRequest {
                    priority: 0,
                    kind: RequestKind::FirePending,
                });
            }
        }
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>, ArborError> {
        let (done, wait) = oneshot::channel();
        self.send(LogRequest {
            priority: 0,
            kind: RequestKind::Snapshot { done },
        })
        .await?;
        wait.await.map_err(|_| ArborError::Unavailable {
            message: "store is shut down".to_string(),
        })?
    }

    pub async fn restore(&self, bytes: Vec<u8>) -> Result<(), ArborError> {
        let (done, wait) = oneshot::channel();
        self.send(LogRequest {
            priority: 0,
            kind: RequestKind::Restore { bytes, done },
        })
        .await?;
        wait.await.map_err(|_| ArborError::Unavailable {
            message: "store is shut down".to_string(),
        })?
    }

    pub fn metrics(&self) -> LogMetrics {
        LogMetrics {
            commands_applied: self.telemetry.commands_applied.load(Ordering::Relaxed),
            applied_index: self.published.read().applied_index,
            pending_emitted_triggers: self.pending_triggers.load(Ordering::Relaxed) as usize,
            events_dispatched: self
                .dispatcher_telemetry
                .events_dispatched
                .load(Ordering::Relaxed),
            projection_failures: self
                .dispatcher_telemetry
                .projection_failures
                .load(Ordering::Relaxed),
            triggers_fired: self
                .dispatcher_telemetry
                .triggers_fired
                .load(Ordering::Relaxed),
            trigger_failures: self
                .dispatcher_telemetry
                .trigger_failures
                .load(Ordering::Relaxed),
        }
    }

    /// Closes the ingress and waits for the apply task to drain.
    pub async fn shutdown(&self) {
        self.ingress.lock().take();
        let task = self.task.lock().expect("task slot poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_loop(
    mut rx: mpsc::Receiver<LogRequest>,
    mut machine: StateMachine,
    mut dispatcher: Dispatcher,
    published: Arc<RwLock<PublishedState>>,
    pending_triggers: Arc<AtomicU64>,
    async_replies: Arc<AsyncReplies>,
    leader: Arc<LeaderState>,
    telemetry: Arc<LogTelemetry>,
) {
    let mut pending: BinaryHeap<PendingEntry> = BinaryHeap::new();
    let mut next_seq = 0u64;
    let mut index = 0u64;
    let mut ingress_closed = false;

    let mut enqueue = |pending: &mut BinaryHeap<PendingEntry>, request: LogRequest| {
        let seq = next_seq;
        next_seq += 1;
        pending.push(PendingEntry {
            priority: request.priority,
            seq,
            kind: request.kind,
        });
    };

    loop {
        if pending.is_empty() {
            if ingress_closed {
                break;
            }
            match rx.recv().await {
                Some(request) => enqueue(&mut pending, request),
                None => {
                    ingress_closed = true;
                    continue;
                }
            }
        }
        while let Ok(request) = rx.try_recv() {
            enqueue(&mut pending, request);
        }
        let Some(entry) = pending.pop() else {
            continue;
        };

        match entry.kind {
            RequestKind::Apply { command, slot } => {
                index += 1;
                let outcome = machine.apply(index, command);
                telemetry.commands_applied.fetch_add(1, Ordering::Relaxed);

                let is_leader = leader.leader.load(Ordering::Acquire);
                let acked = dispatcher.dispatch(machine.state(), &outcome, is_leader);
                if !acked.is_empty() {
                    index += 1;
                    machine.apply(index, Command::AckTriggered { ids: acked });
                }
                publish(&published, &pending_triggers, &machine, index);

                match slot {
                    ReplySlot::Sync(done) => {
                        let _ = done.send(outcome.reply);
                    }
                    ReplySlot::Async { correlation } => {
                        if let Some(correlation) = correlation {
                            async_replies.slots.lock().insert(correlation, outcome.reply);
                            async_replies.notify.notify_waiters();
                        }
                    }
                }
            }
            RequestKind::Barrier { done } => {
                let _ = done.send(index);
            }
            RequestKind::FirePending => {
                if leader.leader.load(Ordering::Acquire) {
                    let acked = dispatcher.fire_pending(machine.state());
                    if !acked.is_empty() {
                        index += 1;
                        machine.apply(index, Command::AckTriggered { ids: acked });
                        publish(&published, &pending_triggers, &machine, index);
                    }
                }
            }
            RequestKind::Snapshot { done } => {
                let _ = done.send(machine.snapshot());
            }
            RequestKind::Restore { bytes, done } => {
                let result = machine.restore(&bytes);
                if result.is_ok() {
                    index = machine.state().applied_index();
                    publish(&published, &pending_triggers, &machine, index);
                }
                let _ = done.send(result);
            }
        }
    }
    info!("arbordb apply loop stopped");
}

fn publish(
    published: &Arc<RwLock<PublishedState>>,
    pending_triggers: &Arc<AtomicU64>,
    machine: &StateMachine,
    index: u64,
) {
    *published.write() = PublishedState {
        tree: machine.state().tree().clone(),
        applied_index: index,
    };
    pending_triggers.store(
        machine.state().emitted_triggers().len() as u64,
        Ordering::Relaxed,
    );
}
