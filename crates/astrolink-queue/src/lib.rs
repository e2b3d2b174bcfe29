//! Priority queue actor: an isolated Tokio task that owns the execution
//! slot for one game session.
//!
//! The remote session hands out single-use tokens per response, so two
//! in-flight requests corrupt each other. Every session-touching
//! operation therefore goes through here: callers
//! [`acquire`](QueueHandle::acquire) a [`Permit`], run their work on
//! their own task while holding it, and release the slot by dropping it.
//! The actor grants permits strictly one at a time, highest priority
//! first, FIFO within a class.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Command backlog before `acquire` callers start waiting on the send.
const COMMAND_BUFFER: usize = 64;

/// Urgency classes, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    Important,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Important => "important",
            Priority::Critical => "critical",
        })
    }
}

/// Why the queue refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The bot was disabled; queued work is failed, new work is refused.
    #[error("bot is not enabled")]
    Inactive,
}

/// Exclusive ownership of the execution slot. Dropping it (or calling
/// [`release`](Permit::release)) hands the slot to the next waiter.
#[derive(Debug)]
pub struct Permit {
    done: Option<oneshot::Sender<()>>,
}

impl Permit {
    /// Releases the slot explicitly. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Snapshot of the queue: waiter counts per priority and the name of the
/// task currently holding the slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TasksOverview {
    pub low: usize,
    pub normal: usize,
    pub important: usize,
    pub critical: usize,
    pub running: Option<String>,
}

impl TasksOverview {
    pub fn total(&self) -> usize {
        self.low + self.normal + self.important + self.critical
    }
}

/// Commands sent to the queue actor through its channel.
enum QueueCommand {
    /// Wait for the execution slot at the given priority.
    Acquire {
        priority: Priority,
        name: String,
        reply: oneshot::Sender<Result<Permit, QueueError>>,
    },

    /// Request the current queue snapshot.
    Snapshot { reply: oneshot::Sender<TasksOverview> },
}

/// Handle to the running queue actor. Cheap to clone, it is just an
/// `mpsc::Sender` wrapper.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    /// Waits for the execution slot. Resolves once every queued task of
    /// higher priority (and earlier tasks of the same priority) has
    /// released it. Fails with [`QueueError::Inactive`] when the bot is
    /// disabled before the slot is granted.
    pub async fn acquire(
        &self,
        priority: Priority,
        name: impl Into<String>,
    ) -> Result<Permit, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(QueueCommand::Acquire {
                priority,
                name: name.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| QueueError::Inactive)?;
        reply_rx.await.map_err(|_| QueueError::Inactive)?
    }

    /// Requests the current queue snapshot.
    pub async fn snapshot(&self) -> Result<TasksOverview, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(QueueCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| QueueError::Inactive)?;
        reply_rx.await.map_err(|_| QueueError::Inactive)
    }
}

/// A queued request for the slot. Ordered by priority, then arrival.
struct Waiter {
    priority: Priority,
    seq: u64,
    name: String,
    reply: oneshot::Sender<Result<Permit, QueueError>>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the smaller sequence
        // number (earlier arrival).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The task currently holding the slot.
struct Running {
    name: String,
    done: oneshot::Receiver<()>,
}

/// The internal queue actor state. Runs inside a Tokio task.
struct QueueActor {
    receiver: mpsc::Receiver<QueueCommand>,
    cancelled: watch::Receiver<bool>,
    waiting: BinaryHeap<Waiter>,
    running: Option<Running>,
    next_seq: u64,
}

impl QueueActor {
    /// Runs the actor loop until cancellation or until every handle is
    /// dropped. A task that already holds a permit when cancellation
    /// fires keeps it; only queued waiters are failed.
    async fn run(mut self) {
        debug!("task queue started");

        loop {
            if *self.cancelled.borrow_and_update() {
                self.fail_waiting();
                break;
            }

            if self.running.is_none() {
                if let Some(waiter) = self.waiting.pop() {
                    self.grant(waiter);
                    continue;
                }
            }

            let has_running = self.running.is_some();
            tokio::select! {
                changed = self.cancelled.changed() => {
                    if changed.is_err() {
                        // Lifecycle dropped out from under us.
                        self.fail_waiting();
                        break;
                    }
                    // Loop top re-reads the flag.
                }
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = Self::slot_released(&mut self.running), if has_running => {
                    self.running = None;
                }
            }
        }

        debug!("task queue stopped");
    }

    fn handle(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Acquire {
                priority,
                name,
                reply,
            } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                debug!(task = %name, %priority, seq, "task queued");
                self.waiting.push(Waiter {
                    priority,
                    seq,
                    name,
                    reply,
                });
            }
            QueueCommand::Snapshot { reply } => {
                let _ = reply.send(self.overview());
            }
        }
    }

    fn grant(&mut self, waiter: Waiter) {
        let (done_tx, done_rx) = oneshot::channel();
        let permit = Permit {
            done: Some(done_tx),
        };
        if waiter.reply.send(Ok(permit)).is_ok() {
            debug!(task = %waiter.name, priority = %waiter.priority, "task granted the slot");
            self.running = Some(Running {
                name: waiter.name,
                done: done_rx,
            });
        }
        // A waiter whose caller already gave up is skipped entirely.
    }

    /// Resolves when the current permit is dropped. Only selected on
    /// while a task is running.
    async fn slot_released(running: &mut Option<Running>) {
        match running {
            Some(running) => {
                let _ = (&mut running.done).await;
            }
            None => std::future::pending().await,
        }
    }

    fn fail_waiting(&mut self) {
        let count = self.waiting.len();
        for waiter in self.waiting.drain() {
            let _ = waiter.reply.send(Err(QueueError::Inactive));
        }
        if count > 0 {
            warn!(count, "queue cancelled; failing queued tasks");
        }
    }

    fn overview(&self) -> TasksOverview {
        let mut overview = TasksOverview::default();
        for waiter in &self.waiting {
            match waiter.priority {
                Priority::Low => overview.low += 1,
                Priority::Normal => overview.normal += 1,
                Priority::Important => overview.important += 1,
                Priority::Critical => overview.critical += 1,
            }
        }
        overview.running = self.running.as_ref().map(|r| r.name.clone());
        overview
    }
}

/// Spawns the queue actor and returns a handle to it.
///
/// `cancelled` is the bot's per-enable cancellation signal: when it flips
/// to `true` the actor fails every queued waiter with
/// [`QueueError::Inactive`] and exits. Requests sent after that fail the
/// same way.
pub fn spawn_queue(cancelled: watch::Receiver<bool>) -> QueueHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = QueueActor {
        receiver: rx,
        cancelled,
        waiting: BinaryHeap::new(),
        running: None,
        next_seq: 0,
    };

    tokio::spawn(actor.run());

    QueueHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(priority: Priority, seq: u64) -> Waiter {
        let (reply, _rx) = oneshot::channel();
        Waiter {
            priority,
            seq,
            name: format!("task-{seq}"),
            reply,
        }
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::Important);
        assert!(Priority::Important < Priority::Critical);
    }

    #[test]
    fn test_waiter_heap_pops_highest_priority_first() {
        let mut heap = BinaryHeap::new();
        heap.push(waiter(Priority::Low, 0));
        heap.push(waiter(Priority::Critical, 1));
        heap.push(waiter(Priority::Normal, 2));
        assert_eq!(heap.pop().unwrap().priority, Priority::Critical);
        assert_eq!(heap.pop().unwrap().priority, Priority::Normal);
        assert_eq!(heap.pop().unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_waiter_heap_is_fifo_within_priority() {
        let mut heap = BinaryHeap::new();
        heap.push(waiter(Priority::Normal, 2));
        heap.push(waiter(Priority::Normal, 0));
        heap.push(waiter(Priority::Normal, 1));
        assert_eq!(heap.pop().unwrap().seq, 0);
        assert_eq!(heap.pop().unwrap().seq, 1);
        assert_eq!(heap.pop().unwrap().seq, 2);
    }

    #[test]
    fn test_overview_total() {
        let overview = TasksOverview {
            low: 1,
            normal: 2,
            important: 0,
            critical: 3,
            running: None,
        };
        assert_eq!(overview.total(), 6);
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::Low.to_string(), "low");
        assert_eq!(Priority::Critical.to_string(), "critical");
    }
}
