//! In-process broker.
//!
//! Queues live in a shared map behind a mutex; receivers park on a `Notify`
//! and wake on every send or requeue. Honors delivery delay, expiration and
//! priority ordering on priority-enabled queues. Unsettled deliveries go back
//! onto their queue when the session that received them is dropped.
//!
//! Also records recent settlements, which makes it the driver of choice for
//! exercising processors and the consumption runtime. Nothing outlives the
//! process; use it for tests and local development. The settlement journal
//! and dead letters keep only the most recent entries (see
//! [`InMemoryDriver::with_history_limit`]).

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Driver, Session};
use crate::destination::QueueOptions;
use crate::error::{Error, Result};
use crate::message::{Message, MessageId, Priority, ReceiptHandle};

/// Settlements and dead letters kept by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// A settlement observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Acknowledged {
        message_id: MessageId,
        queue: String,
    },
    Rejected {
        message_id: MessageId,
        queue: String,
        requeue: bool,
    },
}

struct Stored {
    seq: u64,
    message: Message,
    /// Completed delivery attempts so far.
    deliveries: u32,
    available_at: Instant,
}

struct MemoryQueue {
    options: QueueOptions,
    ready: Vec<Stored>,
}

struct Pending {
    session: u64,
    queue: String,
    stored: Stored,
}

struct BrokerState {
    connected: bool,
    queues: HashMap<String, MemoryQueue>,
    in_flight: HashMap<i64, Pending>,
    next_receipt: i64,
    next_seq: u64,
    journal: VecDeque<SessionEvent>,
    dead_letters: VecDeque<Message>,
    history_limit: usize,
}

impl BrokerState {
    fn new(history_limit: usize) -> Self {
        Self {
            connected: true,
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            next_receipt: 1,
            next_seq: 0,
            journal: VecDeque::new(),
            dead_letters: VecDeque::new(),
            history_limit,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Transport("broker connection lost".to_string()))
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Pop the next deliverable message, dropping expired ones on the way.
    fn take(&mut self, queue: &str, session: u64, now: Instant) -> Result<Option<Message>> {
        let wall_now = Utc::now();
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Transport(format!("queue {queue} is not declared")))?;

        q.ready.retain(|s| {
            let expired = s.message.is_expired(wall_now);
            if expired {
                debug!(queue, message_id = %s.message.id, "dropping expired message");
            }
            !expired
        });

        let priority = q.options.priority;
        let best = q
            .ready
            .iter()
            .enumerate()
            .filter(|(_, s)| s.available_at <= now)
            .min_by_key(|(_, s)| {
                let rank = if priority {
                    s.message.headers.priority
                } else {
                    Priority::Normal
                };
                (Reverse(rank), s.seq)
            })
            .map(|(i, _)| i);

        let Some(index) = best else {
            return Ok(None);
        };

        let mut stored = q.ready.remove(index);
        stored.deliveries += 1;

        let receipt = self.next_receipt;
        self.next_receipt += 1;

        let mut delivered = stored.message.clone();
        delivered.delivery_count = stored.deliveries;
        delivered.redelivered = stored.deliveries > 1;
        delivered.receipt = Some(ReceiptHandle {
            queue: queue.to_string(),
            id: receipt,
        });

        self.in_flight.insert(
            receipt,
            Pending {
                session,
                queue: queue.to_string(),
                stored,
            },
        );
        Ok(Some(delivered))
    }

    /// Earliest instant a delayed message in `queue` becomes deliverable.
    fn next_available(&self, queue: &str) -> Option<Instant> {
        self.queues
            .get(queue)?
            .ready
            .iter()
            .map(|s| s.available_at)
            .min()
    }

    fn settle(&mut self, message: &Message) -> Result<Pending> {
        self.ensure_connected()?;
        let receipt = message.receipt()?;
        self.in_flight.remove(&receipt.id).ok_or_else(|| {
            Error::Transport(format!(
                "unknown delivery {} for message {}",
                receipt.id, message.id
            ))
        })
    }

    fn record(&mut self, event: SessionEvent) {
        push_bounded(&mut self.journal, event, self.history_limit);
    }

    fn bury(&mut self, message: Message) {
        push_bounded(&mut self.dead_letters, message, self.history_limit);
    }

    fn requeue(&mut self, queue: String, mut stored: Stored) {
        stored.seq = self.next_seq();
        stored.available_at = Instant::now();
        if let Some(q) = self.queues.get_mut(&queue) {
            q.ready.push(stored);
        }
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(item);
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_session: AtomicU64,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Transport("broker state poisoned".to_string()))
    }
}

/// In-memory [`Driver`]. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryDriver {
    shared: Arc<Shared>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` journal entries and dead letters, dropping the oldest.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::new(limit)),
                notify: Notify::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate connection loss: every operation fails until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.connected = false;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.connected = true;
        }
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let Ok(state) = self.shared.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared.lock().ok()?.queues.get(queue).map(|q| q.options)
    }

    /// Messages waiting in a queue, including delayed ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Deliveries handed out but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Recent acknowledge/reject events, oldest first.
    pub fn journal(&self) -> Vec<SessionEvent> {
        self.shared
            .lock()
            .map(|s| s.journal.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recent messages rejected without requeue, oldest first.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.shared
            .lock()
            .map(|s| s.dead_letters.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.ensure_connected()?;
        if let Some(existing) = state.queues.get(queue) {
            if existing.options != *options {
                debug!(queue, "queue already declared with different options, keeping original");
            }
            return Ok(());
        }
        state.queues.insert(
            queue.to_string(),
            MemoryQueue {
                options: *options,
                ready: Vec::new(),
            },
        );
        debug!(queue, "queue declared");
        Ok(())
    }

    async fn send(&self, queue: &str, message: &Message) -> Result<()> {
        {
            let mut state = self.shared.lock()?;
            state.ensure_connected()?;
            let seq = state.next_seq();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::Transport(format!("queue {queue} is not declared")))?;

            let delay = Duration::from_millis(message.headers.delay_ms.unwrap_or(0));
            let mut stored = message.clone();
            stored.receipt = None;
            stored.redelivered = false;
            stored.delivery_count = 0;
            q.ready.push(Stored {
                seq,
                message: stored,
                deliveries: 0,
                available_at: Instant::now() + delay,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        self.shared.lock()?.ensure_connected()?;
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(InMemorySession {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Session over the in-memory broker.
pub struct InMemorySession {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl Session for InMemorySession {
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a send between the check
            // and the wait still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.shared.lock()?;
                state.ensure_connected()?;
                let now = Instant::now();
                if let Some(message) = state.take(queue, self.id, now)? {
                    return Ok(Some(message));
                }
                if now >= deadline {
                    return Ok(None);
                }
                match state.next_available(queue) {
                    Some(at) if at < deadline => at,
                    _ => deadline,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        let mut state = self.shared.lock()?;
        let pending = state.settle(message)?;
        state.record(SessionEvent::Acknowledged {
            message_id: message.id,
            queue: pending.queue,
        });
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        {
            let mut state = self.shared.lock()?;
            let pending = state.settle(message)?;
            state.record(SessionEvent::Rejected {
                message_id: message.id,
                queue: pending.queue.clone(),
                requeue,
            });
            if requeue {
                state.requeue(pending.queue, pending.stored);
            } else {
                state.bury(pending.stored.message);
            }
        }
        if requeue {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        let orphaned: Vec<i64> = state
            .in_flight
            .iter()
            .filter(|(_, p)| p.session == self.id)
            .map(|(receipt, _)| *receipt)
            .collect();
        if orphaned.is_empty() {
            return;
        }
        for receipt in orphaned {
            if let Some(pending) = state.in_flight.remove(&receipt) {
                debug!(queue = %pending.queue, "returning unsettled delivery to queue");
                state.requeue(pending.queue, pending.stored);
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}
