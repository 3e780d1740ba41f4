//! Deduplicating work queue with single flight per key
//!
//! Semantics follow the client-go workqueue: a key queued twice is processed
//! once; a key added while a worker holds it is marked dirty and requeued when
//! the worker calls [`WorkQueue::done`]. No two workers ever hold the same key.
//! Delayed adds keep only the earliest pending deadline per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Namespaced object identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Which handler a queued key is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKind {
    MySql,
    ProxySql,
    DormantDatabase,
    Snapshot,
    /// A backup timer fired for the MySQL object with this key
    ScheduledBackup,
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKind::MySql => write!(f, "MySQL"),
            WorkKind::ProxySql => write!(f, "ProxySQL"),
            WorkKind::DormantDatabase => write!(f, "DormantDatabase"),
            WorkKind::Snapshot => write!(f, "Snapshot"),
            WorkKind::ScheduledBackup => write!(f, "ScheduledBackup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub kind: WorkKind,
    pub object: ObjectKey,
}

impl QueueKey {
    pub fn new(kind: WorkKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            object: ObjectKey::new(namespace, name),
        }
    }

    pub fn mysql(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkKind::MySql, namespace, name)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.object)
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be processed, queued or not
    dirty: HashSet<T>,
    /// Keys currently held by a worker
    processing: HashSet<T>,
    /// Earliest pending delayed add per key
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` unless it is already waiting
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `item` once `delay` has elapsed
    ///
    /// A later deadline for a key that already has an earlier one pending is
    /// dropped; an earlier one supersedes the pending timer.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&item) {
                Some(pending) if *pending <= deadline => return,
                _ => {
                    state.waiting.insert(item.clone(), deadline);
                }
            }
        }

        let queue = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => queue.fire(item, deadline),
            }
        });
    }

    /// Add a delayed key unless an earlier deadline replaced this one
    fn fire(&self, item: T, deadline: Instant) {
        let current = {
            let mut state = self.lock();
            let current = state.waiting.get(&item) == Some(&deadline);
            if current {
                state.waiting.remove(&item);
            }
            current
        };
        if current {
            self.add(item);
        }
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next key without waiting
    pub fn try_get(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.queue.pop_front()?;
        state.dirty.remove(&item);
        state.processing.insert(item.clone());
        Some(item)
    }

    /// Release `item`; requeue it if it was added while held
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    /// Keys with a delayed add pending
    pub fn delayed(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Stop handing out keys and cancel delayed adds
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
