//! Queue registry: durable local queues plus proxies for peer-broker queues.
//!
//! The [`LocalQueueManager`] owns every queue hosted by this broker,
//! including the designated dead-letter queue. [`remote::RemoteQueueManager`]
//! holds name-level proxies for one peer's advertised queues. The
//! [`QueueRegistry`] facade resolves a name local-first, then across remote
//! managers, so request processors never care where a queue lives.

pub mod registry;
pub mod remote;
pub mod store;

pub use registry::{QueueRegistry, ResolvedQueue};
pub use remote::{FederationIdentity, RemoteQueue, RemoteQueueManager};

use crate::protocol::now_millis;
pub use crate::protocol::{Disposition, QueueMessage};
use crate::{RelayError, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time view of one queue, as returned by QUERY.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub name: String,
    pub depth: usize,
    pub threshold: usize,
    pub disposition: Disposition,
}

/// A named FIFO queue. One mutex per queue serializes PUT and GET, which is
/// what preserves FIFO under concurrent sessions.
#[derive(Debug)]
pub struct Queue {
    name: String,
    threshold: AtomicUsize,
    disposition: RwLock<Disposition>,
    messages: Mutex<VecDeque<QueueMessage>>,
}

impl Queue {
    pub fn new(name: impl Into<String>, threshold: usize, disposition: Disposition) -> Self {
        Self {
            name: name.into(),
            threshold: AtomicUsize::new(threshold),
            disposition: RwLock::new(disposition),
            messages: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn disposition(&self) -> Disposition {
        *self.disposition.read()
    }

    pub fn depth(&self) -> usize {
        self.messages.lock().len()
    }

    fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Release);
    }

    fn set_disposition(&self, disposition: Disposition) {
        *self.disposition.write() = disposition;
    }

    /// Append to the tail. Fails without touching the queue when depth is
    /// already at the threshold; overflow is a caller-visible error, never an
    /// implicit dead-letter.
    pub fn push(&self, message: QueueMessage) -> Result<()> {
        let mut messages = self.messages.lock();
        if messages.len() >= self.threshold() {
            return Err(RelayError::QueueFull(self.name.clone()));
        }
        messages.push_back(message);
        Ok(())
    }

    /// Pop from the head. Messages whose expiry has already passed are
    /// dropped on the way out rather than delivered.
    pub fn pop(&self) -> Option<QueueMessage> {
        let now = now_millis();
        let mut messages = self.messages.lock();
        while let Some(message) = messages.pop_front() {
            if message.expired(now) {
                debug!(queue = %self.name, "dropping expired message on get");
                continue;
            }
            return Some(message);
        }
        None
    }

    /// Drop every message whose expiry has passed; returns the removal count.
    pub fn expire(&self, now_ms: u64) -> usize {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| !m.expired(now_ms));
        before - messages.len()
    }

    /// Clone the current contents, head first. Used by the snapshot writer.
    pub fn snapshot_messages(&self) -> Vec<QueueMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    fn restore(&self, messages: Vec<QueueMessage>) {
        let mut guard = self.messages.lock();
        guard.clear();
        guard.extend(messages);
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            name: self.name.clone(),
            depth: self.depth(),
            threshold: self.threshold(),
            disposition: self.disposition(),
        }
    }
}

/// Owns all queues local to this broker, the dead-letter queue included, and
/// their crash-safe persistence.
pub struct LocalQueueManager {
    queues: DashMap<String, Arc<Queue>>,
    dead_queue: Arc<Queue>,
    repo_dir: PathBuf,
    poll_interval: Duration,
}

impl LocalQueueManager {
    /// `repository_dir` is the configured root; snapshots live in its `repo/`
    /// subdirectory. The dead-letter queue is created immediately and is
    /// always TEMPORARY.
    pub fn new(
        repository_dir: impl AsRef<Path>,
        dead_queue_name: &str,
        poll_interval: Duration,
    ) -> Self {
        let queues = DashMap::new();
        let dead_name = normalize(dead_queue_name);
        let dead_queue = Arc::new(Queue::new(
            dead_name.clone(),
            usize::MAX,
            Disposition::Temporary,
        ));
        queues.insert(dead_name, Arc::clone(&dead_queue));
        Self {
            queues,
            dead_queue,
            repo_dir: repository_dir.as_ref().join("repo"),
            poll_interval,
        }
    }

    /// Idempotent-by-name create. Redefining an existing queue replaces its
    /// threshold and disposition but keeps its pending messages. Names that
    /// could be read as filesystem paths are rejected here, before they can
    /// ever reach a snapshot filename.
    pub fn define_queue(
        &self,
        name: &str,
        threshold: usize,
        disposition: Disposition,
    ) -> Result<Arc<Queue>> {
        let name = normalize(name);
        if !valid_name(&name) {
            return Err(RelayError::Protocol(format!(
                "invalid queue name '{}'",
                name
            )));
        }
        match self.queues.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let queue = entry.get();
                queue.set_threshold(threshold);
                queue.set_disposition(disposition);
                info!(queue = %name, threshold, "redefined queue");
                Ok(Arc::clone(queue))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let queue = Arc::new(Queue::new(name.clone(), threshold, disposition));
                entry.insert(Arc::clone(&queue));
                info!(queue = %name, threshold, ?disposition, "defined queue");
                Ok(queue)
            }
        }
    }

    /// Apply only the provided fields. An invalid field value is logged and
    /// skipped; the remaining fields are still applied.
    pub fn alter_queue(
        &self,
        name: &str,
        threshold: Option<usize>,
        disposition: Option<Disposition>,
    ) -> Result<()> {
        let name = normalize(name);
        let queue = self
            .queues
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::UnknownQueue(name.clone()))?;

        if let Some(threshold) = threshold {
            if threshold == 0 {
                warn!(queue = %name, "ignoring alter with zero threshold");
            } else {
                queue.set_threshold(threshold);
                info!(queue = %name, threshold, "altered queue threshold");
            }
        }
        if let Some(disposition) = disposition {
            queue.set_disposition(disposition);
            info!(queue = %name, ?disposition, "altered queue disposition");
        }
        Ok(())
    }

    /// Remove the queue from the registry. Pending messages go with it; the
    /// caller drains or backs up first if retention is wanted.
    pub fn delete_queue(&self, name: &str) -> Option<Arc<Queue>> {
        let name = normalize(name);
        let removed = self.queues.remove(&name).map(|(_, queue)| queue);
        if removed.is_some() {
            info!(queue = %name, "deleted queue");
        }
        removed
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues
            .get(&normalize(name))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn put(&self, name: &str, message: QueueMessage) -> Result<()> {
        let name = normalize(name);
        let queue = self
            .get_queue(&name)
            .ok_or_else(|| RelayError::UnknownQueue(name))?;
        queue.push(message)
    }

    /// Pop from the head, polling while the queue is empty. `timeout_ms == 0`
    /// waits indefinitely; otherwise `Ok(None)` once the timeout elapses.
    pub async fn get(&self, name: &str, timeout_ms: u64) -> Result<Option<QueueMessage>> {
        let name = normalize(name);
        let queue = self
            .get_queue(&name)
            .ok_or_else(|| RelayError::UnknownQueue(name))?;

        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            if let Some(message) = queue.pop() {
                return Ok(Some(message));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn query(&self, name: &str) -> Option<QueueStatus> {
        self.get_queue(name).map(|queue| queue.status())
    }

    /// Record a rejected message on the dead-letter queue. The dead queue is
    /// unbounded, so this cannot fail on capacity.
    pub fn dead_letter(&self, message: QueueMessage) {
        if let Err(e) = self.dead_queue.push(message) {
            warn!("failed to dead-letter message: {}", e);
        }
    }

    pub fn dead_queue(&self) -> Arc<Queue> {
        Arc::clone(&self.dead_queue)
    }

    /// One expiry pass over every local queue.
    pub fn expire(&self, now_ms: u64) -> usize {
        self.queues_snapshot()
            .iter()
            .map(|queue| queue.expire(now_ms))
            .sum()
    }

    /// Stable snapshot of the current queue set, for scans that must not
    /// hold the registry while they work.
    pub fn queues_snapshot(&self) -> Vec<Arc<Queue>> {
        self.queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Names advertised to peers. The dead-letter queue stays private.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .iter()
            .filter(|entry| entry.key() != self.dead_queue.name())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Restore every PERMANENT queue persisted under the repository
    /// directory. A missing directory or an unreadable snapshot means "queue
    /// did not previously exist", never a startup failure.
    pub fn activate(&self) -> Result<()> {
        std::fs::create_dir_all(&self.repo_dir)?;
        let entries = std::fs::read_dir(&self.repo_dir)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(store::SNAPSHOT_EXT) {
                continue;
            }
            match store::read_snapshot(&path).and_then(|snapshot| {
                let count = snapshot.messages.len();
                let queue = self.define_queue(
                    &snapshot.name,
                    snapshot.threshold,
                    Disposition::Permanent,
                )?;
                queue.restore(snapshot.messages);
                Ok((queue, count))
            }) {
                Ok((queue, count)) => {
                    info!(queue = %queue.name(), messages = count, "restored queue from snapshot");
                }
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable snapshot: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Write every PERMANENT queue's contents wholesale to its snapshot
    /// file. Stale snapshots (deleted or re-dispositioned queues) are
    /// removed first, so absence of a file after restart means absence of
    /// the queue.
    pub fn deactivate(&self) -> Result<()> {
        std::fs::create_dir_all(&self.repo_dir)?;
        for entry in std::fs::read_dir(&self.repo_dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(store::SNAPSHOT_EXT) {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove stale snapshot: {}", e);
                }
            }
        }
        for queue in self.queues_snapshot() {
            if queue.disposition() != Disposition::Permanent {
                continue;
            }
            match store::write_snapshot(&self.repo_dir, &queue) {
                Ok(count) => {
                    info!(queue = %queue.name(), messages = count, "persisted queue snapshot")
                }
                Err(e) => warn!(queue = %queue.name(), "failed to persist snapshot: {}", e),
            }
        }
        Ok(())
    }
}

/// Queue names are case-normalized to uppercase at every entry point.
pub(crate) fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

/// A queue name is one path-free token: letters, digits, dot, underscore,
/// hyphen. Names double as snapshot filenames, so nothing the filesystem
/// would interpret as a path component is allowed through.
pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
