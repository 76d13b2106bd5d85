//! Named long-lived task set.
//!
//! The node owns a small set of named background tasks (gossip timer,
//! bootstrap poller, peer-sync delays). Naming keeps teardown and
//! debugging honest: every spawned task is tracked and aborted when the
//! set shuts down, so nothing outlives the node.

use std::fmt;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Tracked set of background tasks.
pub struct TaskSet {
    tasks: Vec<NamedTask>,
}

impl TaskSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Spawn and track a named task.
    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawning background task");
        self.tasks.push(NamedTask {
            name,
            handle: tokio::spawn(future),
        });
    }

    /// Drop finished tasks from tracking.
    pub fn reap(&mut self) {
        self.tasks.retain(|task| !task.handle.is_finished());
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|t| !t.handle.is_finished()).count()
    }

    /// Whether no tracked task is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of live tasks.
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.name)
            .collect()
    }

    /// Abort every tracked task.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            debug!(task = task.name, "Aborting background task");
            task.handle.abort();
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSet").field("tasks", &self.names()).finish()
    }
}
