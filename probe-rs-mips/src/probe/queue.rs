//! Scans scheduled for a later batch, and the results they captured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::probe::CommandResult;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A batch stopped at a failing command.
#[derive(thiserror::Error, Debug)]
#[error("{error} after {} successful commands", .results.len())]
pub struct BatchExecutionError {
    #[source]
    pub error: crate::Error,

    /// What the commands before the failing one captured.
    pub results: DeferredResultSet<CommandResult>,
}

impl BatchExecutionError {
    pub(crate) fn new(error: crate::Error, results: DeferredResultSet<CommandResult>) -> Self {
        Self { error, results }
    }
}

/// Handle to the result of a scheduled command.
///
/// The queue only holds a weak reference to the handle. Once the handle is
/// dropped, the result of the command is no longer captured.
pub struct DeferredResultIndex {
    id: u64,
    claim: Arc<()>,
}

impl DeferredResultIndex {
    fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            claim: Arc::new(()),
        }
    }
}

impl std::fmt::Debug for DeferredResultIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeferredResultIndex({})", self.id)
    }
}

impl PartialEq for DeferredResultIndex {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeferredResultIndex {}

/// A command waiting in a [`CommandQueue`].
#[derive(Debug)]
pub struct ScheduledCommand<T> {
    id: u64,
    claim: Weak<()>,
    command: T,
}

impl<T> ScheduledCommand<T> {
    pub fn command(&self) -> &T {
        &self.command
    }

    /// Whether someone still holds the index of this command.
    pub fn is_wanted(&self) -> bool {
        self.claim.strong_count() > 0
    }
}

/// Commands collected for a single batch on the probe.
#[derive(Debug)]
pub struct CommandQueue<T> {
    commands: Vec<ScheduledCommand<T>>,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `command` and returns the handle its result is read with.
    pub fn schedule(&mut self, command: impl Into<T>) -> DeferredResultIndex {
        let index = DeferredResultIndex::new();
        self.commands.push(ScheduledCommand {
            id: index.id,
            claim: Arc::downgrade(&index.claim),
            command: command.into(),
        });
        index
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledCommand<T>> {
        self.commands.iter()
    }
}

/// Results captured by a batch, keyed by the index of their command.
#[derive(Debug)]
pub struct DeferredResultSet<T>(HashMap<u64, T>);

impl<T> Default for DeferredResultSet<T> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<T> DeferredResultSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(HashMap::with_capacity(capacity))
    }

    /// Records the result of `command`, unless its index was dropped.
    pub fn push<C>(&mut self, command: &ScheduledCommand<C>, result: T) {
        if command.is_wanted() {
            self.0.insert(command.id, result);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn merge_from(&mut self, other: DeferredResultSet<T>) {
        self.0.extend(other.0);
    }

    /// Takes the result for `index`, handing the index back if there is none.
    pub fn take(&mut self, index: DeferredResultIndex) -> Result<T, DeferredResultIndex> {
        self.0.remove(&index.id).ok_or(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(queue: &CommandQueue<u32>) -> DeferredResultSet<u32> {
        let mut results = DeferredResultSet::with_capacity(queue.len());
        for scheduled in queue.iter() {
            results.push(scheduled, *scheduled.command() * 10);
        }
        results
    }

    #[test]
    fn dropped_index_is_not_captured() {
        let mut queue = CommandQueue::<u32>::new();

        let kept = queue.schedule(1u32);
        let dropped = queue.schedule(2u32);
        drop(dropped);

        let mut results = run(&queue);

        assert_eq!(results.len(), 1);
        assert_eq!(results.take(kept), Ok(10));
        assert!(results.is_empty());
    }

    #[test]
    fn missing_result_returns_the_index() {
        let mut queue = CommandQueue::<u32>::new();
        let first = queue.schedule(1u32);
        let later = queue.schedule(2u32);

        let mut results = DeferredResultSet::new();
        results.push(queue.iter().next().unwrap(), 7);

        assert_eq!(results.take(first), Ok(7));

        // The handed back index can be used once the result arrives.
        let later = results.take(later).unwrap_err();
        results.push(queue.iter().nth(1).unwrap(), 8);
        assert_eq!(results.take(later), Ok(8));
    }
}
