//! Advisory subtree locks for mutating namespace operations.
//!
//! A lock set covers every path an operation touches. Two sets conflict when a
//! path of one equals, contains or is contained by a path of the other. Sets
//! are taken atomically, so holders never deadlock on each other.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::utils::path::is_within;

#[derive(Default)]
struct LockTable {
    held: Vec<(u64, Vec<String>)>,
    next_ticket: u64,
}

#[derive(Clone, Default)]
pub struct PathLocks {
    table: Arc<Mutex<LockTable>>,
    released: Arc<Notify>,
}

/// Releases its paths when dropped.
pub struct PathLockGuard {
    ticket: u64,
    paths: Vec<String>,
    locks: PathLocks,
}

impl PathLockGuard {
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until none of `paths` overlaps a held lock, then hold them all.
    pub async fn acquire<I, S>(&self, paths: I) -> PathLockGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut wanted: Vec<String> = paths.into_iter().map(Into::into).collect();
        wanted.sort();
        wanted.dedup();
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ticket) = self.try_insert(&wanted) {
                return PathLockGuard {
                    ticket,
                    paths: wanted,
                    locks: self.clone(),
                };
            }
            tracing::debug!("waiting for path locks on {:?}", wanted);
            notified.await;
        }
    }

    /// Non-blocking variant of [`PathLocks::acquire`].
    pub fn try_acquire<I, S>(&self, paths: I) -> Option<PathLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: Vec<String> = paths.into_iter().map(Into::into).collect();
        self.try_insert(&wanted).map(|ticket| PathLockGuard {
            ticket,
            paths: wanted,
            locks: self.clone(),
        })
    }

    fn try_insert(&self, wanted: &[String]) -> Option<u64> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let busy = table.held.iter().any(|(_, held)| {
            held.iter()
                .any(|h| wanted.iter().any(|w| is_within(w, h) || is_within(h, w)))
        });
        if busy {
            return None;
        }
        let ticket = table.next_ticket;
        table.next_ticket += 1;
        table.held.push((ticket, wanted.to_vec()));
        Some(ticket)
    }

    fn release(&self, ticket: u64) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.held.retain(|(t, _)| *t != ticket);
        drop(table);
        self.released.notify_waiters();
    }

    pub fn held_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .held
            .len()
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.locks.release(self.ticket);
    }
}
