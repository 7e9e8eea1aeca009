//! In-process resource manager and multi-lock guarded context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{event, instrument, Level};

use sdm_rs::resource::{LockError, LockHandle, LockMode, ResourceGuard, ResourceScope};

type LockTable = HashMap<ResourceScope, Arc<RwLock<()>>>;

fn lock_table(table: &Mutex<LockTable>) -> std::sync::MutexGuard<'_, LockTable> {
    // The table only holds `Arc`s; a panic while it was locked cannot leave
    // an entry half-updated.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop the table entry of `scope` once nobody holds or waits on it.
///
/// Holders and waiters each own a clone of the entry's `Arc`, and new
/// acquirers only clone it with the table locked, so a strong count of one
/// under the table lock means the entry is unused.
fn prune(table: &Mutex<LockTable>, scope: &ResourceScope) {
    let mut table = lock_table(table);
    if let Some(entry) = table.get(scope) {
        if Arc::strong_count(entry) == 1 {
            table.remove(scope);
        }
    }
}

enum ScopeGuard {
    // Fields are only held for their `Drop`:
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

struct TableGuard {
    guard: Option<ScopeGuard>,
    scope: ResourceScope,
    table: Arc<Mutex<LockTable>>,
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.table, &self.scope);
    }
}

/// Lock table of shared / exclusive locks, keyed by resource scope.
///
/// Mutual exclusion is only guaranteed within this process.
#[derive(Debug, Default)]
pub struct ResourceManager {
    table: Arc<Mutex<LockTable>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scopes that currently have a holder or a waiter.
    pub fn active_scopes(&self) -> usize {
        lock_table(&self.table).len()
    }
}

#[async_trait]
impl ResourceGuard for ResourceManager {
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    async fn acquire(
        &self,
        scope: &ResourceScope,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let entry = lock_table(&self.table)
            .entry(scope.clone())
            .or_default()
            .clone();

        event!(Level::TRACE, "Waiting for lock");
        let acquired = match mode {
            LockMode::Shared => tokio::time::timeout(timeout, entry.read_owned())
                .await
                .map(ScopeGuard::Shared),
            LockMode::Exclusive => tokio::time::timeout(timeout, entry.write_owned())
                .await
                .map(ScopeGuard::Exclusive),
        };

        match acquired {
            Ok(guard) => {
                event!(Level::DEBUG, "Acquired lock");
                Ok(LockHandle::new(
                    scope.clone(),
                    mode,
                    Box::new(TableGuard {
                        guard: Some(guard),
                        scope: scope.clone(),
                        table: self.table.clone(),
                    }),
                ))
            }
            Err(_elapsed) => {
                // The timed out future owned our clone of the entry and is
                // gone now.
                prune(&self.table, scope);
                Err(LockError::Timeout {
                    scope: scope.clone(),
                    mode,
                    timeout,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub scope: ResourceScope,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn new(scope: ResourceScope, mode: LockMode) -> Self {
        LockRequest { scope, mode }
    }
}

/// A set of locks held together.
///
/// Locks are taken in scope order, so that two jobs locking overlapping sets
/// of images cannot deadlock, and released in reverse order. The context
/// releases everything it holds when dropped.
#[derive(Debug)]
pub struct GuardedContext {
    handles: Vec<LockHandle>,
}

impl GuardedContext {
    pub async fn acquire(
        guard: &dyn ResourceGuard,
        mut requests: Vec<LockRequest>,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        requests.sort_by(|a, b| a.scope.cmp(&b.scope));

        // A scope requested more than once is taken once, in the strongest
        // requested mode:
        requests.dedup_by(|next, kept| {
            if next.scope == kept.scope {
                if next.mode == LockMode::Exclusive {
                    kept.mode = LockMode::Exclusive;
                }
                true
            } else {
                false
            }
        });

        let mut context = GuardedContext {
            handles: Vec::with_capacity(requests.len()),
        };
        for request in requests {
            // On error, `context` is dropped here and releases what it holds.
            let handle = guard
                .acquire(&request.scope, request.mode, timeout)
                .await?;
            context.handles.push(handle);
        }

        Ok(context)
    }

    pub fn handles(&self) -> &[LockHandle] {
        &self.handles
    }

    pub fn release(&mut self) {
        while let Some(mut handle) = self.handles.pop() {
            handle.release();
        }
    }
}

impl Drop for GuardedContext {
    fn drop(&mut self) {
        self.release();
    }
}
