//! Boundary to the resource manager that serializes access to storage
//! resources across jobs.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{event, Level};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Any number of shared holders, no exclusive holder.
    Shared,
    /// A single holder, excluding every other holder of the same scope.
    Exclusive,
}

/// Name of a lockable resource.
///
/// Scopes are ordered by `(namespace, name)`; callers taking several locks
/// acquire them in that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceScope {
    pub namespace: String,
    pub name: String,
}

impl ResourceScope {
    /// Scope covering every volume of an image on a storage domain.
    pub fn image(storage_domain_id: Uuid, image_id: Uuid) -> Self {
        ResourceScope {
            namespace: format!("00_storage.{storage_domain_id}"),
            name: image_id.to_string(),
        }
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {timeout:?} acquiring {mode:?} lock on {scope}")]
    Timeout {
        scope: ResourceScope,
        mode: LockMode,
        timeout: Duration,
    },
    #[error("failed to acquire {mode:?} lock on {scope}: {reason}")]
    Failed {
        scope: ResourceScope,
        mode: LockMode,
        reason: String,
    },
}

/// A held lock.
///
/// The handle owns whatever guard object the resource manager produced for
/// it. Releasing drops that object; it happens at most once, either through
/// [`LockHandle::release`] or when the handle is dropped.
pub struct LockHandle {
    scope: ResourceScope,
    mode: LockMode,
    guard: Option<Box<dyn Any + Send + Sync>>,
}

impl LockHandle {
    pub fn new(scope: ResourceScope, mode: LockMode, guard: Box<dyn Any + Send + Sync>) -> Self {
        LockHandle {
            scope,
            mode,
            guard: Some(guard),
        }
    }

    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the lock. Calling this on an already released handle does
    /// nothing.
    pub fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            event!(Level::TRACE, scope = %self.scope, mode = ?self.mode, "Releasing lock");
            drop(guard);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("held", &self.is_held())
            .finish()
    }
}

#[async_trait]
pub trait ResourceGuard: Send + Sync + fmt::Debug + 'static {
    /// Wait until no conflicting lock is held on `scope`, then take it.
    ///
    /// Gives up with [`LockError::Timeout`] after `timeout`. Waiters are not
    /// guaranteed to be served in arrival order.
    async fn acquire(
        &self,
        scope: &ResourceScope,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockHandle, LockError>;
}
