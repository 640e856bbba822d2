//! Requests deferred until the running cycle reaches an idle boundary.
//!
//! At most one request per [`HookKind`] is pending; inserting another of the
//! same kind hands back the one it replaced.

use crate::Result;
use lightsync_storage::BlockHeight;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Request kind. The derived order is the drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookKind {
    /// Drop all local sync state
    Wipe,
    /// Rewind local state
    Rewind,
    /// Run another cycle right away
    AnotherSync,
}

/// A deferred request together with its completion channel
#[derive(Debug)]
pub enum DeferredHook {
    /// Run another cycle right away
    AnotherSync,
    /// Rewind to `height` (last scanned height when `None`)
    Rewind {
        /// Requested height
        height: Option<BlockHeight>,
        /// Receives the height actually rewound to
        on_complete: oneshot::Sender<Result<BlockHeight>>,
    },
    /// Drop all local sync state
    Wipe {
        /// Receives the outcome
        on_complete: oneshot::Sender<Result<()>>,
    },
}

impl DeferredHook {
    /// Kind tag used as the queue key
    pub fn kind(&self) -> HookKind {
        match self {
            Self::AnotherSync => HookKind::AnotherSync,
            Self::Rewind { .. } => HookKind::Rewind,
            Self::Wipe { .. } => HookKind::Wipe,
        }
    }

    /// Resolve the completion channel with `HookSuperseded`
    pub fn supersede(self) {
        match self {
            Self::AnotherSync => {}
            Self::Rewind { on_complete, .. } => {
                let _ = on_complete.send(Err(crate::Error::HookSuperseded));
            }
            Self::Wipe { on_complete } => {
                let _ = on_complete.send(Err(crate::Error::HookSuperseded));
            }
        }
    }
}

/// Pending deferred requests keyed by kind
#[derive(Debug, Default)]
pub struct DeferredActionQueue {
    pending: HashMap<HookKind, DeferredHook>,
}

impl DeferredActionQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `hook`, returning the pending hook of the same kind it replaced
    pub fn insert(&mut self, hook: DeferredHook) -> Option<DeferredHook> {
        self.pending.insert(hook.kind(), hook)
    }

    /// Number of pending hooks
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending hook in drain order
    pub fn drain(&mut self) -> Vec<DeferredHook> {
        let mut hooks: Vec<_> = self.pending.drain().map(|(_, hook)| hook).collect();
        hooks.sort_by_key(|hook| hook.kind());
        hooks
    }
}
