//! Ordered shutdown handler registry

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

/// An asynchronous shutdown callback
pub type ShutdownHandler = Arc<dyn Fn() -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Identity of a registration, returned by `bind` and used by `unbind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Handlers keyed by position
///
/// Appends take increasing positions from 0, prepends take decreasing
/// positions from -1, so iteration order is always registry order.
pub(crate) struct ShutdownRegistry {
    entries: BTreeMap<i64, (HandlerId, ShutdownHandler)>,
    next_id: u64,
    next_tail: i64,
    next_head: i64,
    frozen: bool,
}

impl fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("ids", &self.ids())
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl ShutdownRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            next_tail: 0,
            next_head: -1,
            frozen: false,
        }
    }

    /// Insert a handler at the tail, or at the head when `prepend` is set
    ///
    /// Returns `None` once the registry is frozen.
    pub(crate) fn insert(&mut self, handler: ShutdownHandler, prepend: bool) -> Option<HandlerId> {
        if self.frozen {
            debug!("ShutdownRegistry::insert: frozen, refusing");
            return None;
        }

        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let position = if prepend {
            let p = self.next_head;
            self.next_head -= 1;
            p
        } else {
            let p = self.next_tail;
            self.next_tail += 1;
            p
        };

        debug!(%id, position, prepend, "ShutdownRegistry::insert: registered");
        self.entries.insert(position, (id, handler));
        Some(id)
    }

    /// Remove a registration, returning whether it was present
    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        if self.frozen {
            debug!(%id, "ShutdownRegistry::remove: frozen, ignoring");
            return false;
        }

        let position = self
            .entries
            .iter()
            .find(|(_, (entry_id, _))| *entry_id == id)
            .map(|(position, _)| *position);

        match position {
            Some(position) => {
                self.entries.remove(&position);
                debug!(%id, position, "ShutdownRegistry::remove: removed");
                true
            }
            None => {
                debug!(%id, "ShutdownRegistry::remove: not found");
                false
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Registration ids in execution order
    pub(crate) fn ids(&self) -> Vec<HandlerId> {
        self.entries.values().map(|(id, _)| *id).collect()
    }

    /// Freeze the registry and hand out its handlers in execution order
    pub(crate) fn freeze(&mut self) -> Vec<(HandlerId, ShutdownHandler)> {
        self.frozen = true;
        self.entries
            .values()
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect()
    }
}
