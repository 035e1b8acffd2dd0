//! Per-kind subscriber registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Envelope, EventKind};

/// Error returned by a subscriber callback. It is logged and counted, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one subscriber invocation.
pub type HandlerResult = Result<(), HandlerError>;

type Callback = dyn Fn(&Envelope) -> HandlerResult + Send + Sync;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", &self.0.simple().to_string()[..8])
    }
}

/// Shared handle to a subscriber callback.
///
/// The registry and the caller each hold a clone; the callback lives as long as
/// any clone does.
#[derive(Clone)]
pub struct SubscriberHandle {
    id: SubscriptionId,
    callback: Arc<Callback>,
}

impl SubscriberHandle {
    /// Wrap a callback in a fresh handle.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            id: SubscriptionId::new(),
            callback: Arc::new(callback),
        }
    }

    /// Identity of this subscription.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn invoke(&self, envelope: &Envelope) -> HandlerResult {
        (self.callback)(envelope)
    }
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Mapping from event kind to an ordered list of subscribers.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    by_kind: HashMap<EventKind, Vec<SubscriberHandle>>,
}

impl CallbackRegistry {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handle` to the subscribers of `kind`.
    pub fn add(&mut self, kind: EventKind, handle: SubscriberHandle) {
        self.by_kind.entry(kind).or_default().push(handle);
    }

    /// Remove `id` from `kind`. Returns false if it was not registered there.
    pub fn remove(&mut self, kind: EventKind, id: SubscriptionId) -> bool {
        let Some(list) = self.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.by_kind.remove(&kind);
        }
        removed
    }

    /// Remove `id` from every kind. Returns how many registrations were dropped.
    pub fn remove_all(&mut self, id: SubscriptionId) -> usize {
        let mut removed = 0;
        for list in self.by_kind.values_mut() {
            let before = list.len();
            list.retain(|h| h.id != id);
            removed += before - list.len();
        }
        self.by_kind.retain(|_, list| !list.is_empty());
        removed
    }

    /// Ordered snapshot of the subscribers for `kind`.
    #[must_use]
    pub fn handlers(&self, kind: EventKind) -> Vec<SubscriberHandle> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    /// Number of subscribers registered for `kind`.
    #[must_use]
    pub fn len(&self, kind: EventKind) -> usize {
        self.by_kind.get(&kind).map_or(0, Vec::len)
    }

    /// True if no kind has any subscriber.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> SubscriberHandle {
        SubscriberHandle::new(|_| Ok(()))
    }

    #[test]
    fn add_preserves_registration_order() {
        let mut reg = CallbackRegistry::new();
        let a = noop();
        let b = noop();
        reg.add(EventKind::MatchStart, a.clone());
        reg.add(EventKind::MatchStart, b.clone());

        let ids: Vec<_> = reg.handlers(EventKind::MatchStart).iter().map(SubscriberHandle::id).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
        assert_eq!(reg.len(EventKind::MatchEnd), 0);
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut reg = CallbackRegistry::new();
        let a = noop();
        assert!(!reg.remove(EventKind::MatchStart, a.id()));

        reg.add(EventKind::MatchStart, a.clone());
        assert!(reg.remove(EventKind::MatchStart, a.id()));
        assert!(!reg.remove(EventKind::MatchStart, a.id()));
        assert!(reg.is_empty());
    }

    #[test]
    fn handle_may_span_kinds() {
        let mut reg = CallbackRegistry::new();
        let a = noop();
        let b = noop();
        reg.add(EventKind::MatchStart, a.clone());
        reg.add(EventKind::MatchEnd, a.clone());
        reg.add(EventKind::MatchEnd, b.clone());

        assert_eq!(reg.remove_all(a.id()), 2);
        assert_eq!(reg.len(EventKind::MatchStart), 0);
        assert_eq!(reg.handlers(EventKind::MatchEnd)[0].id(), b.id());
    }

    #[test]
    fn subscription_id_display_is_short() {
        let id = SubscriptionId::new();
        let s = id.to_string();
        assert!(s.starts_with("sub-"));
        assert_eq!(s.len(), 12);
    }
}
