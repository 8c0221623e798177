//! Line Router
//!
//! Dispatches each line received from the printer to the handlers registered
//! for matching patterns. Entries are evaluated by descending priority, the
//! most recent registration first among equals. Every handler of a matching
//! entry fires; an exclusive entry then stops the walk.

use parking_lot::RwLock;
use regex::{Captures, Regex};
use std::sync::Arc;
use uuid::Uuid;

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler({})", &self.0.to_string()[..8])
    }
}

/// Callback invoked with the routed line and its captures
pub type LineHandler = Arc<dyn Fn(&str, &Captures<'_>) + Send + Sync>;

struct RouteEntry {
    pattern: Regex,
    priority: i32,
    exclusive: bool,
    sequence: u64,
    handlers: Vec<(HandlerId, LineHandler)>,
}

#[derive(Default)]
struct RouterInner {
    entries: Vec<RouteEntry>,
    next_sequence: u64,
}

impl RouterInner {
    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(b.sequence.cmp(&a.sequence)));
    }
}

/// Priority-ordered regex dispatcher
#[derive(Default)]
pub struct LineRouter {
    inner: RwLock<RouterInner>,
}

impl LineRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exclusive handler for `pattern`
    pub fn register<F>(&self, pattern: &Regex, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&str, &Captures<'_>) + Send + Sync + 'static,
    {
        self.insert(pattern, priority, true, Arc::new(handler))
    }

    /// Register a handler that lets lower-priority entries see the line too
    pub fn register_non_exclusive<F>(&self, pattern: &Regex, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&str, &Captures<'_>) + Send + Sync + 'static,
    {
        self.insert(pattern, priority, false, Arc::new(handler))
    }

    fn insert(
        &self,
        pattern: &Regex,
        priority: i32,
        exclusive: bool,
        handler: LineHandler,
    ) -> HandlerId {
        let id = HandlerId::new();
        let mut inner = self.inner.write();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        match inner
            .entries
            .iter_mut()
            .find(|entry| entry.pattern.as_str() == pattern.as_str())
        {
            Some(entry) => {
                entry.handlers.push((id, handler));
                entry.exclusive |= exclusive;
                if priority > entry.priority {
                    entry.priority = priority;
                    entry.sequence = sequence;
                }
            }
            None => inner.entries.push(RouteEntry {
                pattern: pattern.clone(),
                priority,
                exclusive,
                sequence,
                handlers: vec![(id, handler)],
            }),
        }
        inner.sort();
        tracing::trace!("{} registered for {:?}", id, pattern.as_str());
        id
    }

    /// Remove one handler from `pattern`
    ///
    /// The entry disappears with its last handler. Returns whether the
    /// handler was found.
    pub fn unregister(&self, pattern: &Regex, id: HandlerId) -> bool {
        let mut inner = self.inner.write();
        let Some(index) = inner
            .entries
            .iter()
            .position(|entry| entry.pattern.as_str() == pattern.as_str())
        else {
            return false;
        };

        let entry = &mut inner.entries[index];
        let before = entry.handlers.len();
        entry.handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = entry.handlers.len() != before;
        if entry.handlers.is_empty() {
            inner.entries.remove(index);
        }
        removed
    }

    /// Dispatch `line` to the matching handlers
    ///
    /// Handlers run after the routing table lock is released, so they may
    /// register or unregister. Returns whether anything matched.
    pub fn route(&self, line: &str) -> bool {
        let mut matched: Vec<(Captures<'_>, Vec<LineHandler>)> = Vec::new();
        {
            let inner = self.inner.read();
            for entry in &inner.entries {
                if let Some(captures) = entry.pattern.captures(line) {
                    let handlers = entry
                        .handlers
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect();
                    matched.push((captures, handlers));
                    if entry.exclusive {
                        break;
                    }
                }
            }
        }

        if matched.is_empty() {
            tracing::debug!("Unmatched line: {:?}", line);
            return false;
        }

        for (captures, handlers) in &matched {
            for handler in handlers {
                handler(line, captures);
            }
        }
        true
    }

    /// Number of distinct patterns registered
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        let mut list = f.debug_list();
        for entry in &inner.entries {
            list.entry(&(entry.pattern.as_str(), entry.priority, entry.handlers.len()));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmatched_line() {
        let router = LineRouter::new();
        assert!(router.is_empty());
        assert!(!router.route("anything"));
    }

    #[test]
    fn test_same_pattern_merges() {
        let router = LineRouter::new();
        let pattern = Regex::new("^ok$").expect("regex");
        let a = router.register(&pattern, 0, |_, _| {});
        let b = router.register(&pattern, 5, |_, _| {});
        assert_eq!(router.len(), 1);

        assert!(router.unregister(&pattern, a));
        assert!(!router.unregister(&pattern, a));
        assert_eq!(router.len(), 1);
        assert!(router.unregister(&pattern, b));
        assert!(router.is_empty());
    }
}
