//! Ordered message listeners.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::stream::proto::Message;

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Box<dyn FnMut(&Message) -> Result<(), ListenerError> + Send>;

/// Listener that failed while handling one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerFailure {
    /// Registration index of the listener.
    pub listener: usize,
    /// Whether the listener returned an error or panicked.
    pub kind: ListenerFailureKind,
    /// The returned error's message, or the panic payload when it is a string.
    pub detail: String,
}

/// How a listener failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerFailureKind {
    /// The listener returned `Err`.
    Error,
    /// The listener panicked; the panic was caught and later listeners still ran.
    Panic,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ListenerFailureKind::Error => "failed",
            ListenerFailureKind::Panic => "panicked",
        };
        write!(f, "listener #{} {kind}: {}", self.listener, self.detail)
    }
}

/// Callbacks invoked for every message, in registration order.
///
/// The same closure logic may be registered more than once; each
/// registration is invoked.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Callback>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener and returns its registration index.
    pub fn register<F>(&mut self, listener: F) -> usize
    where
        F: FnMut(&Message) -> Result<(), ListenerError> + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
        self.listeners.len() - 1
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: FnMut(&Message) -> Result<(), ListenerError> + Send + 'static,
    {
        self.register(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Invokes every listener with `message`.
    ///
    /// A listener that returns an error or panics does not prevent later
    /// listeners from running; its failure is returned instead.
    pub fn dispatch(&mut self, message: &Message) -> Vec<ListenerFailure> {
        let mut failures = Vec::new();
        for (index, listener) in self.listeners.iter_mut().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(ListenerFailure {
                    listener: index,
                    kind: ListenerFailureKind::Error,
                    detail: err.to_string(),
                }),
                Err(payload) => failures.push(ListenerFailure {
                    listener: index,
                    kind: ListenerFailureKind::Panic,
                    detail: panic_detail(payload.as_ref()),
                }),
            }
        }
        failures
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{ListenerError, ListenerFailureKind, ListenerRegistry};
    use crate::stream::proto::Message;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl FnMut(&Message) -> Result<(), ListenerError> + Send + 'static {
        let log = Arc::clone(log);
        move |message| {
            log.lock()
                .expect("log lock")
                .push(format!("{tag}:{}", message.value()));
            Ok(())
        }
    }

    #[test]
    fn dispatch_follows_registration_order_and_allows_duplicates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.register(recorder(&log, "a"));
        registry.register(recorder(&log, "b"));
        registry.register(recorder(&log, "a"));

        let failures = registry.dispatch(&Message::new(json!(1)));

        assert!(failures.is_empty());
        assert_eq!(*log.lock().expect("log lock"), vec!["a:1", "b:1", "a:1"]);
    }

    #[test]
    fn failing_listener_does_not_stop_later_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new()
            .with_listener(|_| Err("boom".into()))
            .with_listener(|_| panic!("listener exploded"))
            .with_listener(recorder(&log, "last"));

        let failures = registry.dispatch(&Message::new(json!({"id": 7})));

        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].listener, 0);
        assert_eq!(failures[0].kind, ListenerFailureKind::Error);
        assert_eq!(failures[0].detail, "boom");
        assert_eq!(failures[1].listener, 1);
        assert_eq!(failures[1].kind, ListenerFailureKind::Panic);
        assert_eq!(failures[1].detail, "listener exploded");
        assert_eq!(failures[1].to_string(), "listener #1 panicked: listener exploded");
        assert_eq!(*log.lock().expect("log lock"), vec![r#"last:{"id":7}"#]);
    }

    #[test]
    fn empty_registry_dispatches_nothing() {
        let mut registry = ListenerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.dispatch(&Message::new(json!(null))).is_empty());
    }
}
