use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::event::{Event, PayloadKind};
use crate::environment::EnvironmentHandle;

/// A script listener: a function held in the listener table of the
/// environment that registered it, addressed by key. Invoking it marshals the
/// event onto the owning worker thread (or runs inline when already there).
#[derive(Clone)]
pub struct ScriptCallback {
    pub(crate) env: EnvironmentHandle,
    pub(crate) key: u32,
}

impl ScriptCallback {
    pub(crate) fn new(env: EnvironmentHandle, key: u32) -> Self {
        ScriptCallback { env, key }
    }

    fn invoke(&self, event: &Event) {
        if let Err(error) = self.env.invoke_listener_blocking(self.key, event) {
            warn!(target: "events", %error, event = event.name(), "script listener raised");
        }
    }
}

pub type NativeHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A listener is either a script function or a native closure. Native
/// listeners may declare the payload kind they accept; mismatched events are
/// skipped with a warning instead of being delivered.
#[derive(Clone)]
pub enum ListenerKind {
    Script(ScriptCallback),
    Native {
        id: u64,
        accepts: Option<PayloadKind>,
        handler: NativeHandler,
    },
}

struct Registered {
    name: String,
    kind: ListenerKind,
}

static NEXT_NATIVE_ID: AtomicU64 = AtomicU64::new(1);

/// Ordered listener registry. Listeners fire in registration order and a
/// duplicate registration of the same script function for the same event name
/// is ignored.
#[derive(Default)]
pub struct EventTarget {
    listeners: Vec<Registered>,
}

impl EventTarget {
    pub fn new() -> Self {
        EventTarget::default()
    }

    /// Returns false when the (name, function) pair was already registered.
    pub fn add_script_listener(&mut self, name: &str, callback: ScriptCallback) -> bool {
        let duplicate = self.listeners.iter().any(|registered| {
            registered.name == name
                && matches!(&registered.kind, ListenerKind::Script(existing)
                    if existing.key == callback.key && existing.env.id() == callback.env.id())
        });
        if duplicate {
            return false;
        }
        self.listeners.push(Registered {
            name: name.to_string(),
            kind: ListenerKind::Script(callback),
        });
        true
    }

    pub fn remove_script_listener(&mut self, name: &str, env_id: u64, key: u32) {
        let position = self.listeners.iter().position(|registered| {
            registered.name == name
                && matches!(&registered.kind, ListenerKind::Script(existing)
                    if existing.key == key && existing.env.id() == env_id)
        });
        match position {
            Some(index) => {
                self.listeners.remove(index);
            }
            None => {
                warn!(target: "events", event = name, "tried to remove a listener that doesn't exist");
            }
        }
    }

    pub fn add_native_listener(
        &mut self,
        name: &str,
        accepts: Option<PayloadKind>,
        handler: NativeHandler,
    ) -> u64 {
        let id = NEXT_NATIVE_ID.fetch_add(1, Ordering::Relaxed);
        self.listeners.push(Registered {
            name: name.to_string(),
            kind: ListenerKind::Native {
                id,
                accepts,
                handler,
            },
        });
        id
    }

    pub fn remove_native_listener(&mut self, name: &str, id: u64) {
        let position = self.listeners.iter().position(|registered| {
            registered.name == name
                && matches!(&registered.kind, ListenerKind::Native { id: existing, .. } if *existing == id)
        });
        match position {
            Some(index) => {
                self.listeners.remove(index);
            }
            None => {
                warn!(target: "events", event = name, "tried to remove a listener that doesn't exist");
            }
        }
    }

    /// Snapshot of the listeners registered for `name`, in registration
    /// order. Dispatch runs on the snapshot so listeners may add or remove
    /// others without affecting the in-flight event.
    pub fn matching(&self, name: &str) -> Vec<ListenerKind> {
        self.listeners
            .iter()
            .filter(|registered| registered.name == name)
            .map(|registered| registered.kind.clone())
            .collect()
    }

    pub fn has_listener(&self, name: &str) -> bool {
        self.listeners.iter().any(|registered| registered.name == name)
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

/// Thread-safe wrapper around an [`EventTarget`]. Dispatch snapshots the
/// matching listeners and releases the lock before invoking any of them, so a
/// listener can freely touch the same target.
#[derive(Clone, Default)]
pub struct SharedEventTarget {
    inner: Arc<Mutex<EventTarget>>,
}

impl SharedEventTarget {
    pub fn new() -> Self {
        SharedEventTarget::default()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut EventTarget) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn add_script_listener(&self, name: &str, callback: ScriptCallback) -> bool {
        self.with_inner(|target| target.add_script_listener(name, callback))
    }

    pub fn remove_script_listener(&self, name: &str, env_id: u64, key: u32) {
        self.with_inner(|target| target.remove_script_listener(name, env_id, key));
    }

    pub fn add_native_listener(
        &self,
        name: &str,
        accepts: Option<PayloadKind>,
        handler: NativeHandler,
    ) -> u64 {
        self.with_inner(|target| target.add_native_listener(name, accepts, handler))
    }

    pub fn remove_native_listener(&self, name: &str, id: u64) {
        self.with_inner(|target| target.remove_native_listener(name, id));
    }

    pub fn matching(&self, name: &str) -> Vec<ListenerKind> {
        self.with_inner(|target| target.matching(name))
    }

    pub fn has_listener(&self, name: &str) -> bool {
        self.with_inner(|target| target.has_listener(name))
    }

    pub fn clear(&self) {
        self.with_inner(|target| target.clear());
    }

    /// Deliver `event` to every matching listener in registration order.
    /// Script listeners run on their owning worker thread; native listeners
    /// run here with panics contained to the offending listener.
    pub fn dispatch(&self, event: &Event) {
        for kind in self.matching(event.name()) {
            match kind {
                ListenerKind::Script(callback) => callback.invoke(event),
                ListenerKind::Native {
                    accepts, handler, ..
                } => invoke_native(&handler, accepts, event),
            }
        }
    }
}

pub(crate) fn invoke_native(handler: &NativeHandler, accepts: Option<PayloadKind>, event: &Event) {
    if let Some(kind) = accepts {
        if kind != event.payload_kind() {
            warn!(
                target: "events",
                event = event.name(),
                "native listener skipped: event payload does not match the type it accepts"
            );
            return;
        }
    }
    let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
    if outcome.is_err() {
        warn!(target: "events", event = event.name(), "native listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> NativeHandler {
        Arc::new(move |_event: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let target = SharedEventTarget::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            target.add_native_listener(
                "ping",
                None,
                Arc::new(move |_event| order.lock().unwrap().push(label)),
            );
        }
        target.dispatch(&Event::new("ping"));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn only_matching_names_fire() {
        let target = SharedEventTarget::new();
        let counter = Arc::new(AtomicUsize::new(0));
        target.add_native_listener("install", None, counting_handler(Arc::clone(&counter)));
        target.dispatch(&Event::new("activate"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        target.dispatch(&Event::new("install"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn payload_mismatch_is_skipped() {
        let target = SharedEventTarget::new();
        let counter = Arc::new(AtomicUsize::new(0));
        target.add_native_listener(
            "message",
            Some(PayloadKind::Message),
            counting_handler(Arc::clone(&counter)),
        );
        target.dispatch(&Event::new("message"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        target.dispatch(&Event::message("message", serde_json::json!("hi"), Vec::new()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_missing_listener_is_a_noop() {
        let target = SharedEventTarget::new();
        target.remove_native_listener("message", 9999);
        target.dispatch(&Event::new("message"));
    }

    #[test]
    fn removed_listener_no_longer_fires() {
        let target = SharedEventTarget::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = target.add_native_listener("ping", None, counting_handler(Arc::clone(&counter)));
        target.dispatch(&Event::new("ping"));
        target.remove_native_listener("ping", id);
        target.dispatch(&Event::new("ping"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let target = SharedEventTarget::new();
        let counter = Arc::new(AtomicUsize::new(0));
        target.add_native_listener("ping", None, Arc::new(|_event| panic!("listener bug")));
        target.add_native_listener("ping", None, counting_handler(Arc::clone(&counter)));
        target.dispatch(&Event::new("ping"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
