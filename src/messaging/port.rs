use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::WorkerError;
use crate::events::{Event, NativeHandler, PayloadKind, SharedEventTarget};

static NEXT_PORT_ID: AtomicU32 = AtomicU32::new(1);

/// One end of a message channel. Messages received before [`start`]
/// (MessagePort::start) queue up in arrival order; afterwards they dispatch
/// immediately to the port's `message` listeners.
#[derive(Clone, Debug)]
pub struct MessagePort {
    inner: Arc<PortInner>,
}

pub(crate) struct PortInner {
    id: u32,
    state: Mutex<PortState>,
    target: SharedEventTarget,
}

impl std::fmt::Debug for PortInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortInner").field("id", &self.id).finish()
    }
}

struct PortState {
    started: bool,
    closed: bool,
    queued: VecDeque<Event>,
    pair: Weak<PortInner>,
}

impl MessagePort {
    pub(crate) fn create_pair() -> (MessagePort, MessagePort) {
        let first = MessagePort::detached();
        let second = MessagePort::detached();
        first.state().pair = Arc::downgrade(&second.inner);
        second.state().pair = Arc::downgrade(&first.inner);
        (first, second)
    }

    fn detached() -> MessagePort {
        MessagePort {
            inner: Arc::new(PortInner {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(PortState {
                    started: false,
                    closed: false,
                    queued: VecDeque::new(),
                    pair: Weak::new(),
                }),
                target: SharedEventTarget::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PortState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn target(&self) -> &SharedEventTarget {
        &self.inner.target
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn same_port(&self, other: &MessagePort) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Post a message to the paired port. Transferred ports ride along inside
    /// the message event.
    pub fn post_message(&self, data: JsonValue, transfer: Vec<MessagePort>) -> Result<(), WorkerError> {
        let pair = self
            .state()
            .pair
            .upgrade()
            .ok_or_else(|| WorkerError::message("this MessagePort does not have a pair to send to"))?;
        let event = Event::message("message", data, transfer);
        MessagePort { inner: pair }.receive_message(event);
        Ok(())
    }

    /// Entry point for messages arriving from the paired port.
    pub(crate) fn receive_message(&self, event: Event) {
        {
            let mut state = self.state();
            if state.closed {
                debug!(target: "messaging", port = self.inner.id, "dropping message sent to a closed port");
                return;
            }
            if !state.started {
                state.queued.push_back(event);
                return;
            }
        }
        self.inner.target.dispatch(&event);
    }

    /// Begin delivering messages, flushing anything queued in arrival order.
    /// Calling start twice is harmless.
    pub fn start(&self) {
        let drained: Vec<Event> = {
            let mut state = self.state();
            if state.started || state.closed {
                return;
            }
            state.started = true;
            state.queued.drain(..).collect()
        };
        for event in drained {
            self.inner.target.dispatch(&event);
        }
    }

    /// Attach a native `message` handler. Mirrors the `onmessage` setter:
    /// assigning a handler implicitly starts the port.
    pub fn on_message(&self, handler: NativeHandler) -> u64 {
        let id = self
            .inner
            .target
            .add_native_listener("message", Some(PayloadKind::Message), handler);
        self.start();
        id
    }

    pub fn close(&self) {
        self.close_local();
        if let Some(pair) = self.state().pair.upgrade() {
            MessagePort { inner: pair }.close_local();
        }
    }

    fn close_local(&self) {
        let mut state = self.state();
        state.started = false;
        state.closed = true;
        state.queued.clear();
    }
}

// Dropping the last reference to a port closes the whole channel, matching
// the behavior scripts observe when a port is garbage collected.
impl Drop for PortInner {
    fn drop(&mut self) {
        let pair = match self.state.lock() {
            Ok(state) => state.pair.upgrade(),
            Err(poisoned) => poisoned.into_inner().pair.upgrade(),
        };
        if let Some(pair) = pair {
            MessagePort { inner: pair }.close_local();
        }
    }
}
