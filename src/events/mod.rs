mod event;
mod target;

pub use event::{Event, EventPayload, PayloadKind};
pub use target::{EventTarget, ListenerKind, NativeHandler, ScriptCallback, SharedEventTarget};

pub(crate) use target::invoke_native;
