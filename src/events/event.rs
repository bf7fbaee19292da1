use serde_json::Value as JsonValue;

use crate::fetch::FetchRequest;
use crate::messaging::MessagePort;

/// An event flowing through an [`EventTarget`](super::EventTarget). The
/// payload carries only data that can cross threads; message data is JSON and
/// transferred ports travel as runtime handles rather than JS objects.
#[derive(Clone, Debug)]
pub struct Event {
    name: String,
    payload: EventPayload,
}

#[derive(Clone, Debug)]
pub enum EventPayload {
    /// A bare signal, like `activate` or a custom `dispatchEvent` call.
    None,
    /// A message posted between ports, clients and workers.
    Message {
        data: JsonValue,
        ports: Vec<MessagePort>,
    },
    /// A fetch routed through the worker for interception.
    Fetch(FetchRequest),
}

/// Payload discriminant used by native listeners to declare what they accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    None,
    Message,
    Fetch,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Event {
            name: name.into(),
            payload: EventPayload::None,
        }
    }

    pub fn message(name: impl Into<String>, data: JsonValue, ports: Vec<MessagePort>) -> Self {
        Event {
            name: name.into(),
            payload: EventPayload::Message { data, ports },
        }
    }

    pub fn fetch(request: FetchRequest) -> Self {
        Event {
            name: "fetch".to_string(),
            payload: EventPayload::Fetch(request),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn payload_kind(&self) -> PayloadKind {
        match self.payload {
            EventPayload::None => PayloadKind::None,
            EventPayload::Message { .. } => PayloadKind::Message,
            EventPayload::Fetch(_) => PayloadKind::Fetch,
        }
    }
}
