use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::WorkerError;
use crate::lifecycle::ServiceWorker;
use crate::messaging::MessagePort;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientType {
    Window,
    Worker,
    SharedWorker,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Window => "window",
            ClientType::Worker => "worker",
            ClientType::SharedWorker => "sharedworker",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

impl VisibilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityState::Hidden => "hidden",
            VisibilityState::Visible => "visible",
        }
    }
}

/// A document or worker context controlled by (or visible to) a service
/// worker. The host owns the real thing; the runtime only ever holds it
/// behind this trait.
pub trait ClientHandle: Send + Sync {
    fn client_id(&self) -> String;
    fn client_type(&self) -> ClientType;
    fn url(&self) -> Url;
    fn post_message(&self, data: JsonValue, ports: Vec<MessagePort>);

    fn as_window(&self) -> Option<&dyn WindowClientHandle> {
        None
    }
}

pub type ClientCallback = Box<dyn FnOnce(Result<Option<Arc<dyn ClientHandle>>, WorkerError>) + Send>;
pub type ClientListCallback = Box<dyn FnOnce(Result<Vec<Arc<dyn ClientHandle>>, WorkerError>) + Send>;
pub type ClaimCallback = Box<dyn FnOnce(Result<(), WorkerError>) + Send>;

/// Window-specific surface on top of [`ClientHandle`].
pub trait WindowClientHandle: ClientHandle {
    fn focused(&self) -> bool;
    fn visibility_state(&self) -> VisibilityState;
    /// Bring the window to the foreground, resolving with its updated state.
    fn focus(&self, done: ClientCallback);
    /// Navigate the window, resolving with its updated state.
    fn navigate(&self, url: &Url, done: ClientCallback);
}

/// Options accepted by `clients.matchAll()`. Unspecified fields take the
/// defaults scripts expect: every client type, controlled clients only.
#[derive(Clone, Debug, Deserialize)]
pub struct MatchAllOptions {
    #[serde(rename = "type", default = "default_client_type")]
    pub client_type: String,
    #[serde(rename = "includeUncontrolled", default)]
    pub include_uncontrolled: bool,
}

fn default_client_type() -> String {
    "all".to_string()
}

impl Default for MatchAllOptions {
    fn default() -> Self {
        MatchAllOptions {
            client_type: default_client_type(),
            include_uncontrolled: false,
        }
    }
}

/// Host-side implementation of the `clients` global. Every method has a
/// rejecting default so embedders only implement what their app surface
/// actually supports.
#[allow(unused_variables)]
pub trait ClientsDelegate: Send + Sync {
    fn get(&self, worker: &ServiceWorker, client_id: &str, done: ClientCallback) {
        done(Err(WorkerError::DelegateUnimplemented("clients.get")));
    }

    fn match_all(&self, worker: &ServiceWorker, options: MatchAllOptions, done: ClientListCallback) {
        done(Err(WorkerError::DelegateUnimplemented("clients.matchAll")));
    }

    fn open_window(&self, worker: &ServiceWorker, url: &Url, done: ClientCallback) {
        done(Err(WorkerError::DelegateUnimplemented("clients.openWindow")));
    }

    fn claim(&self, worker: &ServiceWorker, done: ClaimCallback) {
        done(Err(WorkerError::DelegateUnimplemented("clients.claim")));
    }
}

/// Delegate used when the host wires nothing up.
pub struct NullClients;

impl ClientsDelegate for NullClients {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_all_options_default_sensibly() {
        let options: MatchAllOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.client_type, "all");
        assert!(!options.include_uncontrolled);

        let options: MatchAllOptions =
            serde_json::from_str(r#"{"type": "window", "includeUncontrolled": true}"#).unwrap();
        assert_eq!(options.client_type, "window");
        assert!(options.include_uncontrolled);
    }
}
