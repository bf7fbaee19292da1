use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Value as JsonValue};
use url::Url;

use super::delegate::{ClientCallback, ClientHandle, ClientType, WindowClientHandle};
use crate::messaging::MessagePort;

/// Runtime-side proxy for a host client. Scripts only ever see the JSON
/// descriptor; the proxy pins the host handle so `postMessage` keeps working
/// for as long as any environment still references the client.
pub struct Client {
    handle: Arc<dyn ClientHandle>,
}

impl Client {
    fn new(handle: Arc<dyn ClientHandle>) -> Arc<Self> {
        Arc::new(Client { handle })
    }

    pub fn id(&self) -> String {
        self.handle.client_id()
    }

    pub fn client_type(&self) -> ClientType {
        self.handle.client_type()
    }

    pub fn url(&self) -> Url {
        self.handle.url()
    }

    pub fn post_message(&self, data: JsonValue, ports: Vec<MessagePort>) {
        self.handle.post_message(data, ports);
    }

    pub fn window(&self) -> Option<&dyn WindowClientHandle> {
        self.handle.as_window()
    }

    pub fn focus(&self, done: ClientCallback) {
        match self.handle.as_window() {
            Some(window) => window.focus(done),
            None => done(Err(crate::error::WorkerError::message(
                "focus() is only available on window clients",
            ))),
        }
    }

    pub fn navigate(&self, url: &Url, done: ClientCallback) {
        match self.handle.as_window() {
            Some(window) => window.navigate(url, done),
            None => done(Err(crate::error::WorkerError::message(
                "navigate() is only available on window clients",
            ))),
        }
    }

    /// JSON shape handed to scripts when this client crosses into an
    /// environment.
    pub fn descriptor(&self) -> JsonValue {
        let mut descriptor = json!({
            "id": self.id(),
            "type": self.client_type().as_str(),
            "url": self.url().as_str(),
        });
        if let Some(window) = self.handle.as_window() {
            descriptor["focused"] = json!(window.focused());
            descriptor["visibilityState"] = json!(window.visibility_state().as_str());
        }
        descriptor
    }
}

/// Keeps client proxies referentially stable: the same host client id always
/// maps to the same [`Client`] while anything still holds it. Dead entries
/// are swept on each lookup.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Weak<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry::default()
    }

    pub fn get_or_create(&self, handle: Arc<dyn ClientHandle>) -> Arc<Client> {
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients.retain(|_, weak| weak.strong_count() > 0);
        let id = handle.client_id();
        if let Some(existing) = clients.get(&id).and_then(Weak::upgrade) {
            return existing;
        }
        let client = Client::new(handle);
        clients.insert(id, Arc::downgrade(&client));
        client
    }

    pub fn lookup(&self, client_id: &str) -> Option<Arc<Client>> {
        let clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients.get(client_id).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::VisibilityState;

    struct FakeClient {
        id: String,
    }

    impl ClientHandle for FakeClient {
        fn client_id(&self) -> String {
            self.id.clone()
        }

        fn client_type(&self) -> ClientType {
            ClientType::Window
        }

        fn url(&self) -> Url {
            Url::parse("https://example.com/page.html").unwrap()
        }

        fn post_message(&self, _data: JsonValue, _ports: Vec<MessagePort>) {}

        fn as_window(&self) -> Option<&dyn WindowClientHandle> {
            Some(self)
        }
    }

    impl WindowClientHandle for FakeClient {
        fn focused(&self) -> bool {
            true
        }

        fn visibility_state(&self) -> VisibilityState {
            VisibilityState::Visible
        }

        fn focus(&self, done: ClientCallback) {
            done(Ok(None));
        }

        fn navigate(&self, _url: &Url, done: ClientCallback) {
            done(Ok(None));
        }
    }

    #[test]
    fn same_id_resolves_to_same_proxy() {
        let registry = ClientRegistry::new();
        let first = registry.get_or_create(Arc::new(FakeClient { id: "c1".into() }));
        let second = registry.get_or_create(Arc::new(FakeClient { id: "c1".into() }));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn dropped_proxies_are_recreated() {
        let registry = ClientRegistry::new();
        let first = registry.get_or_create(Arc::new(FakeClient { id: "c1".into() }));
        drop(first);
        assert!(registry.lookup("c1").is_none());
        let again = registry.get_or_create(Arc::new(FakeClient { id: "c1".into() }));
        assert_eq!(again.id(), "c1");
    }

    #[test]
    fn window_fields_appear_in_descriptor() {
        let registry = ClientRegistry::new();
        let client = registry.get_or_create(Arc::new(FakeClient { id: "c1".into() }));
        let descriptor = client.descriptor();
        assert_eq!(descriptor["type"], "window");
        assert_eq!(descriptor["focused"], true);
        assert_eq!(descriptor["visibilityState"], "visible");
    }
}
