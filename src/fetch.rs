use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::WorkerError;
use crate::lifecycle::ServiceWorker;

/// Request shape shared between `fetch()` calls made by scripts and fetch
/// events dispatched into them. Bodies are carried as text; binary transfer
/// is out of scope for the embedded runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: Url,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        FetchRequest {
            url,
            method: default_method(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl FetchResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        FetchResponse {
            status: 200,
            headers: HashMap::new(),
            body: Some(body.into()),
        }
    }
}

pub type FetchCallback = Box<dyn FnOnce(Result<FetchResponse, WorkerError>) + Send>;

/// Performs network fetches on behalf of worker scripts. The runtime never
/// talks to the network itself; the host decides how requests are satisfied.
pub trait FetchDelegate: Send + Sync {
    fn fetch(&self, worker: &ServiceWorker, request: FetchRequest, done: FetchCallback);
}

/// Default delegate handed to environments whose host has not wired up
/// networking. Every request rejects.
pub struct NullFetch;

impl FetchDelegate for NullFetch {
    fn fetch(&self, _worker: &ServiceWorker, _request: FetchRequest, done: FetchCallback) {
        done(Err(WorkerError::DelegateUnimplemented("fetch")));
    }
}

pub type ImportCallback = Box<dyn FnOnce(Result<String, WorkerError>) + Send>;

/// Loads script content for `importScripts`. The worker thread stays frozen
/// until the callback fires, so implementations must always call it.
pub trait ImportDelegate: Send + Sync {
    fn import_script(&self, worker: &ServiceWorker, url: &Url, done: ImportCallback);
}

pub struct NullImport;

impl ImportDelegate for NullImport {
    fn import_script(&self, _worker: &ServiceWorker, _url: &Url, done: ImportCallback) {
        done(Err(WorkerError::DelegateUnimplemented("importScripts")));
    }
}
