use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::WorkerError;
use crate::fetch::{FetchRequest, FetchResponse};
use crate::lifecycle::ServiceWorker;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CacheMatchOptions {
    #[serde(rename = "ignoreSearch", default)]
    pub ignore_search: bool,
    #[serde(rename = "ignoreMethod", default)]
    pub ignore_method: bool,
    #[serde(rename = "ignoreVary", default)]
    pub ignore_vary: bool,
    #[serde(rename = "cacheName", default)]
    pub cache_name: Option<String>,
}

pub type CacheCallback = Box<dyn FnOnce(Result<JsonValue, WorkerError>) + Send>;

/// Backend for the `caches` global and the caches it opens. Results flow
/// back as JSON: responses serialize to the same shape [`FetchResponse`]
/// uses, `keys()` to arrays of names or requests. Every operation rejects by
/// default so hosts opt in per method.
#[allow(unused_variables)]
pub trait CacheProvider: Send + Sync {
    fn match_request(
        &self,
        worker: &ServiceWorker,
        request: FetchRequest,
        options: CacheMatchOptions,
        done: CacheCallback,
    ) {
        done(Err(WorkerError::DelegateUnimplemented("caches.match")));
    }

    fn has(&self, worker: &ServiceWorker, cache_name: &str, done: CacheCallback) {
        done(Err(WorkerError::DelegateUnimplemented("caches.has")));
    }

    fn open(&self, worker: &ServiceWorker, cache_name: &str, done: CacheCallback) {
        done(Err(WorkerError::DelegateUnimplemented("caches.open")));
    }

    fn delete(&self, worker: &ServiceWorker, cache_name: &str, done: CacheCallback) {
        done(Err(WorkerError::DelegateUnimplemented("caches.delete")));
    }

    fn keys(&self, worker: &ServiceWorker, done: CacheCallback) {
        done(Err(WorkerError::DelegateUnimplemented("caches.keys")));
    }

    fn cache_match(
        &self,
        worker: &ServiceWorker,
        cache_name: &str,
        request: FetchRequest,
        options: CacheMatchOptions,
        done: CacheCallback,
    ) {
        done(Err(WorkerError::DelegateUnimplemented("cache.match")));
    }

    fn cache_put(
        &self,
        worker: &ServiceWorker,
        cache_name: &str,
        request: FetchRequest,
        response: FetchResponse,
        done: CacheCallback,
    ) {
        done(Err(WorkerError::DelegateUnimplemented("cache.put")));
    }

    fn cache_delete(
        &self,
        worker: &ServiceWorker,
        cache_name: &str,
        request: FetchRequest,
        options: CacheMatchOptions,
        done: CacheCallback,
    ) {
        done(Err(WorkerError::DelegateUnimplemented("cache.delete")));
    }

    fn cache_keys(&self, worker: &ServiceWorker, cache_name: &str, done: CacheCallback) {
        done(Err(WorkerError::DelegateUnimplemented("cache.keys")));
    }
}
