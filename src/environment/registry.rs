//! Tracks which thread owns each live environment. Entries are registered
//! when an environment finishes building and evicted explicitly during
//! teardown; nothing here is cleaned up implicitly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};
use std::thread::ThreadId;

use super::EnvShared;
use crate::engine::ScriptEngine;

pub(crate) struct ActiveEnvironment {
    pub engine: Rc<ScriptEngine>,
    pub shared: Rc<EnvShared>,
}

thread_local! {
    static ACTIVE: RefCell<HashMap<u64, ActiveEnvironment>> = RefCell::new(HashMap::new());
}

fn owners() -> &'static Mutex<HashMap<u64, ThreadId>> {
    static OWNERS: OnceLock<Mutex<HashMap<u64, ThreadId>>> = OnceLock::new();
    OWNERS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn register(env_id: u64, engine: Rc<ScriptEngine>, shared: Rc<EnvShared>) {
    match owners().lock() {
        Ok(mut map) => {
            map.insert(env_id, std::thread::current().id());
        }
        Err(poisoned) => {
            poisoned.into_inner().insert(env_id, std::thread::current().id());
        }
    }
    ACTIVE.with(|active| {
        active
            .borrow_mut()
            .insert(env_id, ActiveEnvironment { engine, shared });
    });
}

pub(crate) fn evict(env_id: u64) {
    match owners().lock() {
        Ok(mut map) => {
            map.remove(&env_id);
        }
        Err(poisoned) => {
            poisoned.into_inner().remove(&env_id);
        }
    }
    ACTIVE.with(|active| {
        active.borrow_mut().remove(&env_id);
    });
}

/// Run `f` against the environment when the calling thread owns it. Returns
/// `None` when the environment lives on another thread (or is gone), in
/// which case the caller must marshal instead.
pub(crate) fn try_with<R>(env_id: u64, f: impl FnOnce(&ScriptEngine, &EnvShared) -> R) -> Option<R> {
    ACTIVE.with(|active| {
        let map = active.borrow();
        map.get(&env_id).map(|entry| f(&entry.engine, &entry.shared))
    })
}

/// Thread-affinity check for operations that must never leave the worker
/// thread. A violation is a fatal usage error in the embedding host.
pub(crate) fn assert_on_owner_thread(env_id: u64, operation: &str) {
    let owner = match owners().lock() {
        Ok(map) => map.get(&env_id).copied(),
        Err(poisoned) => poisoned.into_inner().get(&env_id).copied(),
    };
    if let Some(owner) = owner {
        if owner != std::thread::current().id() {
            panic!("{operation} must run on the thread that owns environment {env_id}");
        }
    }
}
