use std::sync::{Arc, Mutex, MutexGuard};

use url::Url;

use super::worker::ServiceWorker;

/// The four worker slots a registration can hold. A worker occupies at most
/// one slot at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Installing,
    Waiting,
    Active,
    Redundant,
}

impl Slot {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Slot::Installing => "installing",
            Slot::Waiting => "waiting",
            Slot::Active => "active",
            Slot::Redundant => "redundant",
        }
    }
}

#[derive(Default)]
pub(crate) struct Slots {
    pub installing: Option<Arc<ServiceWorker>>,
    pub waiting: Option<Arc<ServiceWorker>>,
    pub active: Option<Arc<ServiceWorker>>,
    pub redundant: Option<Arc<ServiceWorker>>,
}

impl Slots {
    pub fn get(&self, slot: Slot) -> Option<&Arc<ServiceWorker>> {
        match slot {
            Slot::Installing => self.installing.as_ref(),
            Slot::Waiting => self.waiting.as_ref(),
            Slot::Active => self.active.as_ref(),
            Slot::Redundant => self.redundant.as_ref(),
        }
    }

    pub fn set(&mut self, slot: Slot, worker: Option<Arc<ServiceWorker>>) {
        match slot {
            Slot::Installing => self.installing = worker,
            Slot::Waiting => self.waiting = worker,
            Slot::Active => self.active = worker,
            Slot::Redundant => self.redundant = worker,
        }
    }
}

/// A scope and the worker versions currently associated with it. In-memory
/// slot contents always mirror the `registrations` row; changes go through
/// [`RegistrationFactory`](super::RegistrationFactory) so both stay in step.
pub struct ServiceWorkerRegistration {
    id: String,
    scope: Url,
    pub(crate) slots: Mutex<Slots>,
}

impl ServiceWorkerRegistration {
    pub(crate) fn new(id: String, scope: Url) -> Arc<Self> {
        Arc::new(ServiceWorkerRegistration {
            id,
            scope,
            slots: Mutex::new(Slots::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub(crate) fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn worker_in(&self, slot: Slot) -> Option<Arc<ServiceWorker>> {
        self.lock_slots().get(slot).cloned()
    }

    pub fn installing(&self) -> Option<Arc<ServiceWorker>> {
        self.worker_in(Slot::Installing)
    }

    pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.worker_in(Slot::Waiting)
    }

    pub fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.worker_in(Slot::Active)
    }

    pub fn redundant(&self) -> Option<Arc<ServiceWorker>> {
        self.worker_in(Slot::Redundant)
    }
}

impl std::fmt::Debug for ServiceWorkerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerRegistration")
            .field("id", &self.id)
            .field("scope", &self.scope.as_str())
            .finish()
    }
}
