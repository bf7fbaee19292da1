use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::registration::{ServiceWorkerRegistration, Slot};
use super::worker::{ServiceWorker, WorkerState};
use crate::error::WorkerError;
use crate::storage::{CoreStorage, WorkerRow};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Hands out [`ServiceWorker`] instances, one per worker id. Live instances
/// are cached weakly so two lookups racing on the same id resolve to the same
/// `Arc` and in-memory state never forks.
pub struct WorkerFactory {
    storage: Arc<CoreStorage>,
    cache: Mutex<HashMap<String, Weak<ServiceWorker>>>,
}

impl WorkerFactory {
    pub fn new(storage: Arc<CoreStorage>) -> Self {
        WorkerFactory {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, url: &Url, registration_id: &str) -> Result<Arc<ServiceWorker>, WorkerError> {
        let mut cache = lock(&self.cache);
        let id = Uuid::new_v4().to_string();
        self.storage.insert_worker(&WorkerRow {
            worker_id: id.clone(),
            registration_id: registration_id.to_string(),
            url: url.as_str().to_string(),
            install_state: WorkerState::Parsed.as_str().to_string(),
            skip_waiting: false,
        })?;
        let worker = ServiceWorker::new(
            id.clone(),
            url.clone(),
            registration_id.to_string(),
            WorkerState::Parsed,
            false,
        );
        cache.insert(id, Arc::downgrade(&worker));
        debug!(target: "lifecycle", worker = worker.id(), url = url.as_str(), "created worker");
        Ok(worker)
    }

    pub fn get(&self, worker_id: &str) -> Result<Option<Arc<ServiceWorker>>, WorkerError> {
        let mut cache = lock(&self.cache);
        if let Some(existing) = cache.get(worker_id).and_then(Weak::upgrade) {
            return Ok(Some(existing));
        }
        let Some(row) = self.storage.load_worker(worker_id)? else {
            return Ok(None);
        };
        let worker = ServiceWorker::new(
            row.worker_id.clone(),
            Url::parse(&row.url)?,
            row.registration_id,
            WorkerState::parse(&row.install_state)?,
            row.skip_waiting,
        );
        cache.insert(row.worker_id, Arc::downgrade(&worker));
        Ok(Some(worker))
    }

    /// Persist and apply an install-state transition.
    pub fn update_state(&self, worker: &ServiceWorker, state: WorkerState) -> Result<(), WorkerError> {
        let mut current = worker.lock_state();
        self.storage.update_worker_state(worker.id(), state.as_str())?;
        *current = state;
        Ok(())
    }

    pub fn set_skip_waiting(&self, worker: &ServiceWorker, value: bool) -> Result<(), WorkerError> {
        self.storage.update_worker_skip_waiting(worker.id(), value)?;
        worker.set_skip_waiting_in_memory(value);
        Ok(())
    }

    fn evict(&self, worker_id: &str) {
        lock(&self.cache).remove(worker_id);
    }
}

/// Hands out [`ServiceWorkerRegistration`] instances and performs every slot
/// mutation, keeping the sqlite rows and the in-memory slots in step.
pub struct RegistrationFactory {
    storage: Arc<CoreStorage>,
    workers: WorkerFactory,
    cache: Mutex<HashMap<String, Weak<ServiceWorkerRegistration>>>,
}

impl RegistrationFactory {
    pub fn new(storage: Arc<CoreStorage>) -> Self {
        RegistrationFactory {
            workers: WorkerFactory::new(Arc::clone(&storage)),
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn workers(&self) -> &WorkerFactory {
        &self.workers
    }

    pub fn create(&self, scope: &Url) -> Result<Arc<ServiceWorkerRegistration>, WorkerError> {
        if self.storage.find_registration_by_scope(scope.as_str())?.is_some() {
            return Err(WorkerError::Message(format!(
                "a registration already exists for scope {scope}"
            )));
        }
        let mut cache = lock(&self.cache);
        let id = Uuid::new_v4().to_string();
        self.storage.insert_registration(&id, scope.as_str())?;
        let registration = ServiceWorkerRegistration::new(id.clone(), scope.clone());
        cache.insert(id, Arc::downgrade(&registration));
        debug!(target: "lifecycle", registration = registration.id(), scope = scope.as_str(), "created registration");
        Ok(registration)
    }

    pub fn get_by_id(&self, registration_id: &str) -> Result<Option<Arc<ServiceWorkerRegistration>>, WorkerError> {
        let mut cache = lock(&self.cache);
        if let Some(existing) = cache.get(registration_id).and_then(Weak::upgrade) {
            return Ok(Some(existing));
        }
        let Some(row) = self.storage.load_registration(registration_id)? else {
            return Ok(None);
        };
        let registration = ServiceWorkerRegistration::new(row.registration_id.clone(), Url::parse(&row.scope)?);
        {
            let mut slots = registration.lock_slots();
            for (slot, worker_id) in [
                (Slot::Installing, &row.installing),
                (Slot::Waiting, &row.waiting),
                (Slot::Active, &row.active),
                (Slot::Redundant, &row.redundant),
            ] {
                if let Some(worker_id) = worker_id {
                    match self.workers.get(worker_id)? {
                        Some(worker) => slots.set(slot, Some(worker)),
                        None => warn!(
                            target: "lifecycle",
                            registration = row.registration_id,
                            worker = worker_id,
                            "slot references a worker row that no longer exists"
                        ),
                    }
                }
            }
        }
        cache.insert(row.registration_id, Arc::downgrade(&registration));
        Ok(Some(registration))
    }

    pub fn get_by_scope(&self, scope: &Url) -> Result<Option<Arc<ServiceWorkerRegistration>>, WorkerError> {
        match self.storage.find_registration_by_scope(scope.as_str())? {
            Some(id) => self.get_by_id(&id),
            None => Ok(None),
        }
    }

    /// Registration controlling the given page, by longest scope prefix.
    pub fn get_for_page_url(&self, page_url: &Url) -> Result<Option<Arc<ServiceWorkerRegistration>>, WorkerError> {
        match self.storage.find_registration_for_page(page_url.as_str())? {
            Some(id) => self.get_by_id(&id),
            None => Ok(None),
        }
    }

    pub fn get_all_within_origin(&self, origin: &Url) -> Result<Vec<Arc<ServiceWorkerRegistration>>, WorkerError> {
        let mut root = origin.clone();
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        let ids = self.storage.registration_ids_with_scope_prefix(root.as_str())?;
        let mut registrations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(registration) = self.get_by_id(&id)? {
                registrations.push(registration);
            }
        }
        Ok(registrations)
    }

    /// The registration a page should consider "ready": the longest matching
    /// scope whose active worker has fully activated.
    pub fn get_ready_registration(&self, page_url: &Url) -> Result<Option<Arc<ServiceWorkerRegistration>>, WorkerError> {
        match self.storage.ready_registration_id(page_url.as_str())? {
            Some(id) => self.get_by_id(&id),
            None => Ok(None),
        }
    }

    /// Put `worker` into `slot`. A different worker already occupying the
    /// slot is demoted to redundant in the same transaction.
    pub fn set_worker_slot(
        &self,
        registration: &Arc<ServiceWorkerRegistration>,
        slot: Slot,
        worker: &Arc<ServiceWorker>,
    ) -> Result<(), WorkerError> {
        let mut slots = registration.lock_slots();
        let displaced = slots
            .get(slot)
            .filter(|current| current.id() != worker.id())
            .cloned();
        let demote = match (&displaced, slot) {
            (Some(old), s) if s != Slot::Redundant => Some(old.id().to_string()),
            _ => None,
        };
        self.storage.move_worker_into_slot(
            registration.id(),
            slot.column(),
            Some(worker.id()),
            demote.as_deref(),
            None,
        )?;
        slots.set(slot, Some(Arc::clone(worker)));
        if let Some(old) = displaced {
            if slot != Slot::Redundant {
                *old.lock_state() = WorkerState::Redundant;
                slots.set(Slot::Redundant, Some(old));
            }
        }
        Ok(())
    }

    /// Empty `slot` without touching the worker that was in it. Used when a
    /// worker moves forward through the lifecycle (installing to waiting,
    /// waiting to active).
    pub fn clear_worker_slot(
        &self,
        registration: &Arc<ServiceWorkerRegistration>,
        slot: Slot,
    ) -> Result<(), WorkerError> {
        let mut slots = registration.lock_slots();
        self.storage
            .move_worker_into_slot(registration.id(), slot.column(), None, None, None)?;
        slots.set(slot, None);
        Ok(())
    }

    /// Create a fresh worker for `url` and place it in the installing slot.
    pub fn create_installing_worker(
        &self,
        url: &Url,
        registration: &Arc<ServiceWorkerRegistration>,
    ) -> Result<Arc<ServiceWorker>, WorkerError> {
        let worker = self.workers.create(url, registration.id())?;
        self.workers.update_state(&worker, WorkerState::Installing)?;
        self.set_worker_slot(registration, Slot::Installing, &worker)?;
        Ok(worker)
    }

    /// Throw away the installing worker after a failed install. Unlike a
    /// demotion this deletes the worker row outright; a version that never
    /// installed leaves nothing behind.
    pub fn clear_installing_worker(
        &self,
        registration: &Arc<ServiceWorkerRegistration>,
    ) -> Result<(), WorkerError> {
        let mut slots = registration.lock_slots();
        let Some(worker) = slots.get(Slot::Installing).cloned() else {
            return Err(WorkerError::message(
                "cannot clear the installing worker when there is none",
            ));
        };
        self.storage.move_worker_into_slot(
            registration.id(),
            Slot::Installing.column(),
            None,
            None,
            Some(worker.id()),
        )?;
        slots.set(Slot::Installing, None);
        drop(slots);
        *worker.lock_state() = WorkerState::Redundant;
        self.workers.evict(worker.id());
        Ok(())
    }

    pub fn delete(&self, registration: &Arc<ServiceWorkerRegistration>) -> Result<(), WorkerError> {
        {
            let slots = registration.lock_slots();
            for slot in [Slot::Installing, Slot::Waiting, Slot::Active, Slot::Redundant] {
                if let Some(worker) = slots.get(slot) {
                    self.workers.evict(worker.id());
                }
            }
        }
        self.storage.delete_registration(registration.id())?;
        lock(&self.cache).remove(registration.id());
        Ok(())
    }
}
