use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use url::Url;

use crate::environment::{EnvironmentHandle, ExecutionEnvironment, ReturnKind, WorkerHooks};
use crate::error::WorkerError;
use crate::io::IoPool;

/// Install lifecycle of a single worker version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        }
    }

    pub fn parse(text: &str) -> Result<Self, WorkerError> {
        match text {
            "parsed" => Ok(WorkerState::Parsed),
            "installing" => Ok(WorkerState::Installing),
            "installed" => Ok(WorkerState::Installed),
            "activating" => Ok(WorkerState::Activating),
            "activated" => Ok(WorkerState::Activated),
            "redundant" => Ok(WorkerState::Redundant),
            other => Err(WorkerError::Message(format!("unknown worker state: {other}"))),
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One version of a service worker script. The execution environment behind
/// it is created lazily on first use and torn down when the worker is
/// dropped.
pub struct ServiceWorker {
    id: String,
    url: Url,
    registration_id: String,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    environment: Mutex<Option<EnvironmentHandle>>,
}

impl ServiceWorker {
    pub(crate) fn new(
        id: String,
        url: Url,
        registration_id: String,
        state: WorkerState,
        skip_waiting: bool,
    ) -> Arc<Self> {
        Arc::new(ServiceWorker {
            id,
            url,
            registration_id,
            state: Mutex::new(state),
            skip_waiting: AtomicBool::new(skip_waiting),
            environment: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    pub fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn skip_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_skip_waiting_in_memory(&self, value: bool) {
        self.skip_waiting.store(value, Ordering::SeqCst);
    }

    /// Handle to the worker's execution environment, starting one (and
    /// evaluating the main script) if none is running yet.
    pub fn environment(
        self: &Arc<Self>,
        hooks: &WorkerHooks,
        io: &Arc<IoPool>,
    ) -> Result<EnvironmentHandle, WorkerError> {
        let mut slot = match self.environment.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.as_ref() {
            if !handle.is_stopped() {
                return Ok(handle.clone());
            }
        }
        let handle = ExecutionEnvironment::spawn(self, hooks.clone(), Arc::clone(io))?;
        let source = match hooks.worker.script_content(self) {
            Ok(source) => source,
            Err(error) => {
                handle.request_stop();
                return Err(error);
            }
        };
        if let Err(error) = handle
            .evaluate(&source, Some(self.url.clone()), ReturnKind::Void)
            .wait()
        {
            handle.request_stop();
            return Err(error);
        }
        debug!(target: "lifecycle", worker = self.id, "worker environment started");
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Currently running environment, if any.
    pub fn running_environment(&self) -> Option<EnvironmentHandle> {
        let slot = match self.environment.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.as_ref().filter(|handle| !handle.is_stopped()).cloned()
    }

    pub fn shutdown_environment(&self) {
        let handle = {
            let mut slot = match self.environment.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(handle) = handle {
            handle.request_stop();
        }
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.shutdown_environment();
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}
