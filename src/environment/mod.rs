//! Execution environments: one dedicated OS thread per running worker, each
//! owning a QuickJS engine that never leaves it. Other threads talk to an
//! environment through its [`EnvironmentHandle`], which marshals commands
//! onto the worker thread and hands back bridge futures for the results.

mod database;
mod registry;
mod scope;
mod timers;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rquickjs::{Function, Value};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::{self, BridgeFuture, Passthrough};
use crate::cache::CacheProvider;
use crate::clients::{Client, ClientRegistry, ClientsDelegate, NullClients};
use crate::engine::{describe_exception, ScriptEngine};
use crate::error::WorkerError;
use crate::events::{Event, ListenerKind, ScriptCallback, SharedEventTarget};
use crate::fetch::{FetchDelegate, FetchRequest, ImportDelegate, NullFetch, NullImport};
use crate::io::IoPool;
use crate::lifecycle::ServiceWorker;

use database::ScriptDatabase;
use timers::TimerRegistry;

/// What the caller expects back from an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    /// Side effects only; the completion value is discarded.
    Void,
    /// The completion value, serialized to JSON.
    Value,
    /// The completion value is treated as a promise; the bridge settles when
    /// it does.
    Promise,
}

/// Host-side loader for worker script content and per-domain storage.
pub trait WorkerDelegate: Send + Sync {
    fn script_content(&self, worker: &ServiceWorker) -> Result<String, WorkerError>;

    /// Directory for databases opened by this worker's scripts.
    fn domain_storage_path(&self, worker: &ServiceWorker) -> Result<PathBuf, WorkerError> {
        let _ = worker;
        Err(WorkerError::DelegateUnimplemented("domain storage"))
    }
}

/// Everything an environment needs from the host, bundled so workers can be
/// started from anywhere that holds a copy.
#[derive(Clone)]
pub struct WorkerHooks {
    pub worker: Arc<dyn WorkerDelegate>,
    pub import: Arc<dyn ImportDelegate>,
    pub fetch: Arc<dyn FetchDelegate>,
    pub clients: Arc<dyn ClientsDelegate>,
    pub cache: Option<Arc<dyn CacheProvider>>,
    pub client_registry: Arc<ClientRegistry>,
}

impl WorkerHooks {
    pub fn new(worker: Arc<dyn WorkerDelegate>) -> Self {
        WorkerHooks {
            worker,
            import: Arc::new(NullImport),
            fetch: Arc::new(NullFetch),
            clients: Arc::new(NullClients),
            cache: None,
            client_registry: Arc::new(ClientRegistry::new()),
        }
    }

    pub fn with_import(mut self, import: Arc<dyn ImportDelegate>) -> Self {
        self.import = import;
        self
    }

    pub fn with_fetch(mut self, fetch: Arc<dyn FetchDelegate>) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_clients(mut self, clients: Arc<dyn ClientsDelegate>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }
}

pub(crate) enum Command {
    Evaluate {
        source: String,
        url: Option<Url>,
        return_kind: ReturnKind,
        passthrough: Passthrough,
    },
    DispatchEvent {
        event: Event,
        passthrough: Passthrough,
    },
    DispatchFetch {
        request: FetchRequest,
        passthrough: Passthrough,
    },
    InvokeListener {
        key: u32,
        event: Event,
        passthrough: Passthrough,
    },
    CompletePending {
        id: u32,
        result: Result<JsonValue, WorkerError>,
        retain: Vec<Arc<Client>>,
    },
    FireTimer {
        id: u32,
        repeating: bool,
    },
    WithEngine(Box<dyn FnOnce(&ScriptEngine) + Send>),
    Stop {
        passthrough: Passthrough,
    },
}

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

struct HandleInner {
    env_id: u64,
    worker_id: String,
    tx: mpsc::UnboundedSender<Command>,
    stopped: AtomicBool,
    global_target: SharedEventTarget,
}

/// Cheap, `Send + Sync` handle to a running environment.
#[derive(Clone)]
pub struct EnvironmentHandle {
    inner: Arc<HandleInner>,
}

impl EnvironmentHandle {
    fn new(env_id: u64, worker_id: String, tx: mpsc::UnboundedSender<Command>) -> Self {
        EnvironmentHandle {
            inner: Arc::new(HandleInner {
                env_id,
                worker_id,
                tx,
                stopped: AtomicBool::new(false),
                global_target: SharedEventTarget::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.env_id
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The worker's global scope as an event target. Native listeners added
    /// here see the same events the script's `addEventListener` does.
    pub fn global_target(&self) -> &SharedEventTarget {
        &self.inner.global_target
    }

    fn send(&self, command: Command) -> Result<(), WorkerError> {
        if self.is_stopped() {
            return Err(WorkerError::EnvironmentStopped);
        }
        self.inner
            .tx
            .send(command)
            .map_err(|_| WorkerError::EnvironmentStopped)
    }

    fn send_or_reject(&self, command: Command, passthrough: &Passthrough) {
        if let Err(error) = self.send(command) {
            passthrough.reject(error);
        }
    }

    /// Evaluate a script on the worker thread.
    pub fn evaluate(
        &self,
        source: &str,
        url: Option<Url>,
        return_kind: ReturnKind,
    ) -> BridgeFuture<JsonValue> {
        let (future, passthrough) = bridge::passthrough();
        self.send_or_reject(
            Command::Evaluate {
                source: source.to_string(),
                url,
                return_kind,
                passthrough: passthrough.clone(),
            },
            &passthrough,
        );
        future
    }

    /// Dispatch an event to the worker's global scope. The future settles
    /// after every listener ran and any `waitUntil` promises resolved.
    pub fn dispatch_event(&self, event: Event) -> BridgeFuture<()> {
        let (future, passthrough) = bridge::passthrough();
        self.send_or_reject(
            Command::DispatchEvent {
                event,
                passthrough: passthrough.clone(),
            },
            &passthrough,
        );
        future
    }

    /// Dispatch a fetch event. Resolves with the response the script passed
    /// to `respondWith`, or `null` when no listener responded.
    pub fn dispatch_fetch(&self, request: FetchRequest) -> BridgeFuture<JsonValue> {
        let (future, passthrough) = bridge::passthrough();
        self.send_or_reject(
            Command::DispatchFetch {
                request,
                passthrough: passthrough.clone(),
            },
            &passthrough,
        );
        future
    }

    /// Run a closure with the engine on the worker thread. For host
    /// integrations that need raw context access.
    pub fn with_engine(
        &self,
        f: impl FnOnce(&ScriptEngine) + Send + 'static,
    ) -> Result<(), WorkerError> {
        self.send(Command::WithEngine(Box::new(f)))
    }

    /// Ask the environment to shut down, returning a future that settles
    /// once the command loop exits its last iteration.
    pub fn stop(&self) -> BridgeFuture<()> {
        let (future, passthrough) = bridge::passthrough();
        self.send_or_reject(
            Command::Stop {
                passthrough: passthrough.clone(),
            },
            &passthrough,
        );
        future
    }

    /// Fire-and-forget variant of [`stop`](Self::stop).
    pub fn request_stop(&self) {
        let (_, passthrough) = bridge::passthrough::<()>();
        let _ = self.send(Command::Stop { passthrough });
    }

    pub(crate) fn fire_timer(&self, id: u32, repeating: bool) -> Result<(), WorkerError> {
        self.send(Command::FireTimer { id, repeating })
    }

    pub(crate) fn complete_pending(&self, id: u32, result: Result<JsonValue, WorkerError>) {
        self.complete_pending_retaining(id, result, Vec::new());
    }

    pub(crate) fn complete_pending_retaining(
        &self,
        id: u32,
        result: Result<JsonValue, WorkerError>,
        retain: Vec<Arc<Client>>,
    ) {
        if self.send(Command::CompletePending { id, result, retain }).is_err() {
            debug!(target: "worker", pending = id, "environment gone before pending completion");
        }
    }

    /// Invoke one script listener with an event, blocking until it ran. When
    /// called from the environment's own thread the listener runs inline;
    /// marshalling and waiting would deadlock.
    pub(crate) fn invoke_listener_blocking(&self, key: u32, event: &Event) -> Result<(), WorkerError> {
        let inline = registry::try_with(self.id(), |engine, shared| {
            invoke_listener_inline(engine, shared, key, event)
        });
        match inline {
            Some(result) => result,
            None => {
                let (future, passthrough) = bridge::passthrough::<()>();
                self.send(Command::InvokeListener {
                    key,
                    event: event.clone(),
                    passthrough,
                })?;
                future.wait()
            }
        }
    }

    fn mark_stopped(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

/// State shared between the command loop and the host functions installed
/// into the JS context. Holds no engine reference: the context (and thus the
/// closures) must not keep the engine alive.
pub(crate) struct EnvShared {
    env_id: u64,
    worker_id: String,
    worker_url: Url,
    worker: Weak<ServiceWorker>,
    hooks: WorkerHooks,
    io: Arc<IoPool>,
    handle: EnvironmentHandle,
    global_target: SharedEventTarget,
    exception: RefCell<Option<String>>,
    ports: RefCell<HashMap<u32, crate::messaging::MessagePort>>,
    pending_out: RefCell<HashMap<u32, Passthrough>>,
    next_out_id: Cell<u32>,
    timers: TimerRegistry,
    databases: RefCell<HashMap<u32, ScriptDatabase>>,
    next_db_id: Cell<u32>,
    surfaced_clients: RefCell<HashMap<String, Arc<Client>>>,
}

impl EnvShared {
    pub fn env_id(&self) -> u64 {
        self.env_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_url(&self) -> &Url {
        &self.worker_url
    }

    pub fn worker(&self) -> Option<Arc<ServiceWorker>> {
        self.worker.upgrade()
    }

    pub fn hooks(&self) -> &WorkerHooks {
        &self.hooks
    }

    pub fn io(&self) -> &Arc<IoPool> {
        &self.io
    }

    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    pub fn global_target(&self) -> &SharedEventTarget {
        &self.global_target
    }

    /// Record an exception for the next settlement check. First write wins,
    /// mirroring how an engine-level exception slot behaves.
    pub fn record_exception(&self, message: String) {
        let mut slot = self.exception.borrow_mut();
        if slot.is_none() {
            warn!(target: "worker", worker = %self.worker_id, exception = %message, "script exception recorded");
            *slot = Some(message);
        }
    }

    pub fn take_exception(&self) -> Option<String> {
        self.exception.borrow_mut().take()
    }

    pub fn clear_stale_exception(&self) {
        if let Some(stale) = self.exception.borrow_mut().take() {
            warn!(target: "worker", worker = %self.worker_id, exception = %stale, "clearing stale exception before new evaluation");
        }
    }

    pub fn register_port(&self, port: crate::messaging::MessagePort) -> u32 {
        let id = port.id();
        self.ports.borrow_mut().insert(id, port);
        id
    }

    pub fn port(&self, id: u32) -> Option<crate::messaging::MessagePort> {
        self.ports.borrow().get(&id).cloned()
    }

    pub fn remove_port(&self, id: u32) -> Option<crate::messaging::MessagePort> {
        self.ports.borrow_mut().remove(&id)
    }

    pub fn register_pending_out(&self, passthrough: Passthrough) -> u32 {
        let id = self.next_out_id.get();
        self.next_out_id.set(id.wrapping_add(1));
        self.pending_out.borrow_mut().insert(id, passthrough);
        id
    }

    pub fn remove_pending_out(&self, id: u32) -> Option<Passthrough> {
        self.pending_out.borrow_mut().remove(&id)
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn insert_database(&self, database: ScriptDatabase) -> u32 {
        let id = self.next_db_id.get();
        self.next_db_id.set(id.wrapping_add(1));
        self.databases.borrow_mut().insert(id, database);
        id
    }

    pub fn with_database<R>(
        &self,
        id: u32,
        f: impl FnOnce(&ScriptDatabase) -> R,
    ) -> Option<R> {
        let databases = self.databases.borrow();
        databases.get(&id).map(f)
    }

    pub fn remove_database(&self, id: u32) -> Option<ScriptDatabase> {
        self.databases.borrow_mut().remove(&id)
    }

    pub fn retain_client(&self, client: Arc<Client>) {
        self.surfaced_clients.borrow_mut().insert(client.id(), client);
    }

    pub fn surfaced_client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.surfaced_clients.borrow().get(client_id).cloned()
    }
}

/// The worker-thread side of an environment: the engine, the shared state
/// and the command receiver. Built and consumed entirely on its own thread.
pub struct ExecutionEnvironment {
    engine: Rc<ScriptEngine>,
    shared: Rc<EnvShared>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl ExecutionEnvironment {
    /// Start an environment thread for `worker`. Blocks until the engine and
    /// global scope finished building, so a returned handle is always usable.
    pub fn spawn(
        worker: &Arc<ServiceWorker>,
        hooks: WorkerHooks,
        io: Arc<IoPool>,
    ) -> Result<EnvironmentHandle, WorkerError> {
        let env_id = NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EnvironmentHandle::new(env_id, worker.id().to_string(), tx);

        let worker_id = worker.id().to_string();
        let worker_url = worker.url().clone();
        let weak_worker = Arc::downgrade(worker);
        let thread_handle = handle.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name(format!("service-worker:{worker_id}"))
            .spawn(move || {
                let environment = ExecutionEnvironment::build(
                    env_id,
                    worker_id,
                    worker_url,
                    weak_worker,
                    hooks,
                    io,
                    thread_handle.clone(),
                    rx,
                );
                match environment {
                    Ok(environment) => {
                        let _ = ready_tx.send(Ok(()));
                        environment.run();
                    }
                    Err(error) => {
                        thread_handle.mark_stopped();
                        let _ = ready_tx.send(Err(error));
                    }
                }
            })
            .map_err(|err| WorkerError::Message(format!("failed to spawn worker thread: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(WorkerError::EnvironmentStopped),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        env_id: u64,
        worker_id: String,
        worker_url: Url,
        worker: Weak<ServiceWorker>,
        hooks: WorkerHooks,
        io: Arc<IoPool>,
        handle: EnvironmentHandle,
        rx: mpsc::UnboundedReceiver<Command>,
    ) -> Result<Self, WorkerError> {
        let engine = Rc::new(ScriptEngine::new()?);
        let shared = Rc::new(EnvShared::create(
            env_id,
            worker_id.clone(),
            worker_url,
            worker,
            hooks,
            io,
            handle,
        ));
        scope::install_global_scope(&engine, &shared)?;
        registry::register(env_id, Rc::clone(&engine), Rc::clone(&shared));
        info!(target: "worker", worker = %worker_id, env = env_id, "execution environment ready");
        Ok(ExecutionEnvironment { engine, shared, rx })
    }

    /// Command loop. Runs until a stop command arrives or every handle is
    /// dropped, then tears the environment down.
    fn run(mut self) {
        while let Some(command) = self.rx.blocking_recv() {
            if self.handle_command(command).is_break() {
                break;
            }
        }
        self.teardown();
    }

    fn handle_command(&self, command: Command) -> ControlFlow<()> {
        registry::assert_on_owner_thread(self.shared.env_id, "command handling");
        match command {
            Command::Evaluate {
                source,
                url,
                return_kind,
                passthrough,
            } => {
                self.handle_evaluate(&source, url.as_ref(), return_kind, passthrough);
            }
            Command::DispatchEvent { event, passthrough } => {
                self.handle_dispatch_event(&event, passthrough);
            }
            Command::DispatchFetch {
                request,
                passthrough,
            } => {
                self.handle_dispatch_fetch(request, passthrough);
            }
            Command::InvokeListener {
                key,
                event,
                passthrough,
            } => {
                match invoke_listener_inline(&self.engine, &self.shared, key, &event) {
                    Ok(()) => passthrough.fulfill(JsonValue::Null),
                    Err(error) => passthrough.reject(error),
                }
            }
            Command::CompletePending { id, result, retain } => {
                self.handle_complete_pending(id, result, retain);
            }
            Command::FireTimer { id, repeating } => {
                self.handle_fire_timer(id, repeating);
            }
            Command::WithEngine(f) => {
                f(&self.engine);
                self.drain_jobs();
            }
            Command::Stop { passthrough } => {
                passthrough.fulfill(JsonValue::Null);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn drain_jobs(&self) {
        if let Some(failure) = self.engine.drain_jobs() {
            self.shared.record_exception(failure);
        }
    }

    fn handle_evaluate(
        &self,
        source: &str,
        url: Option<&Url>,
        return_kind: ReturnKind,
        passthrough: Passthrough,
    ) {
        self.shared.clear_stale_exception();
        let filename = url.map(Url::as_str);
        match return_kind {
            ReturnKind::Void => match self.engine.eval(source, filename) {
                Ok(()) => self.settle_after_interaction(passthrough, JsonValue::Null),
                Err(error) => passthrough.reject(error),
            },
            ReturnKind::Value => match self.engine.eval_json(source, filename) {
                Ok(value) => self.settle_after_interaction(passthrough, value),
                Err(error) => passthrough.reject(error),
            },
            ReturnKind::Promise => self.evaluate_promise(source, filename, passthrough),
        }
    }

    fn evaluate_promise(&self, source: &str, filename: Option<&str>, passthrough: Passthrough) {
        let code = match filename {
            Some(name) => crate::engine::with_source_url(source, name),
            None => source.to_string(),
        };
        let shared = &self.shared;
        let outcome = self.engine.with_context(|ctx| {
            let value = ctx.eval::<Value, _>(code.into_bytes())?;
            if value.is_undefined() || value.is_null() {
                return Ok(None);
            }
            let id = shared.register_pending_out(passthrough.clone());
            let forward: Function = ctx.globals().get("__bw_forwardPromise")?;
            forward.call::<_, ()>((value, id))?;
            Ok(Some(id))
        });
        self.drain_jobs();
        match outcome {
            Ok(None) => self.settle_after_interaction(passthrough, JsonValue::Null),
            Ok(Some(id)) => {
                if let Some(exception) = self.shared.take_exception() {
                    if let Some(pending) = self.shared.remove_pending_out(id) {
                        pending.reject(WorkerError::ScriptException(exception));
                    }
                }
            }
            Err(error) => {
                passthrough.reject(error);
            }
        }
    }

    /// Fulfill unless an exception surfaced during the interaction.
    fn settle_after_interaction(&self, passthrough: Passthrough, value: JsonValue) {
        self.drain_jobs();
        match self.shared.take_exception() {
            Some(exception) => passthrough.reject(WorkerError::ScriptException(exception)),
            None => passthrough.fulfill(value),
        }
    }

    fn handle_dispatch_event(&self, event: &Event, passthrough: Passthrough) {
        let shared = &self.shared;
        let outcome = self.engine.with_context(|ctx| {
            let js_event = scope::make_event_value(&ctx, shared, event)?;
            dispatch_listeners(shared, &ctx, event, &js_event);
            // waitUntil promises extend the dispatch until they settle
            let id = shared.register_pending_out(passthrough.clone());
            let finish: Function = ctx.globals().get("__bw_finishEvent")?;
            let extended: bool = finish.call((js_event, id))?;
            if !extended {
                shared.remove_pending_out(id);
            }
            Ok(extended)
        });
        self.drain_jobs();
        match outcome {
            Ok(false) => self.settle_after_interaction_existing(passthrough),
            Ok(true) => {
                if let Some(exception) = self.shared.take_exception() {
                    passthrough.reject(WorkerError::ScriptException(exception));
                }
            }
            Err(error) => passthrough.reject(error),
        }
    }

    fn settle_after_interaction_existing(&self, passthrough: Passthrough) {
        match self.shared.take_exception() {
            Some(exception) => passthrough.reject(WorkerError::ScriptException(exception)),
            None => passthrough.fulfill(JsonValue::Null),
        }
    }

    fn handle_dispatch_fetch(&self, request: FetchRequest, passthrough: Passthrough) {
        let shared = &self.shared;
        let event = Event::fetch(request.clone());
        let outcome = self.engine.with_context(|ctx| {
            let id = shared.register_pending_out(passthrough.clone());
            let request_json =
                serde_json::to_string(&request).map_err(|_| rquickjs::Error::Unknown)?;
            let make: Function = ctx.globals().get("__bw_makeFetchEvent")?;
            let js_event: Value = make.call((request_json, id))?;
            dispatch_listeners(shared, &ctx, &event, &js_event);
            let responded: bool = js_event
                .as_object()
                .and_then(|object| object.get("__responded").ok())
                .unwrap_or(false);
            if !responded {
                shared.remove_pending_out(id);
            }
            Ok(responded)
        });
        self.drain_jobs();
        match outcome {
            // no listener claimed the fetch; the host falls through to its
            // default network path
            Ok(false) => self.settle_after_interaction(passthrough, JsonValue::Null),
            Ok(true) => {
                if let Some(exception) = self.shared.take_exception() {
                    warn!(target: "worker", worker = %self.shared.worker_id, %exception, "exception during fetch dispatch");
                }
            }
            Err(error) => passthrough.reject(error),
        }
    }

    fn handle_complete_pending(
        &self,
        id: u32,
        result: Result<JsonValue, WorkerError>,
        retain: Vec<Arc<Client>>,
    ) {
        for client in retain {
            self.shared.retain_client(client);
        }
        let (payload, error) = match result {
            Ok(value) => (Some(value.to_string()), None),
            Err(error) => (None, Some(error.to_string())),
        };
        let outcome = self.engine.with_context(|ctx| {
            let settle: Function = ctx.globals().get("__bw_settle")?;
            settle.call::<_, ()>((id, payload, error))?;
            Ok(())
        });
        self.drain_jobs();
        if let Err(error) = outcome {
            warn!(target: "worker", worker = %self.shared.worker_id, %error, pending = id, "failed to settle pending promise");
        }
    }

    fn handle_fire_timer(&self, id: u32, repeating: bool) {
        if !repeating {
            self.shared.timers.cancel(id);
        }
        let outcome = self.engine.with_context(|ctx| {
            let fire: Function = ctx.globals().get("__bw_fireTimer")?;
            fire.call::<_, ()>((id, repeating))?;
            Ok(())
        });
        self.drain_jobs();
        if let Err(error) = outcome {
            warn!(target: "worker", worker = %self.shared.worker_id, %error, timer = id, "timer callback raised");
        }
        if let Some(exception) = self.shared.take_exception() {
            warn!(target: "worker", worker = %self.shared.worker_id, exception = %exception, timer = id, "exception after timer callback");
        }
    }

    fn teardown(&self) {
        self.shared.timers.clear_all();

        let open_databases: Vec<String> = {
            let databases = self.shared.databases.borrow();
            databases
                .values()
                .filter(|db| db.is_open())
                .map(|db| db.name().to_string())
                .collect()
        };
        if !open_databases.is_empty() {
            info!(
                target: "worker",
                worker = %self.shared.worker_id,
                databases = ?open_databases,
                "force closing databases still open at shutdown"
            );
        }
        {
            let databases = self.shared.databases.borrow();
            for database in databases.values() {
                database.force_close();
            }
        }
        self.shared.databases.borrow_mut().clear();

        for (_, pending) in self.shared.pending_out.borrow_mut().drain() {
            pending.reject(WorkerError::EnvironmentStopped);
        }
        self.shared.ports.borrow_mut().clear();
        self.shared.surfaced_clients.borrow_mut().clear();
        self.shared.global_target.clear();

        registry::evict(self.shared.env_id);
        self.shared.handle.mark_stopped();
        info!(target: "worker", worker = %self.shared.worker_id, env = self.shared.env_id, "execution environment shut down");
    }
}

/// Deliver an event to the global scope listeners, sharing one JS event
/// object across the script listeners of this environment. Listener
/// exceptions are recorded and dispatch continues.
pub(crate) fn dispatch_listeners<'js>(
    shared: &EnvShared,
    ctx: &rquickjs::Ctx<'js>,
    event: &Event,
    js_event: &Value<'js>,
) {
    for kind in shared.global_target.matching(event.name()) {
        match kind {
            ListenerKind::Script(callback) if callback.env.id() == shared.env_id => {
                if let Err(error) = call_script_listener(ctx, callback.key, js_event) {
                    match error {
                        rquickjs::Error::Exception => {
                            shared.record_exception(describe_exception(ctx));
                        }
                        other => {
                            shared.record_exception(format!("listener failure: {other}"));
                        }
                    }
                }
            }
            ListenerKind::Script(callback) => {
                // listener registered by a different environment
                if let Err(error) = callback.env.invoke_listener_blocking(callback.key, event) {
                    warn!(target: "events", %error, event = event.name(), "cross-environment listener raised");
                }
            }
            ListenerKind::Native {
                accepts, handler, ..
            } => crate::events::invoke_native(&handler, accepts, event),
        }
    }
}

fn call_script_listener<'js>(
    ctx: &rquickjs::Ctx<'js>,
    key: u32,
    js_event: &Value<'js>,
) -> rquickjs::Result<()> {
    let invoke: Function = ctx.globals().get("__bw_invoke")?;
    invoke.call::<_, ()>((key, js_event.clone()))?;
    Ok(())
}

/// Invoke one script listener on the calling (owning) thread.
fn invoke_listener_inline(
    engine: &ScriptEngine,
    shared: &EnvShared,
    key: u32,
    event: &Event,
) -> Result<(), WorkerError> {
    let result = engine.with_context(|ctx| {
        let js_event = scope::make_event_value(&ctx, shared, event)?;
        call_script_listener(&ctx, key, &js_event)
    });
    if let Some(failure) = engine.drain_jobs() {
        shared.record_exception(failure);
    }
    if let Err(WorkerError::ScriptException(message)) = &result {
        shared.record_exception(message.clone());
    }
    result
}

/// Register a script listener for `name` on the environment's global target.
pub(crate) fn add_global_script_listener(shared: &EnvShared, name: &str, key: u32) -> bool {
    shared
        .global_target
        .add_script_listener(name, ScriptCallback::new(shared.handle.clone(), key))
}

impl EnvShared {
    #[allow(clippy::too_many_arguments)]
    fn create(
        env_id: u64,
        worker_id: String,
        worker_url: Url,
        worker: Weak<ServiceWorker>,
        hooks: WorkerHooks,
        io: Arc<IoPool>,
        handle: EnvironmentHandle,
    ) -> Self {
        EnvShared {
            env_id,
            worker_id,
            worker_url,
            worker,
            hooks,
            io,
            global_target: handle.global_target().clone(),
            timers: TimerRegistry::new(handle.clone()),
            handle,
            exception: RefCell::new(None),
            ports: RefCell::new(HashMap::new()),
            pending_out: RefCell::new(HashMap::new()),
            next_out_id: Cell::new(1),
            databases: RefCell::new(HashMap::new()),
            next_db_id: Cell::new(1),
            surfaced_clients: RefCell::new(HashMap::new()),
        }
    }
}
