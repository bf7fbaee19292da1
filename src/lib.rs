//! An embedded service worker runtime: QuickJS execution environments on
//! dedicated threads, a four-slot registration lifecycle persisted to
//! sqlite, and host delegate traits for everything that touches the outside
//! world.

pub mod bridge;
pub mod cache;
pub mod clients;
pub mod engine;
pub mod environment;
pub mod error;
pub mod events;
pub mod fetch;
pub mod io;
pub mod lifecycle;
pub mod messaging;
pub mod storage;

pub use bridge::{BridgeFuture, FromBridge, Passthrough};
pub use cache::{CacheMatchOptions, CacheProvider};
pub use clients::{
    Client, ClientHandle, ClientRegistry, ClientType, ClientsDelegate, MatchAllOptions,
    VisibilityState, WindowClientHandle,
};
pub use engine::ScriptEngine;
pub use environment::{EnvironmentHandle, ExecutionEnvironment, ReturnKind, WorkerDelegate, WorkerHooks};
pub use error::WorkerError;
pub use events::{Event, EventPayload, EventTarget, PayloadKind, SharedEventTarget};
pub use fetch::{FetchDelegate, FetchRequest, FetchResponse, ImportDelegate};
pub use io::IoPool;
pub use lifecycle::{RegistrationFactory, ServiceWorker, ServiceWorkerRegistration, Slot, WorkerFactory, WorkerState};
pub use messaging::{MessageChannel, MessagePort};
pub use storage::CoreStorage;
