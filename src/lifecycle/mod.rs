mod factory;
mod registration;
mod worker;

pub use factory::{RegistrationFactory, WorkerFactory};
pub use registration::{ServiceWorkerRegistration, Slot};
pub use worker::{ServiceWorker, WorkerState};
