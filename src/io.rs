use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::WorkerError;

/// Shared tokio runtime for everything that must not run on a worker thread:
/// delegate calls, timer sleeps, import loads. Worker threads block on
/// results from here; nothing here ever blocks on a worker thread.
pub struct IoPool {
    runtime: Runtime,
}

impl IoPool {
    pub fn new() -> Result<Self, WorkerError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sw-io")
            .enable_all()
            .build()
            .map_err(|err| WorkerError::Message(format!("failed to start io pool: {err}")))?;
        Ok(IoPool { runtime })
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    pub fn spawn_blocking<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn_blocking(task);
    }
}
