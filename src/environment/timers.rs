use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::EnvironmentHandle;
use crate::io::IoPool;

/// Timer scheduling for one environment. Sleeps run on the io pool; when one
/// elapses the callback is marshalled back to the worker thread as a command,
/// so timer callbacks always run with the engine. Cancellation drops the
/// guard channel, which wakes the sleeping task.
pub(crate) struct TimerRegistry {
    env: EnvironmentHandle,
    next_id: AtomicU32,
    cancels: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl TimerRegistry {
    pub fn new(env: EnvironmentHandle) -> Self {
        TimerRegistry {
            env,
            next_id: AtomicU32::new(1),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule(&self, io: &IoPool, delay_ms: f64, repeating: bool) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.store_cancel(id, cancel_tx);

        let env = self.env.clone();
        let duration = Duration::from_millis(delay_ms.max(0.0) as u64);
        io.spawn(async move {
            if repeating {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            if env.fire_timer(id, true).is_err() {
                                break;
                            }
                        }
                        _ = &mut cancel_rx => break,
                    }
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        let _ = env.fire_timer(id, false);
                    }
                    _ = &mut cancel_rx => {}
                }
            }
        });
        debug!(target: "worker", timer = id, repeating, delay_ms, "scheduled timer");
        id
    }

    pub fn cancel(&self, id: u32) {
        // dropping the sender wakes and ends the sleep task
        self.with_cancels(|cancels| {
            cancels.remove(&id);
        });
    }

    pub fn clear_all(&self) {
        self.with_cancels(|cancels| cancels.clear());
    }

    fn store_cancel(&self, id: u32, sender: oneshot::Sender<()>) {
        self.with_cancels(|cancels| {
            cancels.insert(id, sender);
        });
    }

    fn with_cancels<R>(&self, f: impl FnOnce(&mut HashMap<u32, oneshot::Sender<()>>) -> R) -> R {
        let mut guard = match self.cancels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear_all();
    }
}
