//! Cross-thread completion plumbing.
//!
//! Worker threads settle results produced inside the engine; callers on other
//! threads wait for those results without ever touching a JS value. A
//! [`Passthrough`] is the settle side and a [`BridgeFuture`] the waiting side
//! of a single oneshot exchange. Values cross the boundary as JSON.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::error::WorkerError;

type Settlement = Result<JsonValue, WorkerError>;

/// Settle side of a bridge exchange. Cheap to clone; the first call to
/// [`fulfill`](Passthrough::fulfill) or [`reject`](Passthrough::reject) wins
/// and every later settlement is ignored.
#[derive(Clone)]
pub struct Passthrough {
    sender: Arc<Mutex<Option<oneshot::Sender<Settlement>>>>,
}

impl Passthrough {
    pub fn fulfill(&self, value: JsonValue) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: WorkerError) {
        self.settle(Err(error));
    }

    pub fn settle(&self, result: Settlement) {
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    /// Whether a settlement has already been recorded.
    pub fn is_settled(&self) -> bool {
        match self.sender.lock() {
            Ok(slot) => slot.is_none(),
            Err(_) => true,
        }
    }
}

/// Waiting side of a bridge exchange, typed by the value the caller expects
/// back. The JSON settlement is converted through [`FromBridge`]; a value of
/// the wrong shape turns into a [`WorkerError::TypeMismatch`] rejection.
pub struct BridgeFuture<T: FromBridge> {
    receiver: oneshot::Receiver<Settlement>,
    _marker: PhantomData<T>,
}

impl<T: FromBridge> BridgeFuture<T> {
    /// Block the calling thread until the other side settles. Never call this
    /// from the worker thread that is expected to produce the settlement.
    pub fn wait(self) -> Result<T, WorkerError> {
        match self.receiver.blocking_recv() {
            Ok(Ok(value)) => T::from_bridge(value),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(WorkerError::EnvironmentStopped),
        }
    }

    /// Async variant of [`wait`](BridgeFuture::wait) for callers already on a
    /// tokio runtime.
    pub async fn await_result(self) -> Result<T, WorkerError> {
        match self.receiver.await {
            Ok(Ok(value)) => T::from_bridge(value),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(WorkerError::EnvironmentStopped),
        }
    }
}

/// Create a connected passthrough/future pair.
pub fn passthrough<T: FromBridge>() -> (BridgeFuture<T>, Passthrough) {
    let (sender, receiver) = oneshot::channel();
    (
        BridgeFuture {
            receiver,
            _marker: PhantomData,
        },
        Passthrough {
            sender: Arc::new(Mutex::new(Some(sender))),
        },
    )
}

/// Conversion from the JSON settlement into the caller's expected type.
pub trait FromBridge: Sized {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError>;
}

fn mismatch<T>(expected: &'static str, value: &JsonValue) -> Result<T, WorkerError> {
    Err(WorkerError::TypeMismatch {
        expected,
        received: value.to_string(),
    })
}

// Unit callers discard the settlement, so anything fulfils them.
impl FromBridge for () {
    fn from_bridge(_value: JsonValue) -> Result<Self, WorkerError> {
        Ok(())
    }
}

impl FromBridge for JsonValue {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError> {
        Ok(value)
    }
}

impl FromBridge for String {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError> {
        match value {
            JsonValue::String(text) => Ok(text),
            other => mismatch("string", &other),
        }
    }
}

impl FromBridge for bool {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError> {
        match value {
            JsonValue::Bool(flag) => Ok(flag),
            other => mismatch("boolean", &other),
        }
    }
}

impl FromBridge for f64 {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError> {
        match value.as_f64() {
            Some(number) => Ok(number),
            None => mismatch("number", &value),
        }
    }
}

impl FromBridge for i64 {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError> {
        match value.as_i64() {
            Some(number) => Ok(number),
            None => mismatch("integer", &value),
        }
    }
}

impl<T: FromBridge> FromBridge for Option<T> {
    fn from_bridge(value: JsonValue) -> Result<Self, WorkerError> {
        match value {
            JsonValue::Null => Ok(None),
            other => T::from_bridge(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_settlement_wins() {
        let (future, settle) = passthrough::<String>();
        settle.fulfill(json!("first"));
        settle.fulfill(json!("second"));
        settle.reject(WorkerError::message("too late"));
        assert_eq!(future.wait().unwrap(), "first");
    }

    #[test]
    fn rejection_beats_later_fulfillment() {
        let (future, settle) = passthrough::<String>();
        settle.reject(WorkerError::message("boom"));
        settle.fulfill(json!("ignored"));
        assert!(matches!(future.wait(), Err(WorkerError::Message(m)) if m == "boom"));
    }

    #[test]
    fn type_mismatch_rejects() {
        let (future, settle) = passthrough::<String>();
        settle.fulfill(json!(42));
        assert!(matches!(
            future.wait(),
            Err(WorkerError::TypeMismatch { expected: "string", .. })
        ));
    }

    #[test]
    fn unit_accepts_any_value() {
        let (future, settle) = passthrough::<()>();
        settle.fulfill(json!({"arbitrary": [1, 2, 3]}));
        assert!(future.wait().is_ok());
    }

    #[test]
    fn dropped_sender_reports_stopped_environment() {
        let (future, settle) = passthrough::<()>();
        drop(settle);
        assert!(matches!(future.wait(), Err(WorkerError::EnvironmentStopped)));
    }

    #[test]
    fn settles_across_threads() {
        let (future, settle) = passthrough::<f64>();
        let handle = std::thread::spawn(move || settle.fulfill(json!(6.5)));
        assert_eq!(future.wait().unwrap(), 6.5);
        handle.join().unwrap();
    }
}
