use crate::storage::StorageError;

/// Errors surfaced by the worker runtime. Failures that originate inside a
/// script are carried as `ScriptException` with the message and stack (when
/// available) already rendered to a string, since JS values cannot leave the
/// thread that owns them.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("script exception: {0}")]
    ScriptException(String),

    #[error("{0} is not implemented by the host delegate")]
    DelegateUnimplemented(&'static str),

    #[error("{0} delegate dropped its callback without responding")]
    DelegateNoResponse(&'static str),

    #[error("expected a {expected} value but received {received}")]
    TypeMismatch {
        expected: &'static str,
        received: String,
    },

    #[error("the execution environment has shut down")]
    EnvironmentStopped,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Message(String),
}

impl WorkerError {
    pub fn message(text: impl Into<String>) -> Self {
        WorkerError::Message(text.into())
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} keeps the context chain in the rendered message
        WorkerError::Message(format!("{err:#}"))
    }
}

impl From<url::ParseError> for WorkerError {
    fn from(err: url::ParseError) -> Self {
        WorkerError::Message(format!("invalid URL: {err}"))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Message(format!("JSON conversion failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_chains_keep_their_context() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "engine lost");
        let error: WorkerError = anyhow::Error::from(source)
            .context("failed to create JS runtime")
            .into();
        match error {
            WorkerError::Message(text) => {
                assert!(text.contains("failed to create JS runtime"));
                assert!(text.contains("engine lost"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
