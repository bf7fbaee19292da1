use anyhow::Context as AnyhowContext;
use rquickjs::{Context, Ctx, Error as JsError, Runtime, Value};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::WorkerError;

const MAX_PENDING_JOBS: usize = 1_000;

/// A QuickJS runtime and context. The engine is deliberately `!Send`; it
/// lives and dies on the thread that created it. Exceptions raised between
/// engine interactions are tracked by the environment, not here, since host
/// functions installed into the context must not keep the engine alive.
pub struct ScriptEngine {
    runtime: Runtime,
    context: Context,
}

impl ScriptEngine {
    pub fn new() -> Result<Self, WorkerError> {
        let runtime = Runtime::new().context("failed to create JS runtime")?;
        let context = Context::full(&runtime).context("failed to create JS context")?;
        Ok(ScriptEngine { runtime, context })
    }

    /// Run `f` against the live context. A thrown JS exception is rendered
    /// to a string and returned as [`WorkerError::ScriptException`].
    pub fn with_context<R>(
        &self,
        f: impl FnOnce(Ctx<'_>) -> rquickjs::Result<R>,
    ) -> Result<R, WorkerError> {
        self.context.with(|ctx| match f(ctx.clone()) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(WorkerError::ScriptException(describe_exception(&ctx))),
            Err(other) => Err(WorkerError::Message(format!("engine failure: {other}"))),
        })
    }

    /// Evaluate a script for its side effects.
    pub fn eval(&self, source: &str, filename: Option<&str>) -> Result<(), WorkerError> {
        let code = attribute_source(source, filename);
        self.with_context(|ctx| {
            ctx.eval::<(), _>(code.into_bytes())?;
            Ok(())
        })
    }

    /// Evaluate a script and serialize its completion value to JSON.
    /// `undefined` comes back as `null`.
    pub fn eval_json(&self, source: &str, filename: Option<&str>) -> Result<JsonValue, WorkerError> {
        let code = attribute_source(source, filename);
        let rendered = self.with_context(|ctx| {
            let value = ctx.eval::<Value, _>(code.into_bytes())?;
            if value.is_undefined() {
                return Ok(None);
            }
            match ctx.json_stringify(value)? {
                Some(text) => Ok(Some(text.to_string()?)),
                None => Ok(None),
            }
        })?;
        match rendered {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(JsonValue::Null),
        }
    }

    /// Drive queued promise jobs to completion. Returns the rendered
    /// exception when a job fails; the caller decides where it goes.
    pub fn drain_jobs(&self) -> Option<String> {
        let mut executed = 0;
        let mut failure = None;
        while self.runtime.is_job_pending() {
            if executed >= MAX_PENDING_JOBS {
                warn!(target: "quickjs", "stopped processing jobs after {MAX_PENDING_JOBS} iterations (possible infinite loop)");
                break;
            }
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(job_exception) => {
                    failure = Some(format!("job execution error: {job_exception:?}"));
                    break;
                }
            }
        }
        if executed > 0 {
            debug!(target: "quickjs", jobs = executed, "drained pending jobs");
        }
        failure
    }
}

/// Render the currently-caught exception to `message\nstack` form.
pub(crate) fn describe_exception(ctx: &Ctx<'_>) -> String {
    let caught = ctx.catch();
    describe_exception_value(&caught)
}

pub(crate) fn describe_exception_value(caught: &Value<'_>) -> String {
    if let Some(object) = caught.as_object() {
        let message: Option<String> = object.get("message").ok();
        let stack: Option<String> = object.get("stack").ok();
        match (message, stack) {
            (Some(message), Some(stack)) => return format!("{message}\n{stack}"),
            (Some(message), None) => return message,
            _ => {}
        }
    }
    if let Some(text) = caught.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    "unknown script exception".to_string()
}

/// QuickJS has no per-eval filename hook, so attribution rides on the
/// `sourceURL` comment convention instead.
pub(crate) fn with_source_url(source: &str, url: &str) -> String {
    format!("{source}\n//# sourceURL={url}")
}

fn attribute_source(source: &str, filename: Option<&str>) -> String {
    match filename {
        Some(name) => with_source_url(source, name),
        None => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_simple_expressions() {
        let engine = ScriptEngine::new().unwrap();
        let value = engine.eval_json("1 + 2", None).unwrap();
        assert_eq!(value, serde_json::json!(3));
    }

    #[test]
    fn undefined_becomes_null() {
        let engine = ScriptEngine::new().unwrap();
        let value = engine.eval_json("undefined", None).unwrap();
        assert_eq!(value, JsonValue::Null);
    }

    #[test]
    fn exceptions_carry_the_message() {
        let engine = ScriptEngine::new().unwrap();
        let error = engine.eval("throw new Error('kaboom')", None).unwrap_err();
        match error {
            WorkerError::ScriptException(text) => assert!(text.contains("kaboom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn source_url_shows_up_in_stacks() {
        let engine = ScriptEngine::new().unwrap();
        let error = engine
            .eval(
                "function boom() { throw new Error('attributed'); } boom();",
                Some("https://example.com/sw.js"),
            )
            .unwrap_err();
        match error {
            WorkerError::ScriptException(text) => {
                assert!(text.contains("attributed"));
                assert!(text.contains("https://example.com/sw.js"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_promise_jobs_are_reported() {
        let engine = ScriptEngine::new().unwrap();
        engine
            .eval("Promise.resolve().then(() => { throw new Error('async boom'); });", None)
            .unwrap();
        assert!(engine.drain_jobs().is_some());
    }

    #[test]
    fn successful_jobs_report_nothing() {
        let engine = ScriptEngine::new().unwrap();
        engine
            .eval("globalThis.done = false; Promise.resolve().then(() => { globalThis.done = true; });", None)
            .unwrap();
        assert!(engine.drain_jobs().is_none());
        assert_eq!(engine.eval_json("globalThis.done", None).unwrap(), serde_json::json!(true));
    }
}
