//! The service worker global scope: host functions under `__bw_*` names and
//! the bootstrap script that builds the script-facing API on top of them.
//! Scripts never see runtime objects directly; everything crosses the
//! boundary as JSON, numeric handles or listener keys.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::{Ctx, Function, IntoJs, Value};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};

use super::database::ScriptDatabase;
use super::{add_global_script_listener, dispatch_listeners, EnvShared};
use crate::cache::{CacheCallback, CacheMatchOptions};
use crate::clients::{ClientCallback, ClientListCallback, ClientRegistry, MatchAllOptions};
use crate::engine::{describe_exception, with_source_url, ScriptEngine};
use crate::error::WorkerError;
use crate::events::{Event, EventPayload};
use crate::fetch::{FetchRequest, FetchResponse, ImportCallback};
use crate::messaging::MessageChannel;

/// Raise a runtime error into the calling script.
fn throw_message<T>(ctx: &Ctx<'_>, error: impl std::fmt::Display) -> rquickjs::Result<T> {
    let message = error.to_string();
    debug!(target: "worker", %message, "raising error into script");
    let value = message.into_js(ctx)?;
    Err(ctx.throw(value))
}

/// Build the JS event object for `event`, registering any transferred ports
/// so the glue can wrap them.
pub(crate) fn make_event_value<'js>(
    ctx: &Ctx<'js>,
    shared: &EnvShared,
    event: &Event,
) -> rquickjs::Result<Value<'js>> {
    let (detail, handles) = match event.payload() {
        EventPayload::None => (json!({ "type": event.name() }), Vec::new()),
        EventPayload::Message { data, ports } => {
            let handles = ports
                .iter()
                .map(|port| shared.register_port(port.clone()))
                .collect();
            (json!({ "type": event.name(), "data": data }), handles)
        }
        EventPayload::Fetch(request) => {
            (json!({ "type": "fetch", "request": request }), Vec::new())
        }
    };
    let text = serde_json::to_string(&detail).map_err(|_| rquickjs::Error::Unknown)?;
    let make: Function = ctx.globals().get("__bw_makeEvent")?;
    make.call((text, handles))
}

/// Request shape as scripts hand it over; URLs may still be relative.
#[derive(Deserialize)]
struct RawRequest {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
}

/// URL parts for the `location` global, read-only on the script side.
fn location_descriptor(url: &url::Url) -> JsonValue {
    let hostname = url.host_str().unwrap_or("");
    let host = match url.port() {
        Some(port) => format!("{hostname}:{port}"),
        None => hostname.to_string(),
    };
    json!({
        "href": url.as_str(),
        "protocol": format!("{}:", url.scheme()),
        "host": host,
        "hostname": hostname,
        "port": url.port().map(|p| p.to_string()).unwrap_or_default(),
        "pathname": url.path(),
        "search": url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        "hash": url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        "origin": url.origin().ascii_serialization(),
    })
}

fn resolve_request(shared: &EnvShared, raw: RawRequest) -> Result<FetchRequest, WorkerError> {
    let url = shared.worker_url().join(&raw.url)?;
    Ok(FetchRequest {
        url,
        method: raw.method.unwrap_or_else(|| "GET".to_string()),
        headers: raw.headers.unwrap_or_default(),
        body: raw.body,
    })
}

fn single_client_callback(
    registry: Arc<ClientRegistry>,
    handle: super::EnvironmentHandle,
    pending: u32,
) -> ClientCallback {
    Box::new(move |result| match result {
        Ok(Some(host_client)) => {
            let proxy = registry.get_or_create(host_client);
            let descriptor = proxy.descriptor();
            handle.complete_pending_retaining(pending, Ok(descriptor), vec![proxy]);
        }
        Ok(None) => handle.complete_pending(pending, Ok(JsonValue::Null)),
        Err(error) => handle.complete_pending(pending, Err(error)),
    })
}

fn sanitize_database_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "database".to_string()
    } else {
        cleaned
    }
}

/// Install every host function and evaluate the bootstrap. Called once per
/// environment, before the main script runs.
pub(crate) fn install_global_scope(
    engine: &ScriptEngine,
    shared: &Rc<EnvShared>,
) -> Result<(), WorkerError> {
    engine.with_context(|ctx| {
        let global = ctx.globals();

        // console
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |level: String, message: String| {
                let worker = shared_ref.worker_id().to_string();
                match level.as_str() {
                    "error" => error!(target: "worker_script", worker = %worker, "{message}"),
                    "warn" => warn!(target: "worker_script", worker = %worker, "{message}"),
                    "debug" => debug!(target: "worker_script", worker = %worker, "{message}"),
                    _ => info!(target: "worker_script", worker = %worker, "{message}"),
                }
            })?
            .with_name("__bw_log")?;
            global.set("__bw_log", func)?;
        }

        // global event listeners
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |name: String, key: u32| {
                if !add_global_script_listener(&shared_ref, &name, key) {
                    debug!(target: "events", event = %name, "ignoring duplicate listener registration");
                }
            })?
            .with_name("__bw_add_listener")?;
            global.set("__bw_add_listener", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |name: String, key: u32| {
                shared_ref
                    .global_target()
                    .remove_script_listener(&name, shared_ref.handle().id(), key);
            })?
            .with_name("__bw_remove_listener")?;
            global.set("__bw_remove_listener", func)?;
        }

        // script-originated dispatchEvent
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, detail_json: String| -> rquickjs::Result<()> {
                    let detail: JsonValue = match serde_json::from_str(&detail_json) {
                        Ok(value) => value,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let name = detail["type"].as_str().unwrap_or("").to_string();
                    if name.is_empty() {
                        return throw_message(&ctx, "events must have a type");
                    }
                    let event = match detail.get("data") {
                        Some(JsonValue::Null) | None => Event::new(name),
                        Some(data) => Event::message(name, data.clone(), Vec::new()),
                    };
                    let js_event = make_event_value(&ctx, &shared_ref, &event)?;
                    dispatch_listeners(&shared_ref, &ctx, &event, &js_event);
                    Ok(())
                },
            )?
            .with_name("__bw_dispatch_event")?;
            global.set("__bw_dispatch_event", func)?;
        }

        // skipWaiting only flips the flag; the host reacts to it when it next
        // drives the lifecycle
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move || {
                match shared_ref.worker() {
                    Some(worker) => worker.set_skip_waiting_in_memory(true),
                    None => warn!(target: "worker", "skipWaiting called after worker was released"),
                }
            })?
            .with_name("__bw_skip_waiting")?;
            global.set("__bw_skip_waiting", func)?;
        }

        // importScripts: strictly sequential, the worker thread freezes while
        // the delegate loads each URL
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, urls: Vec<String>| -> rquickjs::Result<()> {
                    for raw in urls {
                        let url = match shared_ref.worker_url().join(&raw) {
                            Ok(url) => url,
                            Err(err) => return throw_message(&ctx, err),
                        };
                        let (tx, rx) = tokio::sync::oneshot::channel();
                        let import = shared_ref.hooks().import.clone();
                        let worker = shared_ref.worker();
                        let load_url = url.clone();
                        shared_ref.io().spawn_blocking(move || {
                            let Some(worker) = worker else {
                                let _ = tx.send(Err(WorkerError::EnvironmentStopped));
                                return;
                            };
                            let done: ImportCallback = Box::new(move |result| {
                                let _ = tx.send(result);
                            });
                            import.import_script(&worker, &load_url, done);
                        });
                        let content = match rx.blocking_recv() {
                            Ok(Ok(content)) => content,
                            Ok(Err(error)) => return throw_message(&ctx, error),
                            // delegate dropped the callback without answering
                            Err(_) => {
                                return throw_message(
                                    &ctx,
                                    WorkerError::DelegateNoResponse("importScripts"),
                                )
                            }
                        };
                        let script = with_source_url(&content, url.as_str());
                        if let Err(error) = ctx.eval::<(), _>(script.into_bytes()) {
                            return match error {
                                rquickjs::Error::Exception => {
                                    let caught = ctx.catch();
                                    Err(ctx.throw(caught))
                                }
                                other => throw_message(&ctx, other),
                            };
                        }
                        debug!(target: "worker", url = %url, "imported script");
                    }
                    Ok(())
                },
            )?
            .with_name("__bw_import_scripts")?;
            global.set("__bw_import_scripts", func)?;
        }

        // fetch
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, pending: u32, request_json: String| -> rquickjs::Result<()> {
                    let raw: RawRequest = match serde_json::from_str(&request_json) {
                        Ok(raw) => raw,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let request = match resolve_request(&shared_ref, raw) {
                        Ok(request) => request,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let handle = shared_ref.handle().clone();
                    let fetch = shared_ref.hooks().fetch.clone();
                    let worker = shared_ref.worker();
                    shared_ref.io().spawn_blocking(move || {
                        let Some(worker) = worker else {
                            handle.complete_pending(pending, Err(WorkerError::EnvironmentStopped));
                            return;
                        };
                        let completion_handle = handle.clone();
                        let done: Box<dyn FnOnce(Result<FetchResponse, WorkerError>) + Send> =
                            Box::new(move |result| {
                                let mapped = result.and_then(|response| {
                                    serde_json::to_value(response).map_err(WorkerError::from)
                                });
                                completion_handle.complete_pending(pending, mapped);
                            });
                        fetch.fetch(&worker, request, done);
                    });
                    Ok(())
                },
            )?
            .with_name("__bw_fetch")?;
            global.set("__bw_fetch", func)?;
        }

        // settle side of promises the script handed outward
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |id: u32, payload: Option<String>, error: Option<String>| {
                    let Some(pending) = shared_ref.remove_pending_out(id) else {
                        return;
                    };
                    match (payload, error) {
                        (_, Some(message)) => {
                            pending.reject(WorkerError::ScriptException(message));
                        }
                        (Some(text), None) => match serde_json::from_str(&text) {
                            Ok(value) => pending.fulfill(value),
                            Err(err) => pending.reject(WorkerError::from(err)),
                        },
                        (None, None) => pending.fulfill(JsonValue::Null),
                    }
                },
            )?
            .with_name("__bw_complete_out")?;
            global.set("__bw_complete_out", func)?;
        }

        // timers
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |delay: f64, repeating: bool| -> u32 {
                shared_ref.timers().schedule(shared_ref.io(), delay, repeating)
            })?
            .with_name("__bw_schedule_timer")?;
            global.set("__bw_schedule_timer", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |id: u32| {
                shared_ref.timers().cancel(id);
            })?
            .with_name("__bw_cancel_timer")?;
            global.set("__bw_cancel_timer", func)?;
        }

        // message channels and ports
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move || -> Vec<u32> {
                let channel = MessageChannel::new();
                let first = shared_ref.register_port(channel.port1.clone());
                let second = shared_ref.register_port(channel.port2.clone());
                vec![first, second]
            })?
            .with_name("__bw_channel_new")?;
            global.set("__bw_channel_new", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>,
                      handle: u32,
                      data_json: String,
                      transfer: Vec<u32>|
                      -> rquickjs::Result<()> {
                    let Some(port) = shared_ref.port(handle) else {
                        return throw_message(&ctx, "unknown MessagePort");
                    };
                    let data: JsonValue = match serde_json::from_str(&data_json) {
                        Ok(value) => value,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let mut ports = Vec::with_capacity(transfer.len());
                    for transferred in transfer {
                        match shared_ref.port(transferred) {
                            Some(port) => ports.push(port),
                            None => return throw_message(&ctx, "unknown MessagePort in transfer list"),
                        }
                    }
                    match port.post_message(data, ports) {
                        Ok(()) => Ok(()),
                        Err(err) => throw_message(&ctx, err),
                    }
                },
            )?
            .with_name("__bw_port_post")?;
            global.set("__bw_port_post", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |handle: u32| {
                if let Some(port) = shared_ref.port(handle) {
                    port.start();
                }
            })?
            .with_name("__bw_port_start")?;
            global.set("__bw_port_start", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            // closed handles leave the table; long-lived workers churn ports
            let func = Function::new(ctx.clone(), move |handle: u32| {
                if let Some(port) = shared_ref.remove_port(handle) {
                    port.close();
                }
            })?
            .with_name("__bw_port_close")?;
            global.set("__bw_port_close", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, handle: u32, name: String, key: u32| -> rquickjs::Result<()> {
                    let Some(port) = shared_ref.port(handle) else {
                        return throw_message(&ctx, "unknown MessagePort");
                    };
                    let callback =
                        crate::events::ScriptCallback::new(shared_ref.handle().clone(), key);
                    if !port.target().add_script_listener(&name, callback) {
                        debug!(target: "events", event = %name, "ignoring duplicate port listener");
                    }
                    Ok(())
                },
            )?
            .with_name("__bw_port_add_listener")?;
            global.set("__bw_port_add_listener", func)?;
        }

        // clients
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |pending: u32, client_id: String| {
                    let handle = shared_ref.handle().clone();
                    let Some(worker) = shared_ref.worker() else {
                        handle.complete_pending(pending, Err(WorkerError::EnvironmentStopped));
                        return;
                    };
                    let done = single_client_callback(
                        shared_ref.hooks().client_registry.clone(),
                        handle,
                        pending,
                    );
                    shared_ref.hooks().clients.get(&worker, &client_id, done);
                },
            )?
            .with_name("__bw_clients_get")?;
            global.set("__bw_clients_get", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, pending: u32, options_json: String| -> rquickjs::Result<()> {
                    let options: MatchAllOptions = match serde_json::from_str(&options_json) {
                        Ok(options) => options,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let handle = shared_ref.handle().clone();
                    let Some(worker) = shared_ref.worker() else {
                        handle.complete_pending(pending, Err(WorkerError::EnvironmentStopped));
                        return Ok(());
                    };
                    let registry = shared_ref.hooks().client_registry.clone();
                    let done: ClientListCallback = Box::new(move |result| match result {
                        Ok(host_clients) => {
                            let mut descriptors = Vec::with_capacity(host_clients.len());
                            let mut retain = Vec::with_capacity(host_clients.len());
                            for host_client in host_clients {
                                let proxy = registry.get_or_create(host_client);
                                descriptors.push(proxy.descriptor());
                                retain.push(proxy);
                            }
                            handle.complete_pending_retaining(
                                pending,
                                Ok(JsonValue::Array(descriptors)),
                                retain,
                            );
                        }
                        Err(error) => handle.complete_pending(pending, Err(error)),
                    });
                    shared_ref.hooks().clients.match_all(&worker, options, done);
                    Ok(())
                },
            )?
            .with_name("__bw_clients_match_all")?;
            global.set("__bw_clients_match_all", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, pending: u32, url: String| -> rquickjs::Result<()> {
                    let url = match shared_ref.worker_url().join(&url) {
                        Ok(url) => url,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let handle = shared_ref.handle().clone();
                    let Some(worker) = shared_ref.worker() else {
                        handle.complete_pending(pending, Err(WorkerError::EnvironmentStopped));
                        return Ok(());
                    };
                    let done = single_client_callback(
                        shared_ref.hooks().client_registry.clone(),
                        handle,
                        pending,
                    );
                    shared_ref.hooks().clients.open_window(&worker, &url, done);
                    Ok(())
                },
            )?
            .with_name("__bw_clients_open_window")?;
            global.set("__bw_clients_open_window", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |pending: u32| {
                let handle = shared_ref.handle().clone();
                let Some(worker) = shared_ref.worker() else {
                    handle.complete_pending(pending, Err(WorkerError::EnvironmentStopped));
                    return;
                };
                let done: Box<dyn FnOnce(Result<(), WorkerError>) + Send> =
                    Box::new(move |result| {
                        handle.complete_pending(pending, result.map(|()| JsonValue::Null));
                    });
                shared_ref.hooks().clients.claim(&worker, done);
            })?
            .with_name("__bw_clients_claim")?;
            global.set("__bw_clients_claim", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>,
                      client_id: String,
                      data_json: String,
                      transfer: Vec<u32>|
                      -> rquickjs::Result<()> {
                    let client = shared_ref
                        .surfaced_client(&client_id)
                        .or_else(|| shared_ref.hooks().client_registry.lookup(&client_id));
                    let Some(client) = client else {
                        return throw_message(&ctx, format!("unknown client: {client_id}"));
                    };
                    let data: JsonValue = match serde_json::from_str(&data_json) {
                        Ok(value) => value,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let mut ports = Vec::with_capacity(transfer.len());
                    for transferred in transfer {
                        match shared_ref.port(transferred) {
                            Some(port) => ports.push(port),
                            None => return throw_message(&ctx, "unknown MessagePort in transfer list"),
                        }
                    }
                    client.post_message(data, ports);
                    Ok(())
                },
            )?
            .with_name("__bw_client_post")?;
            global.set("__bw_client_post", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>,
                      pending: u32,
                      client_id: String,
                      method: String,
                      argument: Option<String>|
                      -> rquickjs::Result<()> {
                    let handle = shared_ref.handle().clone();
                    let client = shared_ref
                        .surfaced_client(&client_id)
                        .or_else(|| shared_ref.hooks().client_registry.lookup(&client_id));
                    let Some(client) = client else {
                        handle.complete_pending(
                            pending,
                            Err(WorkerError::Message(format!("unknown client: {client_id}"))),
                        );
                        return Ok(());
                    };
                    let done = single_client_callback(
                        shared_ref.hooks().client_registry.clone(),
                        handle.clone(),
                        pending,
                    );
                    match method.as_str() {
                        "focus" => client.focus(done),
                        "navigate" => {
                            let Some(target) = argument else {
                                return throw_message(&ctx, "navigate requires a URL");
                            };
                            let url = match shared_ref.worker_url().join(&target) {
                                Ok(url) => url,
                                Err(err) => return throw_message(&ctx, err),
                            };
                            client.navigate(&url, done);
                        }
                        other => done(Err(WorkerError::Message(format!(
                            "unknown client method: {other}"
                        )))),
                    }
                    Ok(())
                },
            )?
            .with_name("__bw_client_call")?;
            global.set("__bw_client_call", func)?;
        }

        // cache storage
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, pending: u32, op: String, args_json: String| -> rquickjs::Result<()> {
                    handle_cache_call(&ctx, &shared_ref, pending, &op, &args_json)
                },
            )?
            .with_name("__bw_caches_call")?;
            global.set("__bw_caches_call", func)?;
        }

        // script-opened databases
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, name: String| -> rquickjs::Result<u32> {
                    let Some(worker) = shared_ref.worker() else {
                        return throw_message(&ctx, WorkerError::EnvironmentStopped);
                    };
                    let directory = match shared_ref.hooks().worker.domain_storage_path(&worker) {
                        Ok(directory) => directory,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    let file = directory.join(format!("{}.sqlite", sanitize_database_name(&name)));
                    match ScriptDatabase::open(&name, &file) {
                        Ok(database) => Ok(shared_ref.insert_database(database)),
                        Err(err) => throw_message(&ctx, err),
                    }
                },
            )?
            .with_name("__bw_open_database")?;
            global.set("__bw_open_database", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, handle: u32, sql: String, params_json: String| -> rquickjs::Result<String> {
                    let params: Vec<JsonValue> = match serde_json::from_str(&params_json) {
                        Ok(params) => params,
                        Err(err) => return throw_message(&ctx, err),
                    };
                    match shared_ref.with_database(handle, |db| db.execute(&sql, &params)) {
                        Some(Ok(rows)) => Ok(rows.to_string()),
                        Some(Err(err)) => throw_message(&ctx, err),
                        None => throw_message(&ctx, "unknown database handle"),
                    }
                },
            )?
            .with_name("__bw_database_exec")?;
            global.set("__bw_database_exec", func)?;
        }
        {
            let shared_ref = Rc::clone(shared);
            let func = Function::new(ctx.clone(), move |handle: u32| {
                if let Some(database) = shared_ref.remove_database(handle) {
                    database.close();
                }
            })?
            .with_name("__bw_database_close")?;
            global.set("__bw_database_close", func)?;
        }

        // worker location, turned into a frozen object by the bootstrap
        {
            let text = serde_json::to_string(&location_descriptor(shared.worker_url()))
                .map_err(|_| rquickjs::Error::Unknown)?;
            global.set("__bw_location_json", text)?;
        }

        // the script-facing API on top of the host functions
        if let Err(error) = ctx.eval::<(), _>(SCOPE_BOOTSTRAP.as_bytes().to_vec()) {
            let detail = match &error {
                rquickjs::Error::Exception => describe_exception(&ctx),
                other => other.to_string(),
            };
            error!(target: "worker", %detail, "scope bootstrap failed");
            return Err(error);
        }
        Ok(())
    })
}

fn handle_cache_call(
    ctx: &Ctx<'_>,
    shared: &Rc<EnvShared>,
    pending: u32,
    op: &str,
    args_json: &str,
) -> rquickjs::Result<()> {
    #[derive(Deserialize)]
    struct CacheCallArgs {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        request: Option<RawRequest>,
        #[serde(default)]
        response: Option<FetchResponse>,
        #[serde(default)]
        options: Option<CacheMatchOptions>,
    }

    let handle = shared.handle().clone();
    let done: CacheCallback = Box::new(move |result| {
        handle.complete_pending(pending, result);
    });

    let Some(provider) = shared.hooks().cache.clone() else {
        done(Err(WorkerError::DelegateUnimplemented("caches")));
        return Ok(());
    };
    let Some(worker) = shared.worker() else {
        done(Err(WorkerError::EnvironmentStopped));
        return Ok(());
    };

    let args: CacheCallArgs = match serde_json::from_str(args_json) {
        Ok(args) => args,
        Err(err) => return throw_message(ctx, err),
    };
    let options = args.options.unwrap_or_default();

    let request = match args.request {
        Some(raw) => match resolve_request(shared, raw) {
            Ok(request) => Some(request),
            Err(err) => return throw_message(ctx, err),
        },
        None => None,
    };

    match (op, args.name, request) {
        ("match", _, Some(request)) => provider.match_request(&worker, request, options, done),
        ("has", Some(name), _) => provider.has(&worker, &name, done),
        ("open", Some(name), _) => provider.open(&worker, &name, done),
        ("delete", Some(name), _) => provider.delete(&worker, &name, done),
        ("keys", _, _) => provider.keys(&worker, done),
        ("cacheMatch", Some(name), Some(request)) => {
            provider.cache_match(&worker, &name, request, options, done)
        }
        ("cachePut", Some(name), Some(request)) => match args.response {
            Some(response) => provider.cache_put(&worker, &name, request, response, done),
            None => done(Err(WorkerError::message("cache.put requires a response"))),
        },
        ("cacheDelete", Some(name), Some(request)) => {
            provider.cache_delete(&worker, &name, request, options, done)
        }
        ("cacheKeys", Some(name), _) => provider.cache_keys(&worker, &name, done),
        (other, _, _) => done(Err(WorkerError::Message(format!(
            "malformed cache operation: {other}"
        )))),
    }
    Ok(())
}

const SCOPE_BOOTSTRAP: &str = r#"
(function (global) {
    'use strict';

    global.self = global;

    // console -----------------------------------------------------------
    function print(level) {
        return function () {
            var parts = [];
            for (var i = 0; i < arguments.length; i++) {
                var arg = arguments[i];
                if (typeof arg === 'string') { parts.push(arg); continue; }
                try { parts.push(JSON.stringify(arg)); }
                catch (_) { parts.push(String(arg)); }
            }
            __bw_log(level, parts.join(' '));
        };
    }
    global.console = {
        log: print('log'),
        info: print('info'),
        warn: print('warn'),
        error: print('error'),
        debug: print('debug'),
    };

    // location ------------------------------------------------------------
    (function () {
        var parts = JSON.parse(__bw_location_json);
        var entries = [];
        var query = parts.search ? parts.search.slice(1) : '';
        if (query) {
            var pieces = query.split('&');
            for (var i = 0; i < pieces.length; i++) {
                if (!pieces[i]) { continue; }
                var eq = pieces[i].indexOf('=');
                var name = eq < 0 ? pieces[i] : pieces[i].slice(0, eq);
                var value = eq < 0 ? '' : pieces[i].slice(eq + 1);
                entries.push([
                    decodeURIComponent(name.replace(/\+/g, ' ')),
                    decodeURIComponent(value.replace(/\+/g, ' ')),
                ]);
            }
        }
        parts.searchParams = Object.freeze({
            get: function (name) {
                for (var i = 0; i < entries.length; i++) {
                    if (entries[i][0] === name) { return entries[i][1]; }
                }
                return null;
            },
            getAll: function (name) {
                var all = [];
                for (var i = 0; i < entries.length; i++) {
                    if (entries[i][0] === name) { all.push(entries[i][1]); }
                }
                return all;
            },
            has: function (name) {
                for (var i = 0; i < entries.length; i++) {
                    if (entries[i][0] === name) { return true; }
                }
                return false;
            },
            toString: function () { return query; },
        });
        parts.toString = function () { return parts.href; };
        global.location = Object.freeze(parts);
    })();

    // promises settled by the host ---------------------------------------
    var pending = new Map();
    var nextPendingId = 1;
    function hostPromise(start) {
        return new Promise(function (resolve, reject) {
            var id = nextPendingId++;
            pending.set(id, { resolve: resolve, reject: reject });
            try { start(id); }
            catch (err) { pending.delete(id); reject(err); }
        });
    }
    global.__bw_settle = function (id, json, error) {
        var entry = pending.get(id);
        if (!entry) return;
        pending.delete(id);
        if (error !== null && error !== undefined) {
            entry.reject(new Error(error));
        } else {
            entry.resolve(json === null || json === undefined ? null : JSON.parse(json));
        }
    };

    // promises the script hands outward ----------------------------------
    global.__bw_forwardPromise = function (value, id) {
        Promise.resolve(value).then(
            function (result) {
                __bw_complete_out(id, result === undefined ? 'null' : JSON.stringify(result), null);
            },
            function (error) {
                var message;
                if (error && error.message !== undefined) {
                    message = error.stack ? error.message + '\n' + error.stack : error.message;
                } else {
                    message = String(error);
                }
                __bw_complete_out(id, null, message);
            }
        );
    };

    // event listeners -----------------------------------------------------
    var listeners = new Map();
    var nextListenerKey = 1;
    function listenerKey(fn) {
        if (typeof fn !== 'function') {
            throw new TypeError('listener must be a function');
        }
        if (!fn.__bwListenerKey) {
            Object.defineProperty(fn, '__bwListenerKey', { value: nextListenerKey++ });
        }
        listeners.set(fn.__bwListenerKey, fn);
        return fn.__bwListenerKey;
    }
    global.addEventListener = function (name, fn) {
        __bw_add_listener(String(name), listenerKey(fn));
    };
    global.removeEventListener = function (name, fn) {
        var key = (typeof fn === 'function' && fn.__bwListenerKey) ? fn.__bwListenerKey : 0;
        __bw_remove_listener(String(name), key);
    };
    global.dispatchEvent = function (event) {
        __bw_dispatch_event(JSON.stringify({
            type: event && event.type,
            data: event && event.data !== undefined ? event.data : null,
        }));
    };
    global.__bw_invoke = function (key, event) {
        var fn = listeners.get(key);
        if (fn) fn(event);
    };

    // events --------------------------------------------------------------
    global.__bw_makeEvent = function (json, portHandles) {
        var event = JSON.parse(json);
        event.ports = (portHandles || []).map(__bw_wrapPort);
        var lifetime = [];
        event.waitUntil = function (promise) { lifetime.push(promise); };
        event.__extendLifetimePromises = lifetime;
        return event;
    };
    global.__bw_finishEvent = function (event, id) {
        var promises = event && event.__extendLifetimePromises;
        if (!promises || promises.length === 0) return false;
        __bw_forwardPromise(Promise.all(promises), id);
        return true;
    };
    global.__bw_makeFetchEvent = function (json, outId) {
        var event = JSON.parse(json);
        event.__responded = false;
        event.respondWith = function (response) {
            if (event.__responded) {
                throw new TypeError('respondWith() has already been called on this event');
            }
            event.__responded = true;
            __bw_forwardPromise(response, outId);
        };
        event.waitUntil = function () {};
        return event;
    };

    // timers ---------------------------------------------------------------
    var timerCallbacks = new Map();
    function schedule(repeating) {
        return function (fn, delay) {
            var args = Array.prototype.slice.call(arguments, 2);
            var id = __bw_schedule_timer(Number(delay) || 0, repeating);
            timerCallbacks.set(id, function () { fn.apply(undefined, args); });
            return id;
        };
    }
    global.setTimeout = schedule(false);
    global.setInterval = schedule(true);
    global.clearTimeout = function (id) {
        __bw_cancel_timer(id);
        timerCallbacks.delete(id);
    };
    global.clearInterval = global.clearTimeout;
    global.__bw_fireTimer = function (id, repeating) {
        var callback = timerCallbacks.get(id);
        if (!callback) return;
        if (!repeating) timerCallbacks.delete(id);
        callback();
    };

    // message ports ---------------------------------------------------------
    var wrappedPorts = new Map();
    function MessagePort(handle) {
        this.__handle = handle;
        this.__onmessage = null;
        this.__closed = false;
    }
    MessagePort.prototype.postMessage = function (data, transfer) {
        var handles = (transfer || []).map(function (port) {
            if (!(port instanceof MessagePort)) {
                throw new TypeError('Only MessagePorts can be transferred');
            }
            return port.__handle;
        });
        if (this.__closed) { return; }
        __bw_port_post(this.__handle, JSON.stringify(data === undefined ? null : data), handles);
    };
    MessagePort.prototype.start = function () {
        if (this.__closed) { return; }
        __bw_port_start(this.__handle);
    };
    MessagePort.prototype.close = function () {
        if (this.__closed) { return; }
        this.__closed = true;
        wrappedPorts.delete(this.__handle);
        __bw_port_close(this.__handle);
    };
    MessagePort.prototype.addEventListener = function (name, fn) {
        if (this.__closed) { return; }
        __bw_port_add_listener(this.__handle, String(name), listenerKey(fn));
    };
    Object.defineProperty(MessagePort.prototype, 'onmessage', {
        get: function () { return this.__onmessage; },
        set: function (fn) {
            this.__onmessage = fn;
            this.addEventListener('message', fn);
            this.start();
        },
    });
    global.MessagePort = MessagePort;
    global.__bw_wrapPort = function (handle) {
        var port = wrappedPorts.get(handle);
        if (!port) {
            port = new MessagePort(handle);
            wrappedPorts.set(handle, port);
        }
        return port;
    };
    function MessageChannel() {
        var handles = __bw_channel_new();
        this.port1 = __bw_wrapPort(handles[0]);
        this.port2 = __bw_wrapPort(handles[1]);
    }
    global.MessageChannel = MessageChannel;

    // requests ---------------------------------------------------------------
    function requestShape(input) {
        if (typeof input === 'string') return { url: input };
        return input || {};
    }
    global.fetch = function (input, init) {
        var request = Object.assign({}, requestShape(input), init || {});
        return hostPromise(function (id) { __bw_fetch(id, JSON.stringify(request)); });
    };

    // lifecycle ---------------------------------------------------------------
    global.skipWaiting = function () {
        __bw_skip_waiting();
        return Promise.resolve();
    };
    global.importScripts = function () {
        var urls = Array.prototype.slice.call(arguments).map(String);
        __bw_import_scripts(urls);
    };

    // clients -------------------------------------------------------------------
    function reviveClient(descriptor) {
        if (!descriptor) return null;
        var client = Object.assign({}, descriptor);
        client.postMessage = function (data, transfer) {
            var handles = (transfer || []).map(function (port) {
                if (!(port instanceof MessagePort)) {
                    throw new TypeError('Only MessagePorts can be transferred');
                }
                return port.__handle;
            });
            __bw_client_post(descriptor.id, JSON.stringify(data === undefined ? null : data), handles);
        };
        if (descriptor.type === 'window') {
            client.focus = function () {
                return hostPromise(function (id) {
                    __bw_client_call(id, descriptor.id, 'focus', null);
                }).then(reviveClient);
            };
            client.navigate = function (url) {
                return hostPromise(function (id) {
                    __bw_client_call(id, descriptor.id, 'navigate', String(url));
                }).then(reviveClient);
            };
        }
        return client;
    }
    global.clients = {
        get: function (id) {
            return hostPromise(function (pendingId) {
                __bw_clients_get(pendingId, String(id));
            }).then(reviveClient);
        },
        matchAll: function (options) {
            return hostPromise(function (pendingId) {
                __bw_clients_match_all(pendingId, JSON.stringify(options || {}));
            }).then(function (list) { return (list || []).map(reviveClient); });
        },
        openWindow: function (url) {
            return hostPromise(function (pendingId) {
                __bw_clients_open_window(pendingId, String(url));
            }).then(reviveClient);
        },
        claim: function () {
            return hostPromise(function (pendingId) { __bw_clients_claim(pendingId); });
        },
    };

    // caches -----------------------------------------------------------------
    function cachesCall(op, args) {
        return hostPromise(function (id) {
            __bw_caches_call(id, op, JSON.stringify(args || {}));
        });
    }
    function makeCache(name) {
        return {
            match: function (request, options) {
                return cachesCall('cacheMatch', { name: name, request: requestShape(request), options: options });
            },
            put: function (request, response) {
                return cachesCall('cachePut', { name: name, request: requestShape(request), response: response });
            },
            delete: function (request, options) {
                return cachesCall('cacheDelete', { name: name, request: requestShape(request), options: options });
            },
            keys: function () {
                return cachesCall('cacheKeys', { name: name });
            },
        };
    }
    global.caches = {
        match: function (request, options) {
            return cachesCall('match', { request: requestShape(request), options: options });
        },
        has: function (name) { return cachesCall('has', { name: String(name) }); },
        open: function (name) {
            return cachesCall('open', { name: String(name) }).then(function () {
                return makeCache(String(name));
            });
        },
        delete: function (name) { return cachesCall('delete', { name: String(name) }); },
        keys: function () { return cachesCall('keys', {}); },
    };

    // databases -----------------------------------------------------------------
    global.openDatabase = function (name) {
        var handle = __bw_open_database(String(name));
        return {
            execute: function (sql, params) {
                return JSON.parse(__bw_database_exec(handle, String(sql), JSON.stringify(params || [])));
            },
            close: function () { __bw_database_close(handle); },
        };
    };
})(globalThis);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names_become_safe_filenames() {
        assert_eq!(sanitize_database_name("notes"), "notes");
        assert_eq!(sanitize_database_name("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_database_name(""), "database");
    }
}
