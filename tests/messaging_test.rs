//! Port transfer between the host and a running worker.

use std::sync::mpsc;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use breakwater::environment::WorkerDelegate;
use breakwater::{
    CoreStorage, EnvironmentHandle, Event, EventPayload, IoPool, MessageChannel,
    RegistrationFactory, ReturnKind, ServiceWorker, WorkerError, WorkerHooks,
};

struct ScriptHost {
    source: String,
}

impl WorkerDelegate for ScriptHost {
    fn script_content(&self, _worker: &ServiceWorker) -> Result<String, WorkerError> {
        Ok(self.source.clone())
    }
}

fn start_worker(source: &str) -> (TempDir, Arc<ServiceWorker>, EnvironmentHandle, Arc<IoPool>) {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(CoreStorage::open(&dir.path().join("core.sqlite")).unwrap());
    let factory = RegistrationFactory::new(storage);
    let registration = factory
        .create(&url::Url::parse("https://example.com/").unwrap())
        .unwrap();
    let worker = factory
        .create_installing_worker(
            &url::Url::parse("https://example.com/sw.js").unwrap(),
            &registration,
        )
        .unwrap();
    let io = Arc::new(IoPool::new().unwrap());
    let hooks = WorkerHooks::new(Arc::new(ScriptHost {
        source: source.to_string(),
    }));
    let handle = worker.environment(&hooks, &io).unwrap();
    (dir, worker, handle, io)
}

#[test]
fn a_transferred_port_carries_messages_both_ways() {
    let source = r#"
        addEventListener('message', (event) => {
            const port = event.ports[0];
            port.onmessage = (reply) => { port.postMessage({ echo: reply.data }); };
            port.postMessage({ ready: true });
        });
    "#;
    let (_dir, _worker, handle, _io) = start_worker(source);

    let channel = MessageChannel::new();
    let (tx, rx) = mpsc::channel();
    channel.port1.on_message(Arc::new(move |event: &Event| {
        if let EventPayload::Message { data, .. } = event.payload() {
            let _ = tx.send(data.clone());
        }
    }));

    handle
        .dispatch_event(Event::message(
            "message",
            json!({ "kind": "hello" }),
            vec![channel.port2.clone()],
        ))
        .wait()
        .unwrap();

    let first = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert_eq!(first, json!({ "ready": true }));

    channel.port1.post_message(json!({ "n": 7 }), Vec::new()).unwrap();
    let second = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert_eq!(second, json!({ "echo": { "n": 7 } }));
}

#[test]
fn scripts_can_only_transfer_ports() {
    let (_dir, _worker, handle, _io) = start_worker("");

    let value = handle
        .evaluate(
            r#"
            (() => {
                const channel = new MessageChannel();
                try {
                    channel.port1.postMessage('x', [42]);
                    return 'no error';
                } catch (error) {
                    return error instanceof TypeError ? 'type error' : 'other';
                }
            })()
            "#,
            None,
            ReturnKind::Value,
        )
        .wait()
        .unwrap();
    assert_eq!(value, json!("type error"));
}

#[test]
fn a_port_closed_by_the_script_closes_its_host_pair() {
    let source = r#"
        addEventListener('message', (event) => {
            const port = event.ports[0];
            port.close();
            port.close();
            port.postMessage({ late: true });
        });
    "#;
    let (_dir, _worker, handle, _io) = start_worker(source);

    let channel = MessageChannel::new();
    handle
        .dispatch_event(Event::message(
            "message",
            json!(null),
            vec![channel.port2.clone()],
        ))
        .wait()
        .unwrap();

    assert!(channel.port1.is_closed());
    assert!(channel.port2.is_closed());
}

#[test]
fn messages_posted_after_close_are_dropped() {
    let source = r#"
        const channel = new MessageChannel();
        globalThis.got = [];
        channel.port2.onmessage = (event) => { got.push(event.data); };
        channel.port1.postMessage('before');
        channel.port1.close();
        channel.port1.postMessage('after');
    "#;
    let (_dir, _worker, handle, _io) = start_worker(source);

    let value = handle.evaluate("got", None, ReturnKind::Value).wait().unwrap();
    assert_eq!(value, json!(["before"]));
}

#[test]
fn channels_built_inside_the_script_deliver_locally() {
    let source = r#"
        const channel = new MessageChannel();
        channel.port2.onmessage = (event) => { globalThis.got = event.data; };
        channel.port1.postMessage({ hello: 1 });
    "#;
    let (_dir, _worker, handle, _io) = start_worker(source);

    let value = handle.evaluate("got", None, ReturnKind::Value).wait().unwrap();
    assert_eq!(value, json!({ "hello": 1 }));
}
