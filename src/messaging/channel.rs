use super::port::MessagePort;

/// A pair of entangled ports. Whatever is posted on one arrives at the other.
#[derive(Clone, Debug)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (port1, port2) = MessagePort::create_pair();
        MessageChannel { port1, port2 }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        MessageChannel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventPayload, PayloadKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn collect_data(sink: Arc<Mutex<Vec<serde_json::Value>>>) -> crate::events::NativeHandler {
        Arc::new(move |event: &Event| {
            if let EventPayload::Message { data, .. } = event.payload() {
                sink.lock().unwrap().push(data.clone());
            }
        })
    }

    #[test]
    fn messages_queue_until_start() {
        let channel = MessageChannel::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        channel.port2.target().add_native_listener(
            "message",
            Some(PayloadKind::Message),
            collect_data(Arc::clone(&received)),
        );

        channel.port1.post_message(json!(1), Vec::new()).unwrap();
        channel.port1.post_message(json!(2), Vec::new()).unwrap();
        channel.port1.post_message(json!(3), Vec::new()).unwrap();
        assert!(received.lock().unwrap().is_empty());

        channel.port2.start();
        assert_eq!(*received.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);

        channel.port1.post_message(json!(4), Vec::new()).unwrap();
        assert_eq!(received.lock().unwrap().len(), 4);
    }

    #[test]
    fn start_is_idempotent() {
        let channel = MessageChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        channel.port2.target().add_native_listener(
            "message",
            Some(PayloadKind::Message),
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        channel.port1.post_message(json!("once"), Vec::new()).unwrap();
        channel.port2.start();
        channel.port2.start();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_message_implicitly_starts() {
        let channel = MessageChannel::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        channel.port1.post_message(json!("early"), Vec::new()).unwrap();
        channel.port2.on_message(collect_data(Arc::clone(&received)));
        assert_eq!(*received.lock().unwrap(), vec![json!("early")]);
    }

    #[test]
    fn close_stops_both_ends() {
        let channel = MessageChannel::new();
        channel.port2.start();
        channel.port1.close();
        assert!(channel.port1.is_closed());
        assert!(channel.port2.is_closed());
        assert!(channel.port2.post_message(json!("late"), Vec::new()).is_ok());
    }

    #[test]
    fn dropping_a_port_closes_its_pair() {
        let channel = MessageChannel::new();
        let keeper = channel.port2.clone();
        assert!(!keeper.is_closed());
        // port1 goes away entirely, which closes the channel from its side
        drop(channel);
        assert!(keeper.is_closed());
    }

    #[test]
    fn transferred_ports_arrive_with_the_message() {
        let outer = MessageChannel::new();
        let inner = MessageChannel::new();
        let seen_ports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen_ports);
        outer.port2.on_message(Arc::new(move |event: &Event| {
            if let EventPayload::Message { ports, .. } = event.payload() {
                sink.lock().unwrap().extend(ports.iter().map(|p| p.id()));
            }
        }));
        outer
            .port1
            .post_message(json!("take this"), vec![inner.port2.clone()])
            .unwrap();
        assert_eq!(*seen_ports.lock().unwrap(), vec![inner.port2.id()]);
    }
}
