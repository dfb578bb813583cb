//! Background delivery of committed change events.
//!
//! Writers enqueue events while they still hold the store's commit lock, so
//! the queue order is the commit order. A single delivery thread drains the
//! queue, which keeps delivery to any one subscriber in that same order and
//! keeps slow callbacks off the write path.

use crate::error::StoreError;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::registry::SubscriberRegistry;
use super::types::{ChangeEvent, SubscriberId};

enum DispatchMessage<T> {
    Deliver {
        event: ChangeEvent<T>,
        recipients: Vec<SubscriberId>,
    },
    Flush(Sender<()>),
    Shutdown,
}

/// Owns the delivery thread of one store.
pub struct NotificationDispatcher<T> {
    sender: Sender<DispatchMessage<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    errors: Arc<Mutex<Vec<StoreError>>>,
}

impl<T: Clone + Send + 'static> NotificationDispatcher<T> {
    pub fn spawn(name: &str, registry: Arc<SubscriberRegistry<T>>) -> Self {
        let (sender, receiver) = unbounded();
        let errors = Arc::new(Mutex::new(Vec::new()));

        let worker_errors = Arc::clone(&errors);
        let spawned = thread::Builder::new()
            .name(format!("snapshot-notify-{}", name))
            .spawn(move || run(receiver, registry, worker_errors));

        let worker = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(store = name, error = %e, "failed to spawn notification thread");
                None
            }
        };

        Self {
            sender,
            worker: Mutex::new(worker),
            errors,
        }
    }

    /// Queue an event for the given recipients.
    pub fn enqueue(&self, event: ChangeEvent<T>, recipients: Vec<SubscriberId>) {
        if recipients.is_empty() {
            return;
        }
        if self
            .sender
            .send(DispatchMessage::Deliver { event, recipients })
            .is_err()
        {
            warn!("notification thread is gone, dropping event");
        }
    }

    /// Block until every event queued before this call has been delivered.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.sender.send(DispatchMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Delivery failures collected since the last call.
    pub fn take_errors(&self) -> Vec<StoreError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

impl<T> NotificationDispatcher<T> {
    /// Deliver what is queued, then stop the thread.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(DispatchMessage::Shutdown);
            // A callback holding the last reference to the store drops it on
            // the delivery thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<T> Drop for NotificationDispatcher<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: Clone + Send + 'static>(
    receiver: Receiver<DispatchMessage<T>>,
    registry: Arc<SubscriberRegistry<T>>,
    errors: Arc<Mutex<Vec<StoreError>>>,
) {
    for message in receiver.iter() {
        match message {
            DispatchMessage::Deliver { event, recipients } => {
                let report = registry.notify_subscribers(&event, &recipients);
                if !report.errors.is_empty() {
                    errors.lock().extend(report.errors);
                }
            }
            DispatchMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            DispatchMessage::Shutdown => break,
        }
    }
    debug!("notification thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotInput;
    use crate::subscriptions::{Subscriber, SubscriptionFilter};
    use crate::types::Timestamp;

    fn event(id: &str, value: u32) -> ChangeEvent<u32> {
        let snapshot = SnapshotInput::new(id, "orders", value).into_snapshot(Timestamp::now());
        ChangeEvent::created("store", &snapshot)
    }

    #[test]
    fn test_delivers_in_enqueue_order() {
        let registry = Arc::new(SubscriberRegistry::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.add_subscriber(Subscriber::new("a", SubscriptionFilter::all(), move |e: &ChangeEvent<u32>| {
            sink.lock().push(e.new_data.unwrap_or_default());
            Ok(())
        }));

        let dispatcher = NotificationDispatcher::spawn("test", Arc::clone(&registry));
        for i in 0..50 {
            dispatcher.enqueue(event("s", i), vec!["a".into()]);
        }
        dispatcher.flush();

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_collects_errors() {
        let registry = Arc::new(SubscriberRegistry::<u32>::new());
        registry.add_subscriber(Subscriber::new("bad", SubscriptionFilter::all(), |_e: &ChangeEvent<u32>| {
            Err("nope".to_string())
        }));

        let dispatcher = NotificationDispatcher::spawn("test", Arc::clone(&registry));
        dispatcher.enqueue(event("s1", 1), vec!["bad".into()]);
        dispatcher.flush();

        let errors = dispatcher.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(dispatcher.take_errors().is_empty());
    }

    #[test]
    fn test_flush_after_shutdown_returns() {
        let registry = Arc::new(SubscriberRegistry::<u32>::new());
        let dispatcher = NotificationDispatcher::spawn("test", registry);
        dispatcher.shutdown();
        dispatcher.flush();
    }
}
