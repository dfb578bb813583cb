//! Subscriber registry and fan-out.

use crate::error::StoreError;
use crossbeam_channel::{bounded, TrySendError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use super::types::{
    ChangeEvent, NotificationReport, Subscriber, SubscriberId, SubscriptionFilter,
    SubscriptionHandle,
};

/// Tracks the subscribers of one store and fans events out to them.
pub struct SubscriberRegistry<T> {
    /// Active subscribers by ID.
    subscribers: RwLock<BTreeMap<SubscriberId, Subscriber<T>>>,
}

impl<T: Clone + Send + 'static> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a subscriber. Re-registering an id replaces its filter and
    /// callback, so it is still delivered to once per change.
    pub fn add_subscriber(&self, subscriber: Subscriber<T>) {
        let replaced = self
            .subscribers
            .write()
            .insert(subscriber.id.clone(), subscriber);
        if let Some(previous) = replaced {
            debug!(subscriber = %previous.id, "replaced subscriber registration");
        }
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn remove_subscriber(&self, id: &SubscriberId) -> bool {
        self.subscribers.write().remove(id).is_some()
    }

    /// Register a subscriber that receives events through a bounded channel.
    ///
    /// A full buffer or a dropped receiver is reported as a delivery failure.
    pub fn subscribe_channel(
        &self,
        id: impl Into<SubscriberId>,
        filter: SubscriptionFilter,
        buffer_size: usize,
    ) -> SubscriptionHandle<T> {
        let id = id.into();
        let (sender, receiver) = bounded(buffer_size.max(1));

        let subscriber = Subscriber::new(id.clone(), filter, move |event: &ChangeEvent<T>| {
            match sender.try_send(event.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err("buffer overflow".to_string()),
                Err(TrySendError::Disconnected(_)) => Err("receiver disconnected".to_string()),
            }
        });
        self.add_subscriber(subscriber);

        SubscriptionHandle { id, receiver }
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.subscribers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.subscribers.write().clear();
    }

    /// Subscribers whose filter matches the event.
    pub fn matching(&self, event: &ChangeEvent<T>) -> Vec<SubscriberId> {
        self.subscribers
            .read()
            .values()
            .filter(|sub| sub.filter.matches(event))
            .map(|sub| sub.id.clone())
            .collect()
    }

    /// Of `candidates`, the registered subscribers whose filter matches.
    pub fn matching_among(
        &self,
        event: &ChangeEvent<T>,
        candidates: &[SubscriberId],
    ) -> Vec<SubscriberId> {
        let subs = self.subscribers.read();
        let unique: BTreeSet<&SubscriberId> = candidates.iter().collect();
        unique
            .into_iter()
            .filter(|id| subs.get(*id).map_or(false, |sub| sub.filter.matches(event)))
            .cloned()
            .collect()
    }

    /// Deliver `event` to each listed subscriber whose filter matches.
    ///
    /// Each subscriber is called at most once even if listed twice. Callback
    /// errors and panics are collected into the report.
    pub fn notify_subscribers(
        &self,
        event: &ChangeEvent<T>,
        recipients: &[SubscriberId],
    ) -> NotificationReport {
        // Callbacks run without the registry lock so they may (un)subscribe.
        let targets: Vec<Subscriber<T>> = {
            let subs = self.subscribers.read();
            let unique: BTreeSet<&SubscriberId> = recipients.iter().collect();
            unique
                .into_iter()
                .filter_map(|id| subs.get(id))
                .filter(|sub| sub.filter.matches(event))
                .cloned()
                .collect()
        };

        let mut report = NotificationReport::default();
        for sub in targets {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(reason),
                Err(_) => Some("callback panicked".to_string()),
            };
            if let Some(reason) = failure {
                warn!(subscriber = %sub.id, topic = event.topic(), %reason, "subscriber delivery failed");
                report.errors.push(StoreError::SubscriberDeliveryFailed {
                    subscriber: sub.id.to_string(),
                    reason,
                });
            }
            report.notified.push(sub.id);
        }
        report
    }

    /// Deliver to every matching subscriber.
    pub fn broadcast(&self, event: &ChangeEvent<T>) -> NotificationReport {
        let recipients = self.matching(event);
        self.notify_subscribers(event, &recipients)
    }
}

impl<T: Clone + Send + 'static> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
