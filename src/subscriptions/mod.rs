//! Subscriber registry and change notification.
//!
//! This module provides in-process notification of store changes:
//! - Snapshot creates, updates, deletes and expirations
//! - Batch fetches (delivered to the subscribers named by the caller)
//! - Store clears
//!
//! Subscriptions support:
//! - Filtering by snapshot id, category, topic and tag
//! - Callback or bounded-channel delivery
//! - Per-subscriber delivery in commit order on a background thread
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe_channel("orders-view", SubscriptionFilter::category("orders"));
//!
//! store.update_snapshot("s1", json!({"total": 20}))?;
//! store.flush_notifications();
//!
//! match handle.try_recv() {
//!     Ok(event) => println!("{} {:?}", event.topic(), event.new_data),
//!     Err(_) => println!("nothing yet"),
//! }
//! ```

mod dispatcher;
mod registry;
mod types;

pub use dispatcher::NotificationDispatcher;
pub use registry::SubscriberRegistry;
pub use types::{
    ChangeEvent, ChangeKind, NotificationReport, Subscriber, SubscriberCallback, SubscriberId,
    SubscriptionFilter, SubscriptionHandle,
};
