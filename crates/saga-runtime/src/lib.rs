//! Building blocks the saga engine is assembled from.
//!
//! - [`RetryManager`]: retry decisions and exponential backoff
//! - [`TimeoutManager`] / [`ExecutionContext`]: deadlines and cancellation
//! - [`LockManager`]: per-saga mutual exclusion with a TTL
//! - [`EventBus`]: best-effort fan-out of saga events
//! - [`WorkerPool`]: panic-isolated background jobs

use std::any::Any;

mod event_bus;
mod lock;
mod retry;
mod timeout;
mod worker_pool;

pub use event_bus::{ALL_EVENTS, EventBus, EventHandler, SubscriptionId};
pub use lock::{InMemoryLockHandle, InMemoryLockManager, LockHandle, LockManager};
pub use retry::RetryManager;
pub use timeout::{DeadlineScope, ExecutionContext, TimeoutManager};
pub use worker_pool::{Submission, WorkerPool};

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}
