//! In-process brokers
//!
//! Two adapters that implement [`BrokerPort`](crate::port::BrokerPort)
//! without any external infrastructure, each faithful to one topology kind:
//!
//! - [`MemoryQueueBroker`]: exchange/queue/routing-key semantics, resolved
//!   through the AMQP descriptors
//! - [`MemoryLogBroker`]: partitioned append-only topics with consumer group
//!   offsets, resolved through the Kafka descriptors
//!
//! Suitable for single-process deployments and tests.

mod queue;
mod topic;

pub use queue::MemoryQueueBroker;
pub use topic::MemoryLogBroker;

use std::sync::{Mutex, MutexGuard, PoisonError};

// State stays consistent across a panic: every critical section is a single
// collection update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
