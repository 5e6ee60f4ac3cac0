//! Broker client capabilities (mechanics only).
//!
//! The pipeline needs very little from a pub/sub client:
//!
//! - **Consumer**: subscribe to a set of topics, poll a batch, commit a
//!   position, and be woken from another thread while a poll is blocked
//! - **Producer**: send a message and learn the outcome through a callback
//!
//! ## Delivery Guarantees
//!
//! Implementations are expected to give **at-least-once** delivery: anything
//! that was polled but not committed is delivered again after a consumer
//! restart. Consumers of this crate must tolerate duplicates.
//!
//! ## Asynchronous completion
//!
//! `send` and `commit_async` never report failure through their return value.
//! The outcome is handed to a callback, which may run on the calling thread
//! (in-memory broker) or on a transport thread (network brokers). Callers
//! must not assume either.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::message::{DeliveryReport, Message, OutgoingMessage, SourcePosition};

/// Completion callback for [`Producer::send`].
pub type DeliveryCallback = Box<dyn FnOnce(Result<DeliveryReport, BrokerError>) + Send + 'static>;

/// Completion callback for [`Consumer::commit_async`].
pub type CommitCallback = Box<dyn FnOnce(Result<(), BrokerError>) + Send + 'static>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("consumer is not subscribed to any topic")]
    NotSubscribed,

    #[error("send to topic {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("commit rejected: {0}")]
    CommitRejected(String),

    #[error("broker client is closed")]
    Closed,
}

/// Why a poll returned without a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    /// [`Consumer::wakeup`] was called while (or before) polling.
    #[error("poll interrupted by wakeup")]
    Woken,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Reading side of a broker client.
///
/// ## Thread Safety
///
/// A consumer is polled by exactly one thread. `wakeup` is the only method
/// meant to be called from other threads; it makes the current (or next)
/// `poll` return [`PollError::Woken`]. The trait requires `Send + Sync` so a
/// shared handle can be given to a shutdown hook.
pub trait Consumer: Send + Sync {
    /// Replace the subscription with `topics`.
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError>;

    /// Block for up to `timeout` waiting for messages.
    ///
    /// Returns an empty batch on timeout. Messages are returned in delivery
    /// order; the fetch position advances past them whether or not they are
    /// later committed.
    fn poll(&self, timeout: Duration) -> Result<Vec<Message>, PollError>;

    /// Commit progress up to and including `position` (best-effort).
    fn commit_async(&self, position: &SourcePosition, on_complete: CommitCallback);

    /// Interrupt a blocked `poll` from another thread.
    fn wakeup(&self);
}

/// Writing side of a broker client.
///
/// `send` is fire-and-forget from the caller's perspective: it must not wait
/// for the broker acknowledgement before returning.
pub trait Producer: Send + Sync {
    fn send(&self, message: OutgoingMessage, on_delivery: DeliveryCallback);
}

impl<C> Consumer for Arc<C>
where
    C: Consumer + ?Sized,
{
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError> {
        (**self).subscribe(topics)
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<Message>, PollError> {
        (**self).poll(timeout)
    }

    fn commit_async(&self, position: &SourcePosition, on_complete: CommitCallback) {
        (**self).commit_async(position, on_complete)
    }

    fn wakeup(&self) {
        (**self).wakeup()
    }
}

impl<P> Producer for Arc<P>
where
    P: Producer + ?Sized,
{
    fn send(&self, message: OutgoingMessage, on_delivery: DeliveryCallback) {
        (**self).send(message, on_delivery)
    }
}
