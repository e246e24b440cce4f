//! Closet Queue — durable task broker and worker.
//!
//! Work is described as [`Signature`]s (tasks, chains, chords), persisted in
//! SQLite and executed by [`Worker`]s at least once. Transient failures are
//! retried with exponential backoff; permanent failures run the error link
//! attached at submission.

pub mod broker;
pub mod schema;
pub mod signature;
pub mod worker;

pub use broker::{Delivery, FailureOutcome, TaskOutput, TaskQueue};
pub use signature::{JoinSlot, Link, Signature, TaskCall};
pub use worker::{TaskHandler, TaskRegistry, Worker};
