//! Polling consumers: one [`Poller`] task per [`ConsumerIdentity`], owned by
//! the [`ConsumerRegistry`].

pub mod identity;
pub mod poller;
pub mod registry;

pub use identity::{ConsumerIdentity, ConsumerParams};
pub use poller::Poller;
pub use registry::{ConsumerDeps, ConsumerRegistry, EnsureOutcome, RemoveOutcome};
