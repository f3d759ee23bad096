//! # Sluice Core
//!
//! Core library for Sluice, a controller that turns declarative bucket
//! triggers into background pollers. Each poller watches one bucket prefix for
//! objects that appeared or changed since its last checkpoint and invokes a
//! function once per discovered object.
//!
//! ## Overview
//!
//! - **Storage scanning**: list a bucket prefix and keep the objects modified
//!   strictly after a checkpoint ([`storage`])
//! - **Polling consumers**: one task per trigger/function pair that scans,
//!   dispatches, and advances its checkpoint ([`consumer`])
//! - **Dispatch**: bounded worker pools that invoke functions over HTTP
//!   ([`dispatch`])
//! - **Reconciliation**: keep the live set of consumers aligned with the
//!   declared triggers and persist checkpoints back to trigger status
//!   ([`reconciler`], [`checkpoint`])
//! - **Collaborators**: trigger/function registries and object listers behind
//!   traits, with in-memory and file/object-store implementations
//!   ([`registry`], [`storage`])
//!
//! ## Data flow
//!
//! ```text
//! registry watch -> Reconciler -> ConsumerRegistry::ensure/remove
//!                                      |
//!                                   Poller -> Scanner -> DispatchPool -> FunctionInvoker
//!                                      |
//!                           CheckpointAdvance -> CheckpointWriter -> registry status
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Checkpoint codec, reader, and status writer
pub mod checkpoint;
/// Tunables shared by the engine components
pub mod config;
/// Consumer identities, pollers, and the consumer registry
pub mod consumer;
/// Function invocation and per-consumer worker pools
pub mod dispatch;
/// Error types
pub mod error;
/// Trigger reconciliation state machine
pub mod reconciler;
/// Trigger and function registry collaborators
pub mod registry;
/// Wiring for a complete engine instance
pub mod runtime;
/// Kubernetes-style label selectors
pub mod selector;
/// Object listing and the checkpoint-aware scanner
pub mod storage;
/// Trigger, function, and object data model
pub mod types;

pub use error::{Result, SluiceError};
