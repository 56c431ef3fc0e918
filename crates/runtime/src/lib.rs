//! cao runtime: controllers, their work queues and reconcile workers, and the
//! [`Manager`] that runs them against one shared cache.

#![forbid(unsafe_code)]

mod controller;
mod engine;
mod lifecycle;
mod queue;
mod reconciler;

pub use cao_core::{Action, Backoff, ReconcileResult};
pub use controller::{map_to_owner, Controller, ControllerOptions, Mapper};
pub use lifecycle::{DrainOutcome, Manager, ManagerError, ManagerOptions, RegistrationError};
pub use queue::WorkQueue;
pub use reconciler::{Reconciler, Request};
