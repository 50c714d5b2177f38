//! Controller for untrusted snaps: installs them, runs each one in its own isolated session and
//! routes requests to them under permission, time and queue limits.
//!
//! Hosts build a [`SnapController`] from a [`snaps_core::Config`] and a [`ControllerDeps`]
//! bundle of collaborators, then drive it through its async methods. Lifecycle changes are
//! published on the [`snaps_events::Bus`] passed in.

pub mod capabilities;
mod controller;
pub mod error;
pub mod execution;
mod lifecycle;
mod runtime;
mod singleflight;
pub mod store;
pub mod tasks;

pub use capabilities::{CapabilityRegistry, Endowment};
pub use controller::{ControllerDeps, HandleRequest, InstallRequest, RollbackSnapshot, SnapController};
pub use error::{ErrorKind, SnapError};
pub use execution::{ExecutionError, ExecutionEvent, ExecutionService};
pub use store::{ControllerState, SnapErrorEntry, SnapStore, StoreError};
