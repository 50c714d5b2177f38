//! In-process stand-ins for everything the snaps controller consumes: a scripted execution
//! environment plus in-memory permission, registry, location and RPC hosts.

mod environment;
mod hosts;

pub use environment::{GuestScript, RpcBehaviour, ScriptedEnvironment};
pub use hosts::{
    default_permissions, manifest_for, MemoryLocations, MemoryPermissionHost, MemoryRegistry,
    StaticRpcHost,
};
