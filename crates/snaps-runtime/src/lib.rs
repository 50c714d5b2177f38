//! Interfaces the controller consumes from its host: isolated execution environments, the
//! permission system, the registry and package locations.

pub mod environment;
pub mod host;
pub mod mux;
pub mod transport;

pub use environment::{ContextHandle, EnvironmentError, EnvironmentFactory};
pub use host::{
    ApprovalKind, ApprovalRequest, ApprovalResponse, ApprovalResult, HostError, LocationError,
    LocationResolver, PermissionHost, RegistryQuery, RegistryStatus, RegistryVerdict,
    SnapLocation, SnapRegistry, SnapRpcHost, VirtualFile,
};
pub use mux::{ChannelMux, MuxError, SubChannel, SubChannelSender};
pub use transport::Transport;
