//! Data model and building blocks shared by the snaps controller and its collaborators.

mod config;
pub use config::{
    config_schema_json, load_config, write_schema_file, Config, ControllerConfig, ExecutionConfig,
};

pub mod checksum;
pub mod fsm;
pub mod permissions;
pub mod request_queue;
pub mod snap;
pub mod telemetry;
pub mod timer;
pub mod version;

#[cfg(test)]
mod test_support;

pub use permissions::{PermissionSet, PermissionsChange};
pub use snap::{
    BlockReason, ManifestSource, Snap, SnapId, SnapIdError, SnapManifest, SnapStatus,
    SnapSummary, StatusEvent, VersionHistoryEntry,
};
