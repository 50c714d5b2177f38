use std::sync::Arc;

use json_patch::Patch;
use semver::Version;
use serde_json::json;
use snaps_core::{PermissionSet, SnapId, SnapStatus};
use snaps_topics as topics;
use tracing::{info, warn};

use super::SnapController;
use crate::error::SnapError;

/// What it takes to undo an in-flight update: inverse patches over the snap record and its state
/// (newest last), the permissions the update revoked and the names it granted.
#[derive(Debug, Clone, Default)]
pub struct RollbackSnapshot {
    pub(crate) patches: Vec<Patch>,
    pub(crate) revoked: PermissionSet,
    pub(crate) granted: Vec<String>,
    pub(crate) new_version: Option<Version>,
}

impl RollbackSnapshot {
    pub(crate) fn record(&mut self, patch: Patch) {
        if !patch.0.is_empty() {
            self.patches.push(patch);
        }
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    pub fn new_version(&self) -> Option<&Version> {
        self.new_version.as_ref()
    }
}

impl SnapController {
    pub fn rollback_snapshot(&self, snap_id: &SnapId) -> Option<RollbackSnapshot> {
        self.snapshots.lock().get(snap_id).cloned()
    }

    /// Undo an update: restore the previous record and state, give back revoked permissions,
    /// take away granted ones and leave the snap stopped.
    pub async fn rollback_snap(self: &Arc<Self>, snap_id: &SnapId) -> Result<(), SnapError> {
        let Some(snapshot) = self.rollback_snapshot(snap_id) else {
            return Err(SnapError::contract(
                "A snapshot does not exist in memory for rollback",
            ));
        };

        if self.is_running(snap_id) {
            self.stop_snap(snap_id).await?;
        }
        self.store.apply_inverse(snap_id, &snapshot.patches)?;
        self.force_status(snap_id, SnapStatus::Stopped);

        if !snapshot.revoked.is_empty() {
            self.permissions
                .grant(snap_id, snapshot.revoked.clone())
                .await?;
        }
        if !snapshot.granted.is_empty() {
            self.permissions.revoke(snap_id, &snapshot.granted).await?;
        }

        let version = self.get(snap_id).map(|snap| snap.version);
        self.snapshots.lock().remove(snap_id);
        warn!(
            target: "snaps::controller",
            snap = %snap_id,
            from = ?snapshot.new_version,
            to = ?version,
            "snap rolled back"
        );
        self.bus.publish(
            topics::TOPIC_SNAP_ROLLED_BACK,
            &json!({
                "snapId": snap_id,
                "version": version,
                "rolledBackFrom": snapshot.new_version,
            }),
        );
        self.persist().await;
        Ok(())
    }

    /// Roll back several snaps. Every snapshot must exist before anything is undone.
    pub async fn rollback_snaps(self: &Arc<Self>, snap_ids: &[SnapId]) -> Result<(), SnapError> {
        {
            let snapshots = self.snapshots.lock();
            if snap_ids.iter().any(|snap_id| !snapshots.contains_key(snap_id)) {
                return Err(SnapError::contract(
                    "A snapshot does not exist in memory for rollback",
                ));
            }
        }
        for snap_id in snap_ids {
            self.rollback_snap(snap_id).await?;
        }
        if !snap_ids.is_empty() {
            info!(target: "snaps::controller", count = snap_ids.len(), "rollback complete");
        }
        Ok(())
    }
}
