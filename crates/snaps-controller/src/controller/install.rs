use std::collections::BTreeMap;
use std::sync::Arc;

use semver::VersionReq;
use serde::{Deserialize, Serialize};
use serde_json::json;
use snaps_core::checksum::verify_source;
use snaps_core::permissions::{permission_names, validate_requested};
use snaps_core::version::{is_valid_update, resolve_version_range, satisfies};
use snaps_core::{PermissionsChange, Snap, SnapId, SnapManifest, SnapStatus, SnapSummary, StatusEvent};
use snaps_protocol::HandlerType;
use snaps_runtime::{
    ApprovalKind, ApprovalRequest, ApprovalResult, RegistryQuery, RegistryStatus, SnapLocation,
};
use snaps_topics as topics;
use tracing::{debug, error, info, warn};

use super::rpc::HandleRequest;
use super::{RollbackSnapshot, SnapController};
use crate::capabilities::requires_allowlist;
use crate::error::SnapError;
use crate::runtime::SnapRuntime;

/// Origin used when the controller itself calls a snap's lifecycle hooks.
const HOST_ORIGIN: &str = "snaps-controller";

/// Per-snap entry of an install batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl InstallRequest {
    pub fn version(range: impl Into<String>) -> Self {
        Self {
            version: Some(range.into()),
        }
    }
}

struct Fetched {
    manifest: SnapManifest,
    source_code: String,
}

#[derive(Default)]
struct Batch {
    results: BTreeMap<SnapId, SnapSummary>,
    installs: Vec<SnapId>,
    updates: Vec<SnapId>,
}

impl SnapController {
    /// Install or update every snap in `requested`, keyed by snap id.
    ///
    /// The batch is all-or-nothing: when any entry fails, snaps freshly installed by this call
    /// are removed and snaps it updated are rolled back before the error is returned.
    pub async fn install(
        self: &Arc<Self>,
        origin: &str,
        requested: BTreeMap<String, InstallRequest>,
    ) -> Result<BTreeMap<SnapId, SnapSummary>, SnapError> {
        let mut batch = Batch::default();
        match self.install_batch(origin, &requested, &mut batch).await {
            Ok(()) => {
                for snap_id in &batch.installs {
                    if let Some(summary) = batch.results.get(snap_id) {
                        self.bus.publish(
                            topics::TOPIC_SNAP_INSTALLED,
                            &json!({"snapId": snap_id, "version": summary.version, "origin": origin}),
                        );
                    }
                }
                let mut snapshots = self.snapshots.lock();
                for snap_id in batch.results.keys() {
                    snapshots.remove(snap_id);
                }
                Ok(batch.results)
            }
            Err(err) => {
                error!(target: "snaps::controller", %origin, error = %err, "install batch failed, compensating");
                let installed: Vec<SnapId> = batch
                    .installs
                    .into_iter()
                    .filter(|snap_id| self.has(snap_id))
                    .collect();
                if let Err(remove) = self.remove_snaps(&installed).await {
                    error!(target: "snaps::controller", error = %remove, "failed to remove snaps after install failure");
                }
                let snapshotted: Vec<SnapId> = {
                    let snapshots = self.snapshots.lock();
                    batch
                        .updates
                        .into_iter()
                        .filter(|snap_id| snapshots.contains_key(snap_id))
                        .collect()
                };
                if let Err(rollback) = self.rollback_snaps(&snapshotted).await {
                    error!(target: "snaps::controller", error = %rollback, "failed to roll back snaps after update failure");
                }
                Err(err)
            }
        }
    }

    async fn install_batch(
        self: &Arc<Self>,
        origin: &str,
        requested: &BTreeMap<String, InstallRequest>,
        batch: &mut Batch,
    ) -> Result<(), SnapError> {
        for (raw_id, request) in requested {
            let snap_id = SnapId::parse(raw_id)?;
            let range = resolve_version_range(request.version.as_deref())?;
            let location = self.locations.detect(&snap_id, &range)?;

            if let Some(existing) = self.get(&snap_id) {
                if !location.should_always_reload() {
                    if satisfies(&existing.version, &range) {
                        batch.results.insert(snap_id, existing.summary());
                        continue;
                    }
                    batch.updates.push(snap_id.clone());
                    let summary = self
                        .update_inner(origin, &snap_id, location.as_ref(), &range)
                        .await?;
                    batch.results.insert(snap_id, summary);
                    continue;
                }
            }

            let flight = self.install_flights.begin(&format!("install:{snap_id}"), || {
                let controller = self.clone();
                let origin = origin.to_string();
                let snap_id = snap_id.clone();
                async move {
                    controller
                        .fresh_install(origin, snap_id, location, range)
                        .await
                }
            });
            if flight.is_leader() {
                batch.installs.push(snap_id.clone());
            }
            let summary = flight
                .wait()
                .await
                .unwrap_or_else(|| Err(SnapError::contract("snap install was abandoned")))?;
            batch.results.insert(snap_id, summary);
        }
        Ok(())
    }

    /// Update one installed snap to the newest release inside `version`.
    ///
    /// Returns the current summary without fetching anything when the installed version already
    /// satisfies the range.
    pub async fn update(
        self: &Arc<Self>,
        origin: &str,
        snap_id: &SnapId,
        version: Option<&str>,
    ) -> Result<SnapSummary, SnapError> {
        let range = resolve_version_range(version)?;
        let snap = self.get_expect(snap_id)?;
        if satisfies(&snap.version, &range) {
            debug!(target: "snaps::controller", snap = %snap_id, %range, "installed version satisfies range");
            return Ok(snap.summary());
        }
        let requested = BTreeMap::from([(snap_id.to_string(), InstallRequest::version(range.to_string()))]);
        let mut results = self.install(origin, requested).await?;
        results
            .remove(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))
    }

    async fn fresh_install(
        self: Arc<Self>,
        origin: String,
        snap_id: SnapId,
        location: Arc<dyn SnapLocation>,
        range: VersionReq,
    ) -> Result<SnapSummary, SnapError> {
        if location.should_always_reload() && self.is_running(&snap_id) {
            self.stop_snap(&snap_id).await?;
        }
        let fetched = self.fetch(&snap_id, location.as_ref()).await?;
        let version = &fetched.manifest.version;
        if !satisfies(version, &range) {
            return Err(SnapError::Validation(format!(
                "Version mismatch. Manifest for \"{snap_id}\" specifies version \"{version}\" which doesn't satisfy requested version range \"{range}\"."
            )));
        }
        self.assert_install_allowed(&snap_id, &fetched.manifest).await?;
        validate_requested(
            &fetched.manifest.initial_permissions,
            &self.capabilities.handler_permissions(),
            &self.config.excluded_permissions,
        )?;

        self.add(&origin, &snap_id, fetched);
        self.approve_install(&origin, &snap_id).await?;
        self.call_lifecycle_hook(&snap_id, HandlerType::OnInstall).await;
        info!(target: "snaps::controller", snap = %snap_id, %origin, "snap installed");
        self.persist().await;
        self.get_summary(&snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))
    }

    /// Store a fresh record. Enablement and block state of a record it replaces are kept.
    fn add(&self, origin: &str, snap_id: &SnapId, fetched: Fetched) {
        let Fetched {
            manifest,
            source_code,
        } = fetched;
        let version = manifest.version.clone();
        let mut runtimes = self.runtimes.lock();
        self.store.update(|state| {
            let mut snap = Snap::new(snap_id.clone(), manifest, source_code, origin);
            if let Some(previous) = state.snaps.get(snap_id) {
                snap.enabled = previous.enabled;
                snap.blocked = previous.blocked;
                snap.block_information = previous.block_information.clone();
            }
            state.snaps.insert(snap_id.clone(), snap);
        });
        runtimes.insert(
            snap_id.clone(),
            SnapRuntime::new(
                self.machine.clone(),
                SnapStatus::Installing,
                self.config.max_queue_size,
            ),
        );
        drop(runtimes);
        debug!(target: "snaps::controller", snap = %snap_id, %version, "snap added");
        self.bus.publish(
            topics::TOPIC_SNAP_ADDED,
            &json!({"snapId": snap_id, "version": version}),
        );
    }

    async fn approve_install(self: &Arc<Self>, origin: &str, snap_id: &SnapId) -> Result<(), SnapError> {
        let snap = self.get_expect(snap_id)?;
        let approval_id = uuid::Uuid::new_v4().to_string();
        let request = ApprovalRequest {
            id: approval_id.clone(),
            origin: origin.to_string(),
            snap_id: snap_id.clone(),
            kind: ApprovalKind::Install,
            permissions: snap.initial_permissions.clone(),
            change: None,
            current_version: None,
            new_version: snap.version.clone(),
        };
        let outcome = async {
            let response = self.permissions.request_approval(request).await?;
            let granted = permission_names(&response.permissions);
            self.permissions
                .grant(snap_id, response.permissions)
                .await?;
            self.start_snap(snap_id).await?;
            Ok::<_, SnapError>(granted)
        }
        .await;
        self.report(&approval_id, &outcome).await;
        outcome.map(|_| ())
    }

    /// Apply a newer release to an installed snap and restart it.
    ///
    /// Everything undone by a rollback is captured in the snap's snapshot. A failed restart
    /// leaves the snapshot in place for the caller to consume.
    async fn update_inner(
        self: &Arc<Self>,
        origin: &str,
        snap_id: &SnapId,
        location: &dyn SnapLocation,
        range: &VersionReq,
    ) -> Result<SnapSummary, SnapError> {
        let snap = self.get_expect(snap_id)?;
        let fetched = self.fetch(snap_id, location).await?;
        let new_version = fetched.manifest.version.clone();
        if !satisfies(&new_version, range) {
            return Err(SnapError::Validation(format!(
                "Version mismatch. Manifest for \"{snap_id}\" specifies version \"{new_version}\" which doesn't satisfy requested version range \"{range}\"."
            )));
        }
        if !is_valid_update(&snap.version, &new_version, range) {
            return Err(SnapError::Validation(format!(
                "Snap \"{snap_id}@{}\" is already installed. Couldn't update to a version inside requested \"{range}\" range.",
                snap.version
            )));
        }
        self.assert_install_allowed(snap_id, &fetched.manifest).await?;
        validate_requested(
            &fetched.manifest.initial_permissions,
            &self.capabilities.handler_permissions(),
            &self.config.excluded_permissions,
        )?;

        let granted = self.permissions.granted_permissions(snap_id).await;
        let change = PermissionsChange::calculate(&granted, &fetched.manifest.initial_permissions);
        let approval_id = uuid::Uuid::new_v4().to_string();
        let request = ApprovalRequest {
            id: approval_id.clone(),
            origin: origin.to_string(),
            snap_id: snap_id.clone(),
            kind: ApprovalKind::Update,
            permissions: fetched.manifest.initial_permissions.clone(),
            change: Some(change.clone()),
            current_version: Some(snap.version.clone()),
            new_version: new_version.clone(),
        };

        let outcome = async {
            let response = self.permissions.request_approval(request).await?;
            if self.is_running(snap_id) {
                self.stop_snap(snap_id).await?;
            }
            self.transition(snap_id, StatusEvent::Update)?;

            let Fetched {
                manifest,
                source_code,
            } = fetched;
            let patch = self
                .store
                .update_snap(snap_id, |snap, _| snap.apply_release(manifest, source_code, origin))?;
            let granted_names = permission_names(&response.permissions);
            {
                let mut snapshots = self.snapshots.lock();
                let snapshot = snapshots
                    .entry(snap_id.clone())
                    .or_insert_with(RollbackSnapshot::default);
                snapshot.record(patch);
                snapshot.revoked = change.unused_permissions.clone();
                // Only names the snap did not hold before; those are what a rollback takes back.
                snapshot.granted = granted_names
                    .iter()
                    .filter(|name| change.new_permissions.contains_key(name.as_str()))
                    .cloned()
                    .collect();
                snapshot.new_version = Some(new_version.clone());
            }

            if !change.unused_permissions.is_empty() {
                self.permissions
                    .revoke(snap_id, &permission_names(&change.unused_permissions))
                    .await?;
            }
            if !response.permissions.is_empty() {
                self.permissions
                    .grant(snap_id, response.permissions)
                    .await?;
            }
            self.bus.publish(
                topics::TOPIC_SNAP_UPDATED,
                &json!({
                    "snapId": snap_id,
                    "version": new_version,
                    "previousVersion": snap.version,
                    "origin": origin,
                }),
            );

            if let Err(err) = self.start_shared(snap_id).await {
                warn!(target: "snaps::controller", snap = %snap_id, error = %err, "updated snap failed to start");
                return Err(SnapError::CrashedOnUpdate(snap_id.clone()));
            }
            Ok::<_, SnapError>(granted_names)
        }
        .await;
        self.report(&approval_id, &outcome).await;
        outcome?;

        self.call_lifecycle_hook(snap_id, HandlerType::OnUpdate).await;
        info!(target: "snaps::controller", snap = %snap_id, from = %snap.version, to = %new_version, "snap updated");
        self.persist().await;
        self.get_summary(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))
    }

    async fn report(&self, approval_id: &str, outcome: &Result<Vec<String>, SnapError>) {
        let result = match outcome {
            Ok(permissions) => ApprovalResult::Success {
                permissions: permissions.clone(),
            },
            Err(err) => ApprovalResult::Failure {
                error: err.to_string(),
            },
        };
        self.permissions
            .report_approval_result(approval_id, result)
            .await;
    }

    async fn fetch(&self, snap_id: &SnapId, location: &dyn SnapLocation) -> Result<Fetched, SnapError> {
        let manifest = location.manifest().await?.result;
        let source = location.fetch(&manifest.source.file_path).await?;
        verify_source(&manifest, &source.result)
            .map_err(|err| SnapError::Validation(err.to_string()))?;
        debug!(target: "snaps::controller", snap = %snap_id, version = %manifest.version, path = %source.path, "fetched snap");
        Ok(Fetched {
            manifest,
            source_code: source.result,
        })
    }

    async fn assert_install_allowed(&self, snap_id: &SnapId, manifest: &SnapManifest) -> Result<(), SnapError> {
        let verdict = self
            .registry
            .check(&RegistryQuery {
                snap_id: snap_id.clone(),
                version: manifest.version.clone(),
                checksum: manifest.source.shasum.clone(),
            })
            .await;
        let version = &manifest.version;
        let status = verdict.status;
        match status {
            RegistryStatus::Blocked => {
                let reason = verdict.reason.unwrap_or_default();
                let explanation = reason
                    .explanation
                    .unwrap_or_else(|| "The version is blocked.".to_string());
                let more = reason
                    .info_url
                    .map(|url| format!(" For more information see {url}."))
                    .unwrap_or_default();
                Err(SnapError::Registry(format!(
                    "Cannot install version \"{version}\" of snap \"{snap_id}\": {explanation}{more}"
                )))
            }
            RegistryStatus::Verified => Ok(()),
            _ if self.config.require_allowlist && requires_allowlist(&manifest.initial_permissions) => {
                let why = if status == RegistryStatus::Unavailable {
                    "The registry is temporarily unavailable."
                } else {
                    "The snap is not on the allowlist."
                };
                Err(SnapError::Registry(format!(
                    "Cannot install version \"{version}\" of snap \"{snap_id}\": {why}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Re-check every installed snap against the registry, blocking or unblocking as it says.
    pub async fn update_blocked_snaps(self: &Arc<Self>) {
        let installed: Vec<Snap> = self
            .store
            .read(|state| state.snaps.values().cloned().collect());
        for snap in installed {
            let verdict = self
                .registry
                .check(&RegistryQuery {
                    snap_id: snap.id.clone(),
                    version: snap.version.clone(),
                    checksum: snap.manifest.source.shasum.clone(),
                })
                .await;
            match verdict.status {
                RegistryStatus::Blocked => {
                    if let Err(err) = self.block_snap(&snap.id, verdict.reason).await {
                        warn!(target: "snaps::controller", snap = %snap.id, error = %err, "blocking snap failed");
                    }
                }
                RegistryStatus::Verified | RegistryStatus::Unverified if snap.blocked => {
                    if let Err(err) = self.unblock_snap(&snap.id).await {
                        warn!(target: "snaps::controller", snap = %snap.id, error = %err, "unblocking snap failed");
                    }
                }
                _ => {}
            }
        }
    }

    pub async fn remove_snap(self: &Arc<Self>, snap_id: &SnapId) -> Result<(), SnapError> {
        self.remove_snaps(std::slice::from_ref(snap_id)).await
    }

    /// Remove snaps, their state and their permissions. Fails before touching anything when one
    /// of the ids is unknown.
    pub async fn remove_snaps(self: &Arc<Self>, snap_ids: &[SnapId]) -> Result<(), SnapError> {
        if let Some(missing) = snap_ids.iter().find(|snap_id| !self.has(snap_id)) {
            return Err(SnapError::NotFound(missing.clone()));
        }
        for snap_id in snap_ids {
            if self.is_running(snap_id) {
                self.stop_snap(snap_id).await?;
            }
            if let Err(err) = self.permissions.revoke_all(snap_id).await {
                warn!(target: "snaps::controller", snap = %snap_id, error = %err, "revoking permissions failed");
            }
            self.runtimes.lock().remove(snap_id);
            self.snapshots.lock().remove(snap_id);
            let removed = self.store.update(|state| {
                state.snap_states.remove(snap_id);
                state.snaps.remove(snap_id)
            });
            if let Some(snap) = removed {
                info!(target: "snaps::controller", snap = %snap_id, "snap removed");
                self.bus.publish(
                    topics::TOPIC_SNAP_REMOVED,
                    &json!({"snapId": snap_id, "version": snap.version}),
                );
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Invoke an install or update hook when the snap asked for them. Failures are only logged.
    async fn call_lifecycle_hook(self: &Arc<Self>, snap_id: &SnapId, handler: HandlerType) {
        let permission = self.capabilities.handler_permission(handler);
        if !self.permissions.has_permission(snap_id, permission).await {
            return;
        }
        let request = HandleRequest {
            snap_id: snap_id.clone(),
            origin: HOST_ORIGIN.to_string(),
            handler,
            request: json!({"method": handler.as_str()}),
        };
        if let Err(err) = self.handle_request(request).await {
            warn!(target: "snaps::controller", snap = %snap_id, %handler, error = %err, "lifecycle hook failed");
        }
    }
}
