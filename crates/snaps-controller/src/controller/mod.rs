//! The snaps controller: installed-snap records, their sessions and every operation a host
//! performs on them.
//!
//! Shared maps sit behind `parking_lot` mutexes that are never held across an `.await`. When both
//! are needed the runtime map is locked before the store. Operations that must happen once per
//! snap no matter how many callers race (start, stop, fresh install) run as single flights.

mod install;
mod rollback;
mod rpc;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use snaps_core::{Config, ControllerConfig, Snap, SnapId, SnapStatus, SnapSummary, StatusEvent};
use snaps_events::Bus;
use snaps_protocol::RpcErrorObject;
use snaps_runtime::{
    EnvironmentFactory, LocationResolver, PermissionHost, SnapRegistry, SnapRpcHost,
};
use snaps_topics as topics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{CapabilityRegistry, DEFAULT_ENDOWMENTS};
use crate::error::SnapError;
use crate::execution::{ExecutionError, ExecutionService};
use crate::lifecycle::{snap_machine, SnapMachine};
use crate::runtime::{Runtimes, SnapRuntime};
use crate::singleflight::Singleflight;
use crate::store::{SnapErrorEntry, SnapStore};
use crate::tasks::{spawn_supervised, TaskHandle, TaskManager};

pub use install::InstallRequest;
pub use rollback::RollbackSnapshot;
pub use rpc::HandleRequest;

/// Collaborators the controller is wired to.
pub struct ControllerDeps {
    pub environment: Arc<dyn EnvironmentFactory>,
    pub permissions: Arc<dyn PermissionHost>,
    pub registry: Arc<dyn SnapRegistry>,
    pub locations: Arc<dyn LocationResolver>,
    pub rpc_host: Option<Arc<dyn SnapRpcHost>>,
    pub bus: Bus,
}

type Outcome = Result<(), SnapError>;

pub struct SnapController {
    config: ControllerConfig,
    execution: Arc<ExecutionService>,
    permissions: Arc<dyn PermissionHost>,
    registry: Arc<dyn SnapRegistry>,
    locations: Arc<dyn LocationResolver>,
    bus: Bus,
    capabilities: CapabilityRegistry,
    machine: Arc<SnapMachine>,
    store: SnapStore,
    runtimes: Mutex<Runtimes>,
    snapshots: Mutex<HashMap<SnapId, RollbackSnapshot>>,
    start_flights: Singleflight<Outcome>,
    stop_flights: Singleflight<Outcome>,
    install_flights: Singleflight<Result<SnapSummary, SnapError>>,
    tasks: Mutex<Option<TaskManager>>,
    cancel: CancellationToken,
}

impl SnapController {
    pub async fn new(config: Config, deps: ControllerDeps) -> Result<Arc<Self>, SnapError> {
        let store = match config.controller.state_path.as_deref() {
            Some(path) => SnapStore::open(path).await?,
            None => SnapStore::in_memory(),
        };
        let machine = snap_machine()?;
        let capabilities =
            CapabilityRegistry::new().map_err(|err| SnapError::contract(err.to_string()))?;
        let (execution, execution_events) =
            ExecutionService::new(deps.environment, config.execution.clone(), deps.rpc_host);

        let runtimes = store.read(|state| {
            state
                .snaps
                .values()
                .map(|snap| {
                    let rt = SnapRuntime::new(
                        machine.clone(),
                        snap.status,
                        config.controller.max_queue_size,
                    );
                    (snap.id.clone(), rt)
                })
                .collect::<Runtimes>()
        });

        let controller = Arc::new(Self {
            config: config.controller,
            execution,
            permissions: deps.permissions,
            registry: deps.registry,
            locations: deps.locations,
            bus: deps.bus,
            capabilities,
            machine,
            store,
            runtimes: Mutex::new(runtimes),
            snapshots: Mutex::new(HashMap::new()),
            start_flights: Singleflight::default(),
            stop_flights: Singleflight::default(),
            install_flights: Singleflight::default(),
            tasks: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let mut tasks = TaskManager::new();
        tasks.push(rpc::spawn_execution_listener(&controller, execution_events));
        tasks.push(controller.spawn_idle_poll());
        *controller.tasks.lock() = Some(tasks);

        info!(
            target: "snaps::controller",
            env = controller.execution.environment_id(),
            snaps = controller.store.read(|state| state.snaps.len()),
            "snap controller ready"
        );
        Ok(controller)
    }

    fn spawn_idle_poll(self: &Arc<Self>) -> TaskHandle {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.idle_check_interval();
        spawn_supervised("snaps.idle_poll", move || {
            let weak = weak.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let Some(controller) = weak.upgrade() else {
                        break;
                    };
                    controller.stop_idle_snaps().await;
                }
            }
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    // ---- queries -------------------------------------------------------------------------

    pub fn get(&self, snap_id: &SnapId) -> Option<Snap> {
        self.store.read(|state| state.snaps.get(snap_id).cloned())
    }

    pub fn get_summary(&self, snap_id: &SnapId) -> Option<SnapSummary> {
        self.store
            .read(|state| state.snaps.get(snap_id).map(Snap::summary))
    }

    pub fn has(&self, snap_id: &SnapId) -> bool {
        self.store.read(|state| state.snaps.contains_key(snap_id))
    }

    pub fn is_running(&self, snap_id: &SnapId) -> bool {
        self.runtimes
            .lock()
            .get(snap_id)
            .map(|rt| rt.interpreter.state() == SnapStatus::Running)
            .unwrap_or(false)
    }

    pub fn snaps(&self) -> Vec<SnapSummary> {
        self.store
            .read(|state| state.snaps.values().map(Snap::summary).collect())
    }

    fn get_expect(&self, snap_id: &SnapId) -> Result<Snap, SnapError> {
        self.get(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))
    }

    // ---- lifecycle -----------------------------------------------------------------------

    /// Apply `event` to the snap's interpreter and record the resulting status.
    fn transition(&self, snap_id: &SnapId, event: StatusEvent) -> Result<SnapStatus, SnapError> {
        self.transition_with(snap_id, |_| event).map(|(status, _)| status)
    }

    /// Like [`Self::transition`], with the event picked under the same runtime lock it is
    /// applied with.
    fn transition_with(
        &self,
        snap_id: &SnapId,
        pick: impl FnOnce(&mut SnapRuntime) -> StatusEvent,
    ) -> Result<(SnapStatus, StatusEvent), SnapError> {
        let mut runtimes = self.runtimes.lock();
        let rt = runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        let event = pick(rt);
        let outcome = self.store.update(|state| match state.snaps.get_mut(snap_id) {
            Some(snap) => rt.interpreter.send(event, snap).map_err(SnapError::from),
            None => Err(SnapError::NotFound(snap_id.clone())),
        });
        match &outcome {
            Ok(status) => {
                debug!(target: "snaps::controller", snap = %snap_id, %event, %status, "transition")
            }
            Err(err) => {
                error!(target: "snaps::controller", snap = %snap_id, %event, error = %err, "invalid lifecycle transition")
            }
        }
        outcome.map(|status| (status, event))
    }

    /// Put the interpreter and the record into `status` without consulting the machine.
    fn force_status(&self, snap_id: &SnapId, status: SnapStatus) {
        let mut runtimes = self.runtimes.lock();
        if let Some(rt) = runtimes.get_mut(snap_id) {
            rt.interpreter.force(status);
        }
        self.store.update(|state| {
            if let Some(snap) = state.snaps.get_mut(snap_id) {
                snap.status = status;
            }
        });
    }

    pub async fn start_snap(self: &Arc<Self>, snap_id: &SnapId) -> Result<(), SnapError> {
        let snap = self.get_expect(snap_id)?;
        if !snap.enabled {
            return Err(SnapError::Disabled(snap_id.clone()));
        }
        self.start_shared(snap_id).await
    }

    /// Concurrent callers for the same snap share one start attempt.
    async fn start_shared(self: &Arc<Self>, snap_id: &SnapId) -> Result<(), SnapError> {
        let flight = self.start_flights.begin(snap_id.as_str(), || {
            let controller = self.clone();
            let snap_id = snap_id.clone();
            async move { controller.start_inner(snap_id).await }
        });
        flight
            .wait()
            .await
            .unwrap_or_else(|| Err(SnapError::contract("snap start was abandoned")))
    }

    async fn start_inner(self: Arc<Self>, snap_id: SnapId) -> Result<(), SnapError> {
        let snap = self.get_expect(&snap_id)?;
        if !snap.enabled {
            return Err(SnapError::Disabled(snap_id));
        }
        if self.is_running(&snap_id) {
            return Err(SnapError::contract(format!(
                "Snap \"{snap_id}\" is already started."
            )));
        }

        let endowments = self.session_endowments(&snap_id).await;
        let executed = tokio::time::timeout(
            self.config.max_init_time(),
            self.execution
                .execute_snap(&snap_id, &snap.source_code, endowments),
        )
        .await;
        match executed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                self.terminate_session(&snap_id).await;
                return Err(SnapError::StartTimeout(snap_id));
            }
        }

        if let Err(err) = self.transition(&snap_id, StatusEvent::Start) {
            self.terminate_session(&snap_id).await;
            return Err(err);
        }
        if let Some(rt) = self.runtimes.lock().get_mut(&snap_id) {
            rt.last_request = Some(tokio::time::Instant::now());
        }
        info!(target: "snaps::controller", snap = %snap_id, "snap started");
        self.bus
            .publish(topics::TOPIC_SNAP_STARTED, &json!({"snapId": snap_id}));
        self.persist().await;
        Ok(())
    }

    async fn session_endowments(&self, snap_id: &SnapId) -> Vec<String> {
        let granted = self.permissions.granted_permissions(snap_id).await;
        let mut globals: BTreeSet<String> =
            DEFAULT_ENDOWMENTS.iter().map(|s| s.to_string()).collect();
        for permission in self.capabilities.global_endowments(&granted) {
            globals.extend(
                self.permissions
                    .endowment_globals(snap_id, permission)
                    .await,
            );
        }
        globals.into_iter().collect()
    }

    /// Stopping a known snap that is not running is a no-op.
    pub async fn stop_snap(self: &Arc<Self>, snap_id: &SnapId) -> Result<(), SnapError> {
        self.stop_with(snap_id, StatusEvent::Stop).await
    }

    pub(crate) async fn stop_with(
        self: &Arc<Self>,
        snap_id: &SnapId,
        event: StatusEvent,
    ) -> Result<(), SnapError> {
        if !self.has(snap_id) {
            return Err(SnapError::NotFound(snap_id.clone()));
        }
        let crash = event == StatusEvent::Crash;
        if crash {
            // Picked up by a stop already in flight, before it records its transition.
            if let Some(rt) = self.runtimes.lock().get_mut(snap_id) {
                rt.crash_requested = true;
            }
        }
        let flight = self.stop_flights.begin(snap_id.as_str(), || {
            let controller = self.clone();
            let snap_id = snap_id.clone();
            async move { controller.stop_inner(snap_id, event).await }
        });
        let outcome = flight
            .wait()
            .await
            .unwrap_or_else(|| Err(SnapError::contract("snap stop was abandoned")));
        if crash {
            if let Some(rt) = self.runtimes.lock().get_mut(snap_id) {
                rt.crash_requested = false;
            }
        }
        outcome
    }

    async fn stop_inner(self: Arc<Self>, snap_id: SnapId, event: StatusEvent) -> Outcome {
        if !self.is_running(&snap_id) {
            return Ok(());
        }
        if let Some(rt) = self.runtimes.lock().get_mut(&snap_id) {
            rt.reset_session();
        }
        self.terminate_session(&snap_id).await;
        let (_, event) = self.transition_with(&snap_id, |rt| rt.stop_event(event))?;

        let payload = json!({"snapId": snap_id});
        if event == StatusEvent::Crash {
            warn!(target: "snaps::controller", snap = %snap_id, "snap crashed");
            self.bus.publish(topics::TOPIC_SNAP_CRASHED, &payload);
        } else {
            info!(target: "snaps::controller", snap = %snap_id, "snap stopped");
        }
        self.bus.publish(topics::TOPIC_SNAP_TERMINATED, &payload);
        self.persist().await;
        Ok(())
    }

    async fn terminate_session(&self, snap_id: &SnapId) {
        match self.execution.terminate_snap(snap_id).await {
            Ok(()) | Err(ExecutionError::NotRunning(_)) => {}
            Err(err) => {
                warn!(target: "snaps::controller", snap = %snap_id, error = %err, "session termination failed")
            }
        }
    }

    // ---- enablement ----------------------------------------------------------------------

    pub async fn enable_snap(&self, snap_id: &SnapId) -> Result<(), SnapError> {
        let enabled = self.store.update(|state| {
            state
                .snaps
                .get_mut(snap_id)
                .map(|snap| snap.enable())
                .ok_or_else(|| SnapError::NotFound(snap_id.clone()))
        })?;
        if !enabled {
            return Err(SnapError::BlockedEnable(snap_id.clone()));
        }
        self.bus
            .publish(topics::TOPIC_SNAP_ENABLED, &json!({"snapId": snap_id}));
        self.persist().await;
        Ok(())
    }

    pub async fn disable_snap(self: &Arc<Self>, snap_id: &SnapId) -> Result<(), SnapError> {
        self.store.update(|state| {
            state
                .snaps
                .get_mut(snap_id)
                .map(Snap::disable)
                .ok_or_else(|| SnapError::NotFound(snap_id.clone()))
        })?;
        if self.is_running(snap_id) {
            self.stop_snap(snap_id).await?;
        }
        self.bus
            .publish(topics::TOPIC_SNAP_DISABLED, &json!({"snapId": snap_id}));
        self.persist().await;
        Ok(())
    }

    /// Block and disable a snap, stopping it if it runs. Unknown snaps are ignored.
    pub async fn block_snap(
        self: &Arc<Self>,
        snap_id: &SnapId,
        reason: Option<snaps_core::BlockReason>,
    ) -> Result<(), SnapError> {
        let found = self.store.update(|state| match state.snaps.get_mut(snap_id) {
            Some(snap) => {
                snap.block(reason.clone());
                true
            }
            None => false,
        });
        if !found {
            return Ok(());
        }
        if self.is_running(snap_id) {
            if let Err(err) = self.stop_snap(snap_id).await {
                error!(target: "snaps::controller", snap = %snap_id, error = %err, "failed to stop blocked snap");
            }
        }
        warn!(target: "snaps::controller", snap = %snap_id, "snap blocked");
        self.bus.publish(
            topics::TOPIC_SNAP_BLOCKED,
            &json!({"snapId": snap_id, "blockInformation": reason}),
        );
        self.persist().await;
        Ok(())
    }

    /// Lift a block. The snap stays disabled until enabled explicitly.
    pub async fn unblock_snap(&self, snap_id: &SnapId) -> Result<(), SnapError> {
        let unblocked = self.store.update(|state| match state.snaps.get_mut(snap_id) {
            Some(snap) if snap.blocked => {
                snap.unblock();
                true
            }
            _ => false,
        });
        if unblocked {
            info!(target: "snaps::controller", snap = %snap_id, "snap unblocked");
            self.bus
                .publish(topics::TOPIC_SNAP_UNBLOCKED, &json!({"snapId": snap_id}));
            self.persist().await;
        }
        Ok(())
    }

    // ---- reference counting --------------------------------------------------------------

    pub fn increment_active_references(&self, snap_id: &SnapId) -> Result<usize, SnapError> {
        let mut runtimes = self.runtimes.lock();
        let rt = runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        rt.active_references += 1;
        Ok(rt.active_references)
    }

    pub fn decrement_active_references(&self, snap_id: &SnapId) -> Result<usize, SnapError> {
        let mut runtimes = self.runtimes.lock();
        let rt = runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        if rt.active_references == 0 {
            return Err(SnapError::contract(
                "SnapController reference management is in an invalid state.",
            ));
        }
        rt.active_references -= 1;
        Ok(rt.active_references)
    }

    // ---- snap state ----------------------------------------------------------------------

    pub fn get_snap_state(&self, snap_id: &SnapId) -> Result<Option<Value>, SnapError> {
        self.store.read(|state| {
            if !state.snaps.contains_key(snap_id) {
                return Err(SnapError::NotFound(snap_id.clone()));
            }
            Ok(state.snap_states.get(snap_id).cloned())
        })
    }

    /// Replace the snap's state. Changes made while an update is pending are undone by rollback.
    pub async fn update_snap_state(&self, snap_id: &SnapId, value: Value) -> Result<(), SnapError> {
        self.write_snap_state(snap_id, Some(value)).await
    }

    pub async fn clear_snap_state(&self, snap_id: &SnapId) -> Result<(), SnapError> {
        self.write_snap_state(snap_id, None).await
    }

    async fn write_snap_state(&self, snap_id: &SnapId, value: Option<Value>) -> Result<(), SnapError> {
        let patch = self
            .store
            .update_snap(snap_id, |_, state| *state = value)?;
        if let Some(snapshot) = self.snapshots.lock().get_mut(snap_id) {
            snapshot.record(patch);
        }
        self.bus
            .publish(topics::TOPIC_SNAP_STATE_CHANGED, &json!({"snapId": snap_id}));
        self.persist().await;
        Ok(())
    }

    // ---- crash log -----------------------------------------------------------------------

    pub fn snap_errors(&self) -> Vec<SnapErrorEntry> {
        self.store
            .read(|state| state.snap_errors.values().cloned().collect())
    }

    /// Record an error and return the internal id it is filed under.
    pub fn add_snap_error(&self, snap_id: Option<&SnapId>, error: &RpcErrorObject) -> String {
        let internal_id = uuid::Uuid::new_v4().to_string();
        let entry = SnapErrorEntry {
            internal_id: internal_id.clone(),
            snap_id: snap_id.cloned(),
            message: error.message.clone(),
            code: error.code,
            data: error.data.clone(),
        };
        self.store.update(|state| {
            state.snap_errors.insert(internal_id.clone(), entry);
        });
        internal_id
    }

    pub fn remove_snap_error(&self, internal_id: &str) -> bool {
        self.store
            .update(|state| state.snap_errors.remove(internal_id).is_some())
    }

    pub fn clear_snap_errors(&self) {
        self.store.update(|state| state.snap_errors.clear());
    }

    // ---- teardown ------------------------------------------------------------------------

    async fn stop_all(self: &Arc<Self>) {
        let running: Vec<SnapId> = self
            .runtimes
            .lock()
            .iter()
            .filter(|(_, rt)| rt.interpreter.state() == SnapStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        for snap_id in running {
            if let Err(err) = self.stop_snap(&snap_id).await {
                warn!(target: "snaps::controller", snap = %snap_id, error = %err, "stop during teardown failed");
            }
        }
        self.execution.terminate_all().await;
    }

    /// Stop every snap, revoke their permissions and wipe snaps and snap state.
    pub async fn clear_state(self: &Arc<Self>) {
        self.stop_all().await;
        let ids: Vec<SnapId> = self.store.read(|state| state.snaps.keys().cloned().collect());
        for snap_id in &ids {
            if let Err(err) = self.permissions.revoke_all(snap_id).await {
                warn!(target: "snaps::controller", snap = %snap_id, error = %err, "revoking permissions failed");
            }
        }
        self.runtimes.lock().clear();
        self.store.update(|state| {
            state.snaps.clear();
            state.snap_states.clear();
        });
        self.snapshots.lock().clear();
        info!(target: "snaps::controller", removed = ids.len(), "controller state cleared");
        self.persist().await;
    }

    /// Stop every session and background task. The persisted document is left as is.
    pub async fn destroy(self: &Arc<Self>) {
        self.stop_all().await;
        self.cancel.cancel();
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown_with_grace(Duration::from_millis(500)).await;
        }
        self.persist().await;
        info!(target: "snaps::controller", "snap controller destroyed");
    }

    async fn persist(&self) {
        if let Err(err) = self.store.persist().await {
            warn!(target: "snaps::controller", error = %err, "persisting controller state failed");
        }
    }
}

impl Drop for SnapController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
