#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use snaps_controller::{ControllerDeps, HandleRequest, InstallRequest, SnapController};
use snaps_core::{Config, SnapId, SnapSummary};
use snaps_events::{Bus, Envelope};
use snaps_mock_env::{
    MemoryLocations, MemoryPermissionHost, MemoryRegistry, ScriptedEnvironment, StaticRpcHost,
};
use snaps_protocol::HandlerType;
use tokio::sync::broadcast;

pub const DAPP: &str = "https://dapp.example";

pub struct Harness {
    pub controller: Arc<SnapController>,
    pub env: Arc<ScriptedEnvironment>,
    pub permissions: Arc<MemoryPermissionHost>,
    pub registry: Arc<MemoryRegistry>,
    pub locations: Arc<MemoryLocations>,
    pub rpc_host: Arc<StaticRpcHost>,
    pub events: broadcast::Receiver<Envelope>,
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.controller.max_request_time_ms = 2_000;
    config.controller.max_init_time_ms = 2_000;
    config.execution.init_timeout_ms = 2_000;
    config.execution.termination_timeout_ms = 100;
    config.execution.destroy_timeout_ms = 500;
    config
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(config()).await
    }

    pub async fn with_config(config: Config) -> Result<Self> {
        let rpc_host = Arc::new(StaticRpcHost::new().with("snap_getState", json!({"count": 3})));
        Self::build(
            config,
            Arc::new(ScriptedEnvironment::new()),
            Arc::new(MemoryPermissionHost::new()),
            Arc::new(MemoryLocations::new()),
            rpc_host,
        )
        .await
    }

    /// A second controller over the same package source and permission host, as after a restart.
    pub async fn restart(&self, config: Config) -> Result<Self> {
        Self::build(
            config,
            Arc::new(ScriptedEnvironment::new()),
            self.permissions.clone(),
            self.locations.clone(),
            self.rpc_host.clone(),
        )
        .await
    }

    async fn build(
        config: Config,
        env: Arc<ScriptedEnvironment>,
        permissions: Arc<MemoryPermissionHost>,
        locations: Arc<MemoryLocations>,
        rpc_host: Arc<StaticRpcHost>,
    ) -> Result<Self> {
        snaps_core::telemetry::init_for_tests();
        let registry = Arc::new(MemoryRegistry::new());
        let bus = Bus::new(512);
        let events = bus.subscribe();
        let controller = SnapController::new(
            config,
            ControllerDeps {
                environment: env.clone(),
                permissions: permissions.clone(),
                registry: registry.clone(),
                locations: locations.clone(),
                rpc_host: Some(rpc_host.clone()),
                bus,
            },
        )
        .await?;
        Ok(Self {
            controller,
            env,
            permissions,
            registry,
            locations,
            rpc_host,
            events,
        })
    }

    /// Publish `source` as version `version` of `snap_id` and install it.
    pub async fn install(&self, snap_id: &str, version: &str, source: &str) -> Result<SnapSummary> {
        let id = snap(snap_id);
        self.locations.publish(&id, version, source);
        let mut installed = self
            .controller
            .install(DAPP, BTreeMap::from([(snap_id.to_string(), InstallRequest::default())]))
            .await?;
        installed
            .remove(&id)
            .ok_or_else(|| anyhow::anyhow!("{snap_id} missing from install result"))
    }

    pub async fn rpc(&self, snap_id: &SnapId, request: Value) -> Result<Value, snaps_controller::SnapError> {
        self.controller
            .handle_request(HandleRequest {
                snap_id: snap_id.clone(),
                origin: DAPP.to_string(),
                handler: HandlerType::OnRpcRequest,
                request,
            })
            .await
    }

    /// Event kinds published since the last call.
    pub fn kinds(&mut self) -> Vec<String> {
        snaps_events::drain(&mut self.events)
            .into_iter()
            .map(|env| env.kind)
            .collect()
    }
}

pub fn snap(raw: &str) -> SnapId {
    SnapId::parse(raw).expect("snap id")
}

/// Poll `check` until it holds or a couple of seconds have passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
