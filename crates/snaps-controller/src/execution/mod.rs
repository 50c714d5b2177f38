//! Execution sessions: one isolated context per running snap.
//!
//! The service owns the snap-to-job and job-to-snap maps. A snap's slot is reserved before any
//! await in [`ExecutionService::execute_snap`], so a second concurrent call for the same snap is
//! rejected instead of racing the first. Every path that ends a job goes through
//! [`ExecutionService::terminate`], which always releases the mapping even when the session never
//! acknowledges.

mod command;
mod job;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use snaps_core::{ExecutionConfig, SnapId};
use snaps_protocol::{
    channels, methods, notifications, ExecuteSnapParams, RpcErrorObject, RpcNotification,
    SnapRpcParams, UnhandledErrorParams,
};
use snaps_runtime::{
    ChannelMux, EnvironmentError, EnvironmentFactory, MuxError, SnapRpcHost,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use command::CommandClient;
use job::{spawn_rpc_provider, Job};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("Job \"{0}\" not found.")]
    NotFound(String),
    #[error("\"{0}\" is already being executed.")]
    AlreadyExecuting(SnapId),
    #[error("Snap \"{0}\" has no running session.")]
    NotRunning(SnapId),
    #[error("{0} timed out.")]
    Timeout(&'static str),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Rpc(#[from] RpcErrorObject),
    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::NotFound(_) => ErrorKind::NotFound,
            ExecutionError::AlreadyExecuting(_) | ExecutionError::NotRunning(_) => ErrorKind::Contract,
            ExecutionError::Timeout(_) => ErrorKind::Timeout,
            ExecutionError::Environment(_)
            | ExecutionError::Transport(_)
            | ExecutionError::Mux(_) => ErrorKind::Transport,
            ExecutionError::Rpc(_) => ErrorKind::Execution,
        }
    }
}

/// Out-of-band signals a session raises while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    OutboundRequest { snap_id: SnapId },
    OutboundResponse { snap_id: SnapId },
    UnhandledError { snap_id: SnapId, error: RpcErrorObject },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// Reserved by an `execute_snap` call that has not created its job yet.
    Pending,
    Active(String),
}

#[derive(Default)]
struct Mappings {
    jobs: HashMap<String, Arc<Job>>,
    snap_to_job: HashMap<SnapId, Slot>,
    job_to_snap: HashMap<String, SnapId>,
}

impl Mappings {
    /// Release `snap`'s slot only if it still belongs to `job` (or to nobody yet).
    fn release(&mut self, snap_id: &SnapId, job: Option<&str>) {
        let owned = match (self.snap_to_job.get(snap_id), job) {
            (Some(Slot::Active(current)), Some(job)) => current == job,
            (Some(Slot::Pending), _) => true,
            _ => false,
        };
        if owned {
            self.snap_to_job.remove(snap_id);
        }
    }
}

pub struct ExecutionService {
    factory: Arc<dyn EnvironmentFactory>,
    config: ExecutionConfig,
    rpc_host: Option<Arc<dyn SnapRpcHost>>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
    mappings: Arc<Mutex<Mappings>>,
}

impl ExecutionService {
    pub fn new(
        factory: Arc<dyn EnvironmentFactory>,
        config: ExecutionConfig,
        rpc_host: Option<Arc<dyn SnapRpcHost>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            factory,
            config,
            rpc_host,
            events,
            mappings: Arc::new(Mutex::new(Mappings::default())),
        });
        (service, rx)
    }

    pub fn environment_id(&self) -> &'static str {
        self.factory.id()
    }

    /// Create an isolated context and wire its transport. Callers bound this with a timeout:
    /// a context that never becomes ready never resolves.
    pub async fn init_job(&self) -> Result<String, ExecutionError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let (handle, transport) = self.factory.create_context(&job_id).await?;
        let mux = ChannelMux::new(job_id.clone(), transport);
        let channels = mux
            .channel(channels::COMMAND)
            .and_then(|command| Ok((command, mux.channel(channels::RPC)?)));
        let (command, rpc) = match channels {
            Ok(pair) => pair,
            Err(err) => {
                mux.close();
                if let Err(destroy) = self.factory.destroy_context(handle).await {
                    warn!(target: "snaps::execution", job = %job_id, error = %destroy, "destroy after failed init");
                }
                return Err(err.into());
            }
        };
        let (commands, notes) = CommandClient::new(&job_id, command);
        let job = Arc::new(Job::new(job_id.clone(), handle, mux, commands, rpc));
        job.track(spawn_notification_pump(
            job_id.clone(),
            notes,
            self.mappings.clone(),
            self.events.clone(),
        ));
        self.mappings.lock().jobs.insert(job_id.clone(), job);
        debug!(target: "snaps::execution", job = %job_id, env = self.factory.id(), "job initialized");
        Ok(job_id)
    }

    /// Start `snap_id` in a fresh session: ping, serve its RPC channel, then hand it the code.
    pub async fn execute_snap(
        self: &Arc<Self>,
        snap_id: &SnapId,
        source_code: &str,
        endowments: Vec<String>,
    ) -> Result<(), ExecutionError> {
        {
            let mut map = self.mappings.lock();
            if map.snap_to_job.contains_key(snap_id) {
                return Err(ExecutionError::AlreadyExecuting(snap_id.clone()));
            }
            map.snap_to_job.insert(snap_id.clone(), Slot::Pending);
        }
        let mut reservation = Reservation {
            service: self.clone(),
            snap_id: snap_id.clone(),
            job_id: None,
            armed: true,
        };

        let job_id = tokio::time::timeout(self.config.init_timeout(), self.init_job())
            .await
            .map_err(|_| ExecutionError::Timeout("Session initialization"))??;
        reservation.job_id = Some(job_id.clone());
        {
            let mut map = self.mappings.lock();
            map.snap_to_job
                .insert(snap_id.clone(), Slot::Active(job_id.clone()));
            map.job_to_snap.insert(job_id.clone(), snap_id.clone());
        }

        let params = ExecuteSnapParams {
            snap_id: snap_id.to_string(),
            source_code: source_code.to_string(),
            endowments,
        };
        let started = self.start_session(&job_id, snap_id, params).await;
        if let Err(err) = started {
            reservation.armed = false;
            warn!(target: "snaps::execution", snap = %snap_id, job = %job_id, error = %err, "session failed to start");
            if let Err(term) = self.terminate(&job_id).await {
                debug!(target: "snaps::execution", job = %job_id, error = %term, "terminate after failed start");
            }
            self.mappings.lock().release(snap_id, Some(&job_id));
            return Err(err);
        }
        reservation.armed = false;
        info!(target: "snaps::execution", snap = %snap_id, job = %job_id, "snap executing");
        Ok(())
    }

    async fn start_session(
        &self,
        job_id: &str,
        snap_id: &SnapId,
        params: ExecuteSnapParams,
    ) -> Result<(), ExecutionError> {
        tokio::time::timeout(
            self.config.ping_timeout(),
            self.command(job_id, methods::PING, None),
        )
        .await
        .map_err(|_| ExecutionError::Timeout("Session ping"))??;

        let job = self.job(job_id)?;
        if let Some(rpc) = job.take_rpc() {
            job.track(spawn_rpc_provider(
                job_id.to_string(),
                snap_id.clone(),
                rpc,
                self.rpc_host.clone(),
            ));
        }

        let params = serde_json::to_value(params)
            .map_err(|err| ExecutionError::Transport(err.to_string()))?;
        self.command(job_id, methods::EXECUTE_SNAP, Some(params))
            .await?;
        Ok(())
    }

    pub async fn command(
        &self,
        job_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        let job = self.job(job_id)?;
        job.commands.request(method, params).await
    }

    /// End a job. Unknown jobs are an error; everything after the lookup is best effort.
    pub async fn terminate(&self, job_id: &str) -> Result<(), ExecutionError> {
        let job = self
            .mappings
            .lock()
            .jobs
            .remove(job_id)
            .ok_or_else(|| ExecutionError::NotFound(job_id.to_string()))?;

        match tokio::time::timeout(
            self.config.termination_timeout(),
            job.commands.request(methods::TERMINATE, None),
        )
        .await
        {
            Ok(Ok(_)) => debug!(target: "snaps::execution", job = %job_id, "terminate acknowledged"),
            Ok(Err(err)) => {
                warn!(target: "snaps::execution", job = %job_id, error = %err, "terminate command failed")
            }
            Err(_) => {
                warn!(target: "snaps::execution", job = %job_id, "job failed to terminate gracefully, forcing teardown")
            }
        }
        job.shutdown();

        match tokio::time::timeout(
            self.config.destroy_timeout(),
            self.factory.destroy_context(job.handle.clone()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "snaps::execution", job = %job_id, error = %err, "destroying context failed")
            }
            Err(_) => {
                warn!(target: "snaps::execution", job = %job_id, "destroying context timed out")
            }
        }

        let mut map = self.mappings.lock();
        if let Some(snap_id) = map.job_to_snap.remove(job_id) {
            map.release(&snap_id, Some(job_id));
            debug!(target: "snaps::execution", job = %job_id, snap = %snap_id, "job terminated");
        }
        Ok(())
    }

    pub async fn terminate_snap(&self, snap_id: &SnapId) -> Result<(), ExecutionError> {
        let job_id = self
            .job_for(snap_id)
            .ok_or_else(|| ExecutionError::NotRunning(snap_id.clone()))?;
        self.terminate(&job_id).await
    }

    pub async fn terminate_all(&self) {
        let jobs: Vec<String> = self.mappings.lock().jobs.keys().cloned().collect();
        for job_id in jobs {
            if let Err(err) = self.terminate(&job_id).await {
                debug!(target: "snaps::execution", job = %job_id, error = %err, "terminate_all skipped job");
            }
        }
    }

    /// Forward an inbound request to the snap's `snapRpc` handler.
    pub async fn handle_rpc_request(
        &self,
        snap_id: &SnapId,
        params: SnapRpcParams,
    ) -> Result<Value, ExecutionError> {
        let job_id = self
            .job_for(snap_id)
            .ok_or_else(|| ExecutionError::NotRunning(snap_id.clone()))?;
        let params = serde_json::to_value(params)
            .map_err(|err| ExecutionError::Transport(err.to_string()))?;
        self.command(&job_id, methods::SNAP_RPC, Some(params)).await
    }

    pub fn job_for(&self, snap_id: &SnapId) -> Option<String> {
        match self.mappings.lock().snap_to_job.get(snap_id) {
            Some(Slot::Active(job)) => Some(job.clone()),
            _ => None,
        }
    }

    pub fn job_count(&self) -> usize {
        self.mappings.lock().jobs.len()
    }

    fn job(&self, job_id: &str) -> Result<Arc<Job>, ExecutionError> {
        self.mappings
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ExecutionError::NotFound(job_id.to_string()))
    }
}

/// Undoes a slot reservation when `execute_snap` is cancelled mid-flight.
struct Reservation {
    service: Arc<ExecutionService>,
    snap_id: SnapId,
    job_id: Option<String>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.job_id.take() {
            Some(job_id) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let service = self.service.clone();
                    handle.spawn(async move {
                        let _ = service.terminate(&job_id).await;
                    });
                }
                Err(_) => {
                    let mut map = self.service.mappings.lock();
                    map.jobs.remove(&job_id);
                    map.job_to_snap.remove(&job_id);
                    map.release(&self.snap_id, Some(&job_id));
                }
            },
            None => self.service.mappings.lock().release(&self.snap_id, None),
        }
    }
}

fn spawn_notification_pump(
    job_id: String,
    mut notes: mpsc::UnboundedReceiver<RpcNotification>,
    mappings: Arc<Mutex<Mappings>>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(note) = notes.recv().await {
            let Some(snap_id) = mappings.lock().job_to_snap.get(&job_id).cloned() else {
                warn!(target: "snaps::execution", job = %job_id, method = %note.method, "notification for unmapped job");
                continue;
            };
            let event = match note.method.as_str() {
                notifications::OUTBOUND_REQUEST => ExecutionEvent::OutboundRequest { snap_id },
                notifications::OUTBOUND_RESPONSE => ExecutionEvent::OutboundResponse { snap_id },
                notifications::UNHANDLED_ERROR => {
                    let params = note
                        .params
                        .clone()
                        .and_then(|params| serde_json::from_value::<UnhandledErrorParams>(params).ok());
                    let Some(params) = params else {
                        warn!(target: "snaps::execution", job = %job_id, "malformed UnhandledError notification");
                        continue;
                    };
                    let _ = events.send(ExecutionEvent::UnhandledError {
                        snap_id,
                        error: params.error,
                    });
                    // The session is considered dead from here on.
                    break;
                }
                other => {
                    warn!(target: "snaps::execution", job = %job_id, method = other, "unexpected notification");
                    continue;
                }
            };
            let _ = events.send(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snaps_mock_env::{GuestScript, ScriptedEnvironment};
    use std::time::Duration;

    fn id(name: &str) -> SnapId {
        SnapId::parse(name).expect("id")
    }

    fn service(env: Arc<ScriptedEnvironment>) -> (Arc<ExecutionService>, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let config = ExecutionConfig {
            init_timeout_ms: 1_000,
            ping_timeout_ms: 500,
            termination_timeout_ms: 100,
            destroy_timeout_ms: 500,
        };
        ExecutionService::new(env, config, None)
    }

    #[tokio::test]
    async fn executes_and_terminates() {
        let env = Arc::new(ScriptedEnvironment::new());
        let (svc, _events) = service(env.clone());
        let snap = id("npm:example");
        svc.execute_snap(&snap, "echo", vec!["console".into()])
            .await
            .expect("execute");
        let job = svc.job_for(&snap).expect("mapped");

        let params = SnapRpcParams {
            target: snap.to_string(),
            origin: "https://dapp.test".into(),
            handler: snaps_protocol::HandlerType::OnRpcRequest,
            request: json!({"method": "hello"}),
        };
        let reply = svc.handle_rpc_request(&snap, params).await.expect("rpc");
        assert_eq!(reply["method"], json!("hello"));

        svc.terminate(&job).await.expect("terminate");
        assert!(svc.job_for(&snap).is_none());
        assert_eq!(env.live_contexts(), 0);
        assert!(matches!(
            svc.terminate(&job).await,
            Err(ExecutionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_concurrent_execute_is_rejected() {
        let env = Arc::new(ScriptedEnvironment::new());
        let (svc, _events) = service(env);
        let snap = id("npm:example");
        let first = {
            let svc = svc.clone();
            let snap = snap.clone();
            tokio::spawn(async move { svc.execute_snap(&snap, "echo", vec![]).await })
        };
        let second = svc.execute_snap(&snap, "echo", vec![]);
        let (first, second) = tokio::join!(first, second);
        let outcomes = [first.expect("join").is_ok(), second.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(svc.job_count(), 1);
    }

    #[tokio::test]
    async fn stuck_session_is_torn_down_anyway() {
        let env = Arc::new(ScriptedEnvironment::new());
        let (svc, _events) = service(env.clone());
        let snap = id("npm:stuck");
        svc.execute_snap(&snap, GuestScript::IGNORE_TERMINATE, vec![])
            .await
            .expect("execute");
        let job = svc.job_for(&snap).expect("mapped");
        tokio::time::timeout(Duration::from_secs(2), svc.terminate(&job))
            .await
            .expect("bounded")
            .expect("forced");
        assert!(svc.job_for(&snap).is_none());
        assert_eq!(env.live_contexts(), 0);
    }

    #[tokio::test]
    async fn failed_start_releases_the_slot() {
        let env = Arc::new(ScriptedEnvironment::new());
        let (svc, _events) = service(env.clone());
        let snap = id("npm:broken");
        let err = svc
            .execute_snap(&snap, GuestScript::FAIL_EXECUTE, vec![])
            .await
            .expect_err("fails");
        assert!(matches!(err, ExecutionError::Rpc(_)));
        assert!(svc.job_for(&snap).is_none());
        assert_eq!(svc.job_count(), 0);
        assert_eq!(env.live_contexts(), 0);
        svc.execute_snap(&snap, "echo", vec![]).await.expect("retry works");
    }

    #[tokio::test]
    async fn notifications_become_events() {
        let env = Arc::new(ScriptedEnvironment::new());
        let (svc, mut events) = service(env.clone());
        let snap = id("npm:example");
        svc.execute_snap(&snap, "echo", vec![]).await.expect("execute");

        env.notify(&snap, notifications::OUTBOUND_REQUEST, None);
        env.notify(&snap, "Bogus", None);
        env.notify(
            &snap,
            notifications::UNHANDLED_ERROR,
            Some(json!({"error": {"code": -32603, "message": "boom"}})),
        );
        env.notify(&snap, notifications::OUTBOUND_RESPONSE, None);

        let first = events.recv().await.expect("event");
        assert_eq!(first, ExecutionEvent::OutboundRequest { snap_id: snap.clone() });
        match events.recv().await.expect("event") {
            ExecutionEvent::UnhandledError { error, .. } => assert_eq!(error.message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        // Processing stops after an unhandled error.
        let late = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn terminate_snap_requires_a_session() {
        let env = Arc::new(ScriptedEnvironment::new());
        let (svc, _events) = service(env);
        assert!(matches!(
            svc.terminate_snap(&id("npm:idle")).await,
            Err(ExecutionError::NotRunning(_))
        ));
        svc.execute_snap(&id("npm:a"), "echo", vec![]).await.expect("a");
        svc.execute_snap(&id("npm:b"), "echo", vec![]).await.expect("b");
        svc.terminate_all().await;
        assert_eq!(svc.job_count(), 0);
    }
}
