use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use snaps_core::SnapId;
use snaps_protocol::{
    channels, methods, notifications, ExecuteSnapParams, RpcErrorObject, RpcMessage,
    RpcNotification, RpcRequest, RpcResponse, SnapRpcParams,
};
use snaps_runtime::{
    ChannelMux, ContextHandle, EnvironmentError, EnvironmentFactory, SubChannel, SubChannelSender,
    Transport,
};
use tokio::task::JoinHandle;

/// Guest behaviour, read from the "source code" handed over by `executeSnap`.
///
/// The source is a list of directives separated by `;` or newlines:
///
/// | directive | effect |
/// |---|---|
/// | `echo` (default) | `snapRpc` answers with the request payload |
/// | `hang` | `snapRpc` never answers |
/// | `throw` | `snapRpc` answers with an internal error |
/// | `delay:<ms>` | `snapRpc` echoes after a delay |
/// | `outbound:<ms>` | `snapRpc` brackets a wait with `OutboundRequest`/`OutboundResponse` |
/// | `call-host` | `snapRpc` forwards `snap_getState` over the RPC channel and returns the reply |
/// | `delay-execute:<ms>` | `executeSnap` is acknowledged after a delay |
/// | `fail-execute` | `executeSnap` fails |
/// | `ignore-terminate` | `terminate` is never acknowledged |
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuestScript {
    pub rpc: RpcBehaviour,
    pub execute_delay: Option<Duration>,
    pub fail_execute: bool,
    pub ignore_terminate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RpcBehaviour {
    #[default]
    Echo,
    Hang,
    Throw,
    Delay(Duration),
    Outbound(Duration),
    CallHost,
}

impl GuestScript {
    pub const IGNORE_TERMINATE: &'static str = "ignore-terminate";
    pub const FAIL_EXECUTE: &'static str = "fail-execute";

    pub fn parse(source: &str) -> Self {
        let mut script = GuestScript::default();
        for directive in source
            .split(|c| c == ';' || c == '\n')
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            let (name, arg) = match directive.split_once(':') {
                Some((name, arg)) => (name, arg.trim().parse::<u64>().ok()),
                None => (directive, None),
            };
            let millis = Duration::from_millis(arg.unwrap_or(0));
            match name {
                "echo" => script.rpc = RpcBehaviour::Echo,
                "hang" => script.rpc = RpcBehaviour::Hang,
                "throw" => script.rpc = RpcBehaviour::Throw,
                "delay" => script.rpc = RpcBehaviour::Delay(millis),
                "outbound" => script.rpc = RpcBehaviour::Outbound(millis),
                "call-host" => script.rpc = RpcBehaviour::CallHost,
                "delay-execute" => script.execute_delay = Some(millis),
                Self::FAIL_EXECUTE => script.fail_execute = true,
                Self::IGNORE_TERMINATE => script.ignore_terminate = true,
                other => {
                    tracing::debug!(target: "snaps::mock", directive = other, "ignoring unknown directive")
                }
            }
        }
        script
    }
}

struct Guest {
    session_id: String,
    snap_id: Mutex<Option<SnapId>>,
    commands: SubChannelSender,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Runs every session as a tokio task inside the test process.
pub struct ScriptedEnvironment {
    next_token: AtomicU64,
    guests: Mutex<HashMap<u64, Arc<Guest>>>,
    created: AtomicUsize,
    executions: Arc<AtomicUsize>,
    stall_create: AtomicBool,
}

impl Default for ScriptedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEnvironment {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            guests: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            executions: Arc::new(AtomicUsize::new(0)),
            stall_create: AtomicBool::new(false),
        }
    }

    /// Make `create_context` hang, as a context that never becomes ready would.
    pub fn stall_create(&self, stall: bool) {
        self.stall_create.store(stall, Ordering::SeqCst);
    }

    pub fn live_contexts(&self) -> usize {
        self.guests.lock().len()
    }

    pub fn contexts_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of `executeSnap` commands received, failed ones included.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Push a notification from the session currently running `snap_id`.
    pub fn notify(&self, snap_id: &SnapId, method: &str, params: Option<Value>) -> bool {
        let guest = self
            .guests
            .lock()
            .values()
            .find(|guest| guest.snap_id.lock().as_ref() == Some(snap_id))
            .cloned();
        match guest {
            Some(guest) => guest
                .commands
                .send(RpcMessage::Notification(RpcNotification::new(method, params)).into_value())
                .is_ok(),
            None => false,
        }
    }

    /// Report an unhandled error from the session running `snap_id`.
    pub fn crash(&self, snap_id: &SnapId, message: &str) -> bool {
        self.notify(
            snap_id,
            notifications::UNHANDLED_ERROR,
            Some(json!({"error": RpcErrorObject::internal(message)})),
        )
    }
}

#[async_trait::async_trait]
impl EnvironmentFactory for ScriptedEnvironment {
    fn id(&self) -> &'static str {
        "mock.scripted"
    }

    async fn create_context(
        &self,
        session_id: &str,
    ) -> Result<(ContextHandle, Transport), EnvironmentError> {
        if self.stall_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (host, guest_end) = Transport::pair();
        let mux = ChannelMux::new(format!("guest:{session_id}"), guest_end);
        let commands = mux
            .channel(channels::COMMAND)
            .map_err(|err| EnvironmentError::Create(err.to_string()))?;
        let rpc = mux
            .channel(channels::RPC)
            .map_err(|err| EnvironmentError::Create(err.to_string()))?;

        let guest = Arc::new(Guest {
            session_id: session_id.to_string(),
            snap_id: Mutex::new(None),
            commands: commands.sender(),
            task: Mutex::new(None),
        });
        let runner = GuestRunner {
            guest: guest.clone(),
            script: Arc::new(Mutex::new(GuestScript::default())),
            rpc: Arc::new(tokio::sync::Mutex::new(rpc)),
            executions: self.executions.clone(),
            host_calls: Arc::new(AtomicU64::new(0)),
        };
        let task = tokio::spawn(runner.run(mux, commands));
        *guest.task.lock() = Some(task);

        self.guests.lock().insert(token, guest);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok((ContextHandle::new(session_id, token), host))
    }

    async fn destroy_context(&self, handle: ContextHandle) -> Result<(), EnvironmentError> {
        let guest = self
            .guests
            .lock()
            .remove(&handle.token())
            .ok_or_else(|| EnvironmentError::Destroy(format!("unknown context {handle}")))?;
        if let Some(task) = guest.task.lock().take() {
            task.abort();
        }
        tracing::debug!(target: "snaps::mock", session = %guest.session_id, "context destroyed");
        Ok(())
    }
}

#[derive(Clone)]
struct GuestRunner {
    guest: Arc<Guest>,
    script: Arc<Mutex<GuestScript>>,
    rpc: Arc<tokio::sync::Mutex<SubChannel>>,
    executions: Arc<AtomicUsize>,
    host_calls: Arc<AtomicU64>,
}

impl GuestRunner {
    async fn run(self, mux: ChannelMux, commands: SubChannel) {
        let (sender, mut inbound) = commands.split();
        while let Some(raw) = inbound.recv().await {
            let request = match RpcMessage::classify(raw) {
                Ok(RpcMessage::Request(request)) => request,
                _ => continue,
            };
            let runner = self.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let id = request.id.clone();
                if let Some(outcome) = runner.handle(request, &sender).await {
                    let response = match outcome {
                        Ok(result) => RpcResponse::success(id, result),
                        Err(error) => RpcResponse::failure(id, error),
                    };
                    let _ = sender.send(RpcMessage::Response(response).into_value());
                }
            });
        }
        drop(mux);
    }

    /// `None` means the request is never answered.
    async fn handle(
        &self,
        request: RpcRequest,
        commands: &SubChannelSender,
    ) -> Option<Result<Value, RpcErrorObject>> {
        match request.method.as_str() {
            methods::PING => Some(Ok(json!("OK"))),
            methods::EXECUTE_SNAP => Some(self.execute(request.params).await),
            methods::TERMINATE => {
                if self.script.lock().ignore_terminate {
                    None
                } else {
                    Some(Ok(json!("OK")))
                }
            }
            methods::SNAP_RPC => self.snap_rpc(request.params, commands).await,
            other => Some(Err(RpcErrorObject::method_not_found(other))),
        }
    }

    async fn execute(&self, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let params: ExecuteSnapParams = params
            .and_then(|p| serde_json::from_value(p).ok())
            .ok_or_else(|| RpcErrorObject::internal("invalid executeSnap params"))?;
        let script = GuestScript::parse(&params.source_code);
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Ok(snap_id) = SnapId::parse(&params.snap_id) {
            *self.guest.snap_id.lock() = Some(snap_id);
        }
        *self.script.lock() = script.clone();
        if let Some(delay) = script.execute_delay {
            tokio::time::sleep(delay).await;
        }
        if script.fail_execute {
            return Err(RpcErrorObject::internal("snap failed to evaluate"));
        }
        Ok(json!("OK"))
    }

    async fn snap_rpc(
        &self,
        params: Option<Value>,
        commands: &SubChannelSender,
    ) -> Option<Result<Value, RpcErrorObject>> {
        let params: SnapRpcParams = match params.and_then(|p| serde_json::from_value(p).ok()) {
            Some(params) => params,
            None => return Some(Err(RpcErrorObject::internal("invalid snapRpc params"))),
        };
        let behaviour = self.script.lock().rpc.clone();
        match behaviour {
            RpcBehaviour::Echo => Some(Ok(params.request)),
            RpcBehaviour::Hang => None,
            RpcBehaviour::Throw => Some(Err(RpcErrorObject::internal("snap threw"))),
            RpcBehaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Some(Ok(params.request))
            }
            RpcBehaviour::Outbound(delay) => {
                let note = |method: &str| {
                    RpcMessage::Notification(RpcNotification::new(method, None)).into_value()
                };
                let _ = commands.send(note(notifications::OUTBOUND_REQUEST));
                tokio::time::sleep(delay).await;
                let _ = commands.send(note(notifications::OUTBOUND_RESPONSE));
                Some(Ok(params.request))
            }
            RpcBehaviour::CallHost => Some(self.call_host().await),
        }
    }

    async fn call_host(&self) -> Result<Value, RpcErrorObject> {
        let mut rpc = self.rpc.lock().await;
        let id = format!("guest-{}", self.host_calls.fetch_add(1, Ordering::SeqCst));
        rpc.send(RpcMessage::Request(RpcRequest::new(id.as_str(), "snap_getState")).into_value())
            .map_err(|err| RpcErrorObject::internal(err.to_string()))?;
        while let Some(raw) = rpc.recv().await {
            if let Ok(RpcMessage::Response(response)) = RpcMessage::classify(raw) {
                return response.into_result();
            }
        }
        Err(RpcErrorObject::internal("rpc channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_combine() {
        let script = GuestScript::parse("ignore-terminate; delay:25\ndelay-execute:10");
        assert!(script.ignore_terminate);
        assert!(!script.fail_execute);
        assert_eq!(script.rpc, RpcBehaviour::Delay(Duration::from_millis(25)));
        assert_eq!(script.execute_delay, Some(Duration::from_millis(10)));
        assert_eq!(GuestScript::parse("anything else").rpc, RpcBehaviour::Echo);
    }

    #[tokio::test]
    async fn contexts_are_tracked_until_destroyed() {
        let env = ScriptedEnvironment::new();
        let (handle, _transport) = env.create_context("s1").await.expect("create");
        assert_eq!(env.live_contexts(), 1);
        assert_eq!(env.contexts_created(), 1);
        env.destroy_context(handle.clone()).await.expect("destroy");
        assert_eq!(env.live_contexts(), 0);
        assert!(env.destroy_context(handle).await.is_err());
    }
}
