use std::sync::Arc;

use parking_lot::Mutex;
use snaps_core::SnapId;
use snaps_protocol::{RpcErrorObject, RpcMessage, RpcResponse};
use snaps_runtime::{ChannelMux, ContextHandle, SnapRpcHost, SubChannel};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::command::CommandClient;

/// One session: the isolated context, its multiplexed transport and the tasks serving it.
pub(crate) struct Job {
    pub id: String,
    pub handle: ContextHandle,
    pub commands: CommandClient,
    mux: ChannelMux,
    rpc: Mutex<Option<SubChannel>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Job {
    pub fn new(
        id: String,
        handle: ContextHandle,
        mux: ChannelMux,
        commands: CommandClient,
        rpc: SubChannel,
    ) -> Self {
        Self {
            id,
            handle,
            commands,
            mux,
            rpc: Mutex::new(Some(rpc)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The RPC sub-channel, handed out once to whoever serves it.
    pub fn take_rpc(&self) -> Option<SubChannel> {
        self.rpc.lock().take()
    }

    pub fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Close every stream and stop every task. Idempotent.
    pub fn shutdown(&self) {
        self.commands.close();
        self.mux.close();
        self.rpc.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(target: "snaps::execution", job = %self.id, "job streams closed");
    }
}

/// Answer requests the snap issues over its RPC sub-channel.
pub(crate) fn spawn_rpc_provider(
    job_id: String,
    snap_id: SnapId,
    channel: SubChannel,
    host: Option<Arc<dyn SnapRpcHost>>,
) -> JoinHandle<()> {
    let (sender, mut inbound) = channel.split();
    tokio::spawn(async move {
        while let Some(raw) = inbound.recv().await {
            let request = match RpcMessage::classify(raw) {
                Ok(RpcMessage::Request(request)) => request,
                Ok(_) => {
                    warn!(target: "snaps::execution", job = %job_id, "ignoring non-request on rpc channel");
                    continue;
                }
                Err(err) => {
                    warn!(target: "snaps::execution", job = %job_id, error = %err, "dropping malformed rpc message");
                    continue;
                }
            };
            let sender = sender.clone();
            let host = host.clone();
            let snap_id = snap_id.clone();
            let job_id = job_id.clone();
            // A slow host call must not hold up later requests.
            tokio::spawn(async move {
                let id = request.id.clone();
                let outcome = match host {
                    Some(host) => host.handle(&snap_id, request).await,
                    None => Err(RpcErrorObject::method_not_found(&request.method)),
                };
                let response = match outcome {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(error) => RpcResponse::failure(id, error),
                };
                if sender.send(RpcMessage::Response(response).into_value()).is_err() {
                    debug!(target: "snaps::execution", job = %job_id, "rpc channel closed before reply");
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use snaps_protocol::{channels, codes, RpcRequest};
    use snaps_runtime::Transport;

    struct Echo;

    #[async_trait::async_trait]
    impl SnapRpcHost for Echo {
        async fn handle(&self, snap_id: &SnapId, request: RpcRequest) -> Result<Value, RpcErrorObject> {
            Ok(json!({"snap": snap_id.as_str(), "method": request.method}))
        }
    }

    async fn roundtrip(host: Option<Arc<dyn SnapRpcHost>>) -> RpcResponse {
        let (host_end, guest_end) = Transport::pair();
        let host_mux = ChannelMux::new("host", host_end);
        let guest_mux = ChannelMux::new("guest", guest_end);
        let snap = SnapId::parse("npm:example").expect("id");
        let _task = spawn_rpc_provider(
            "job".into(),
            snap,
            host_mux.channel(channels::RPC).expect("rpc"),
            host,
        );
        let mut guest = guest_mux.channel(channels::RPC).expect("rpc");
        guest
            .send(RpcMessage::Request(RpcRequest::new(1, "snap_getState")).into_value())
            .expect("send");
        match RpcMessage::classify(guest.recv().await.expect("reply")).expect("valid") {
            RpcMessage::Response(resp) => resp,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn host_answers_snap_requests() {
        let resp = roundtrip(Some(Arc::new(Echo))).await;
        assert_eq!(
            resp.into_result().expect("ok"),
            json!({"snap": "npm:example", "method": "snap_getState"})
        );
    }

    #[tokio::test]
    async fn without_host_requests_are_not_found() {
        let resp = roundtrip(None).await;
        assert_eq!(resp.into_result().expect_err("err").code, codes::METHOD_NOT_FOUND);
    }
}
