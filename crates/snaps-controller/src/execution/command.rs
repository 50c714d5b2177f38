use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use snaps_protocol::{RpcMessage, RpcNotification, RpcRequest, RpcResponse};
use snaps_runtime::{SubChannel, SubChannelSender};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ExecutionError;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// Request/response engine over a job's command sub-channel.
///
/// Responses are matched to waiters by id, so concurrent commands may complete in any order.
/// Notifications are forwarded to the receiver returned by [`CommandClient::new`].
pub(crate) struct CommandClient {
    sender: SubChannelSender,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl CommandClient {
    pub fn new(label: &str, channel: SubChannel) -> (Self, mpsc::UnboundedReceiver<RpcNotification>) {
        let (sender, mut inbound) = channel.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let label = label.to_string();

        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(raw) = inbound.recv().await {
                    match RpcMessage::classify(raw) {
                        Ok(RpcMessage::Response(response)) => {
                            let waiter = pending.lock().remove(&response.id.to_string());
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => {
                                    warn!(target: "snaps::execution", job = %label, id = %response.id, "dropping unmatched response");
                                }
                            }
                        }
                        Ok(RpcMessage::Notification(note)) => {
                            let _ = notify_tx.send(note);
                        }
                        Ok(RpcMessage::Request(req)) => {
                            warn!(target: "snaps::execution", job = %label, method = %req.method, "unexpected request on command channel");
                        }
                        Err(err) => {
                            warn!(target: "snaps::execution", job = %label, error = %err, "dropping malformed command message");
                        }
                    }
                }
                // Waiters see their sender dropped.
                pending.lock().clear();
                debug!(target: "snaps::execution", job = %label, "command channel ended");
            })
        };

        (
            Self {
                sender,
                pending,
                reader,
            },
            notify_rx,
        )
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ExecutionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        let mut request = RpcRequest::new(id.as_str(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }
        self.sender
            .send(RpcMessage::Request(request).into_value())?;

        let response = rx
            .await
            .map_err(|_| ExecutionError::Transport(format!("command channel closed during `{method}`")))?;
        Ok(response.into_result()?)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn close(&self) {
        self.reader.abort();
        self.pending.lock().clear();
    }
}

impl Drop for CommandClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes the waiter when the request future is dropped early (timeouts, cancelled callers).
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.id);
    }
}
