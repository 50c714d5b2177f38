use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snaps_core::timer::PausableTimer;
use snaps_core::{SnapId, SnapStatus, StatusEvent};
use snaps_protocol::{HandlerType, SnapRpcParams};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SnapController;
use crate::capabilities::rpc_origin_allowed;
use crate::error::SnapError;
use crate::execution::ExecutionEvent;
use crate::tasks::TaskHandle;

/// An inbound request for one of a snap's handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleRequest {
    pub snap_id: SnapId,
    pub origin: String,
    pub handler: HandlerType,
    pub request: Value,
}

impl SnapController {
    /// Dispatch a request to a snap, starting it first if needed.
    ///
    /// Every failure, a timeout included, crash-stops the snap before the error is returned.
    pub async fn handle_request(self: &Arc<Self>, request: HandleRequest) -> Result<Value, SnapError> {
        let HandleRequest {
            snap_id,
            origin,
            handler,
            request,
        } = request;

        let snap = self.get_expect(&snap_id)?;
        let permission = self.capabilities.handler_permission(handler);
        if !self.permissions.has_permission(&snap_id, permission).await {
            return Err(SnapError::NotPermitted {
                snap_id,
                handler: handler.as_str().to_string(),
            });
        }
        if handler == HandlerType::OnRpcRequest {
            let granted = self.permissions.granted_permissions(&snap_id).await;
            let caveat = granted.get(permission).cloned().unwrap_or(Value::Null);
            if !rpc_origin_allowed(&caveat, &origin) {
                return Err(SnapError::OriginNotAllowed { snap_id, origin });
            }
        }
        if !snap.enabled {
            return Err(SnapError::Disabled(snap_id));
        }
        if snap.status == SnapStatus::Installing {
            return Err(SnapError::Installing(snap_id));
        }

        if !self.is_running(&snap_id) {
            let _ticket = QueueTicket::acquire(self, &snap_id, &origin)?;
            self.start_shared(&snap_id).await?;
        }

        let timer = Arc::new(PausableTimer::new(self.config.max_request_time()));
        timer
            .start()
            .map_err(|err| SnapError::contract(err.to_string()))?;
        let request_id = uuid::Uuid::new_v4().to_string();
        {
            let mut runtimes = self.runtimes.lock();
            let rt = runtimes
                .get_mut(&snap_id)
                .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
            rt.begin_inbound(request_id.clone(), timer.clone());
        }
        let inbound = InboundGuard {
            controller: self,
            snap_id: &snap_id,
            request_id: &request_id,
        };

        let params = SnapRpcParams {
            target: snap_id.to_string(),
            origin,
            handler,
            request,
        };
        let call = self.execution.handle_rpc_request(&snap_id, params);
        tokio::pin!(call);
        let outcome = tokio::select! {
            result = &mut call => result.map_err(SnapError::from),
            timed_out = timer.elapsed() => {
                if timed_out {
                    Err(SnapError::RequestTimeout(snap_id.clone()))
                } else {
                    // Cancelled by a session reset; the call ends with the session.
                    call.await.map_err(SnapError::from)
                }
            }
        };
        timer.cancel();
        drop(inbound);

        if let Err(err) = &outcome {
            warn!(target: "snaps::controller", snap = %snap_id, %handler, error = %err, "request failed, stopping snap");
            if let Err(stop) = self.stop_with(&snap_id, StatusEvent::Crash).await {
                error!(target: "snaps::controller", snap = %snap_id, error = %stop, "failed to stop crashed snap");
            }
        }
        outcome
    }

    /// Stop every running snap that has had no traffic for longer than the idle budget.
    pub(crate) async fn stop_idle_snaps(self: &Arc<Self>) {
        let now = Instant::now();
        let max_idle = self.config.max_idle_time();
        let idle: Vec<SnapId> = self
            .runtimes
            .lock()
            .iter()
            .filter(|(_, rt)| {
                rt.interpreter.state() == SnapStatus::Running && rt.is_idle_for(now, max_idle)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for snap_id in idle {
            info!(target: "snaps::controller", snap = %snap_id, "stopping idle snap");
            if let Err(err) = self.stop_snap(&snap_id).await {
                warn!(target: "snaps::controller", snap = %snap_id, error = %err, "idle stop failed");
            }
        }
    }

    fn on_execution_event(self: &Arc<Self>, event: ExecutionEvent) {
        match event {
            ExecutionEvent::OutboundRequest { snap_id } => {
                if let Some(rt) = self.runtimes.lock().get_mut(&snap_id) {
                    rt.outbound_started();
                }
            }
            ExecutionEvent::OutboundResponse { snap_id } => {
                if let Some(rt) = self.runtimes.lock().get_mut(&snap_id) {
                    rt.outbound_finished();
                }
            }
            ExecutionEvent::UnhandledError { snap_id, error } => {
                let internal_id = self.add_snap_error(Some(&snap_id), &error);
                error!(target: "snaps::controller", snap = %snap_id, %internal_id, error = %error.message, "unhandled error in snap");
                let controller = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = controller.stop_with(&snap_id, StatusEvent::Crash).await {
                        warn!(target: "snaps::controller", snap = %snap_id, error = %err, "failed to stop crashed snap");
                    }
                });
            }
        }
    }
}

pub(super) fn spawn_execution_listener(
    controller: &Arc<SnapController>,
    mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
) -> TaskHandle {
    let weak = Arc::downgrade(controller);
    let cancel = controller.cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(controller) = weak.upgrade() else {
                break;
            };
            controller.on_execution_event(event);
        }
        debug!(target: "snaps::controller", "execution event listener stopped");
    });
    TaskHandle::new("snaps.execution_events", handle)
}

/// A caller's place in the per-origin queue of callers waiting for a start.
struct QueueTicket<'a> {
    controller: &'a SnapController,
    snap_id: &'a SnapId,
    origin: &'a str,
}

impl<'a> QueueTicket<'a> {
    fn acquire(
        controller: &'a SnapController,
        snap_id: &'a SnapId,
        origin: &'a str,
    ) -> Result<Self, SnapError> {
        let mut runtimes = controller.runtimes.lock();
        let rt = runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        rt.queue.increment(origin)?;
        Ok(Self {
            controller,
            snap_id,
            origin,
        })
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if let Some(rt) = self.controller.runtimes.lock().get_mut(self.snap_id) {
            if let Err(err) = rt.queue.decrement(self.origin) {
                debug!(target: "snaps::controller", snap = %self.snap_id, error = %err, "queue already drained");
            }
        }
    }
}

/// Takes the request off the in-flight list however the caller leaves.
struct InboundGuard<'a> {
    controller: &'a SnapController,
    snap_id: &'a SnapId,
    request_id: &'a str,
}

impl Drop for InboundGuard<'_> {
    fn drop(&mut self) {
        if let Some(rt) = self.controller.runtimes.lock().get_mut(self.snap_id) {
            rt.finish_inbound(self.request_id);
        }
    }
}
