//! Named sub-channels over a single [`Transport`].
//!
//! Every write is wrapped in a [`MuxFrame`] carrying the sub-channel name; a reader task routes
//! incoming frames to the matching sub-channel queue. Frames for names nobody registered are
//! logged and dropped. When the parent transport ends, or [`ChannelMux::close`] is called, every
//! sub-channel ends too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use snaps_protocol::MuxFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::Transport;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("sub-channel `{0}` is already registered")]
    Duplicate(String),
    #[error("multiplexed transport is closed")]
    Closed,
}

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>>;

pub struct ChannelMux {
    outbound: mpsc::UnboundedSender<Value>,
    routes: Routes,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    label: Arc<str>,
}

impl ChannelMux {
    /// Take ownership of `transport` and start routing. Must be called inside a tokio runtime.
    pub fn new(label: impl Into<String>, transport: Transport) -> Self {
        let (outbound, mut inbound) = transport.split();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let label: Arc<str> = Arc::from(label.into());

        let reader = {
            let routes = routes.clone();
            let closed = closed.clone();
            let label = label.clone();
            tokio::spawn(async move {
                while let Some(raw) = inbound.recv().await {
                    let frame: MuxFrame = match serde_json::from_value(raw) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(target: "snaps::mux", mux = %label, error = %err, "dropping malformed frame");
                            continue;
                        }
                    };
                    let route = routes.lock().get(&frame.name).cloned();
                    match route {
                        Some(tx) => {
                            if tx.send(frame.data).is_err() {
                                tracing::debug!(target: "snaps::mux", mux = %label, channel = %frame.name, "sub-channel receiver gone");
                            }
                        }
                        None => {
                            tracing::warn!(target: "snaps::mux", mux = %label, channel = %frame.name, "dropping frame for unknown sub-channel");
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                routes.lock().clear();
                tracing::debug!(target: "snaps::mux", mux = %label, "transport ended");
            })
        };

        Self {
            outbound,
            routes,
            closed,
            reader: Mutex::new(Some(reader)),
            label,
        }
    }

    pub fn channel(&self, name: &str) -> Result<SubChannel, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let mut routes = self.routes.lock();
        if routes.contains_key(name) {
            return Err(MuxError::Duplicate(name.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(name.to_string(), tx);
        Ok(SubChannel {
            sender: SubChannelSender {
                name: Arc::from(name),
                outbound: self.outbound.clone(),
                closed: self.closed.clone(),
            },
            rx,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// End every sub-channel and stop reading. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.routes.lock().clear();
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
            tracing::debug!(target: "snaps::mux", mux = %self.label, "closed");
        }
    }
}

impl Drop for ChannelMux {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write half of a sub-channel; cheap to clone.
#[derive(Clone)]
pub struct SubChannelSender {
    name: Arc<str>,
    outbound: mpsc::UnboundedSender<Value>,
    closed: Arc<AtomicBool>,
}

impl SubChannelSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, data: Value) -> Result<(), MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::Closed);
        }
        let frame = serde_json::to_value(MuxFrame::new(self.name.as_ref(), data))
            .map_err(|_| MuxError::Closed)?;
        self.outbound.send(frame).map_err(|_| MuxError::Closed)
    }
}

pub struct SubChannel {
    sender: SubChannelSender,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl SubChannel {
    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub fn sender(&self) -> SubChannelSender {
        self.sender.clone()
    }

    pub fn send(&self, data: Value) -> Result<(), MuxError> {
        self.sender.send(data)
    }

    /// `None` once the mux is closed or the parent transport ended.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn split(self) -> (SubChannelSender, mpsc::UnboundedReceiver<Value>) {
        (self.sender, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn routes_frames_by_name() {
        let (host, guest) = Transport::pair();
        let host_mux = ChannelMux::new("host", host);
        let guest_mux = ChannelMux::new("guest", guest);

        let host_cmd = host_mux.channel("command").expect("command");
        let host_rpc = host_mux.channel("jsonRpc").expect("rpc");
        let mut guest_cmd = guest_mux.channel("command").expect("command");
        let mut guest_rpc = guest_mux.channel("jsonRpc").expect("rpc");

        host_rpc.send(json!({"rpc": 1})).expect("send");
        host_cmd.send(json!({"cmd": 1})).expect("send");

        assert_eq!(guest_cmd.recv().await, Some(json!({"cmd": 1})));
        assert_eq!(guest_rpc.recv().await, Some(json!({"rpc": 1})));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (host, _guest) = Transport::pair();
        let mux = ChannelMux::new("host", host);
        let _first = mux.channel("command").expect("first");
        assert_eq!(
            mux.channel("command").err(),
            Some(MuxError::Duplicate("command".into()))
        );
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_dropped() {
        let (host, guest) = Transport::pair();
        let mux = ChannelMux::new("host", host);
        let mut cmd = mux.channel("command").expect("command");

        guest.tx.send(json!("garbage")).expect("send");
        guest
            .tx
            .send(json!({"name": "nobody", "data": 1}))
            .expect("send");
        guest
            .tx
            .send(json!({"name": "command", "data": 2}))
            .expect("send");
        assert_eq!(cmd.recv().await, Some(json!(2)));
    }

    #[tokio::test]
    async fn channels_registered_later_receive_later_frames() {
        let (host, guest) = Transport::pair();
        let mux = ChannelMux::new("host", host);
        let mut first = mux.channel("command").expect("command");

        guest
            .tx
            .send(json!({"name": "jsonRpc", "data": "early"}))
            .expect("send");
        guest
            .tx
            .send(json!({"name": "command", "data": 1}))
            .expect("send");
        assert_eq!(first.recv().await, Some(json!(1)));

        let mut late = mux.channel("jsonRpc").expect("rpc");
        guest
            .tx
            .send(json!({"name": "jsonRpc", "data": "late"}))
            .expect("send");
        assert_eq!(late.recv().await, Some(json!("late")));
    }

    #[tokio::test]
    async fn parent_eof_ends_sub_channels() {
        let (host, guest) = Transport::pair();
        let mux = ChannelMux::new("host", host);
        let mut cmd = mux.channel("command").expect("command");
        drop(guest);
        let ended = tokio::time::timeout(Duration::from_secs(1), cmd.recv())
            .await
            .expect("sub-channel should end");
        assert_eq!(ended, None);
        assert!(mux.is_closed());
        assert_eq!(mux.channel("late").err(), Some(MuxError::Closed));
    }

    #[tokio::test]
    async fn close_ends_reads_and_rejects_writes() {
        let (host, _guest) = Transport::pair();
        let mux = ChannelMux::new("host", host);
        let mut cmd = mux.channel("command").expect("command");
        let sender = cmd.sender();
        mux.close();
        mux.close();
        assert_eq!(cmd.recv().await, None);
        assert_eq!(sender.send(json!(1)), Err(MuxError::Closed));
    }
}
