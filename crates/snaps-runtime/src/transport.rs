use serde_json::Value;
use tokio::sync::mpsc;

/// One end of a duplex stream of JSON frames between the controller and an isolated context.
#[derive(Debug)]
pub struct Transport {
    pub tx: mpsc::UnboundedSender<Value>,
    pub rx: mpsc::UnboundedReceiver<Value>,
}

impl Transport {
    /// Two connected ends, for environments that run in-process.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Transport { tx: a_tx, rx: a_rx },
            Transport { tx: b_tx, rx: b_rx },
        )
    }

    pub fn split(self) -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pair_is_cross_wired() {
        let (mut host, mut guest) = Transport::pair();
        host.tx.send(json!("to guest")).expect("send");
        guest.tx.send(json!("to host")).expect("send");
        assert_eq!(guest.rx.recv().await, Some(json!("to guest")));
        assert_eq!(host.rx.recv().await, Some(json!("to host")));
        drop(guest);
        assert_eq!(host.rx.recv().await, None);
    }
}
