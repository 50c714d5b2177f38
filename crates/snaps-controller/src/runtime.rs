use std::collections::HashMap;
use std::sync::Arc;

use snaps_core::request_queue::RequestQueue;
use snaps_core::timer::{PausableTimer, TimerStatus};
use snaps_core::{SnapId, SnapStatus, StatusEvent};
use tokio::time::Instant;

use crate::lifecycle::{SnapInterpreter, SnapMachine};

#[derive(Debug, Clone)]
pub(crate) struct InboundRequest {
    pub id: String,
    pub timer: Arc<PausableTimer>,
}

/// Controller-side bookkeeping for one snap. Never persisted.
pub(crate) struct SnapRuntime {
    pub interpreter: SnapInterpreter,
    /// Set while idle, cleared while any inbound request is in flight.
    pub last_request: Option<Instant>,
    pub pending_inbound: Vec<InboundRequest>,
    pub pending_outbound: usize,
    pub active_references: usize,
    pub queue: RequestQueue,
    /// A crash was reported while a stop was already under way.
    pub crash_requested: bool,
}

impl SnapRuntime {
    pub fn new(machine: Arc<SnapMachine>, status: SnapStatus, max_queue_size: usize) -> Self {
        Self {
            interpreter: SnapInterpreter::resume_at(machine, status),
            last_request: None,
            pending_inbound: Vec::new(),
            pending_outbound: 0,
            active_references: 0,
            queue: RequestQueue::new(max_queue_size),
            crash_requested: false,
        }
    }

    /// The event a stop settles on. A pending crash report wins over a plain stop.
    pub fn stop_event(&mut self, requested: StatusEvent) -> StatusEvent {
        if std::mem::take(&mut self.crash_requested) {
            StatusEvent::Crash
        } else {
            requested
        }
    }

    pub fn begin_inbound(&mut self, id: String, timer: Arc<PausableTimer>) {
        self.pending_inbound.push(InboundRequest { id, timer });
        self.last_request = None;
    }

    /// Drop the request from the in-flight list; the snap becomes idle-eligible when it was the
    /// last one.
    pub fn finish_inbound(&mut self, id: &str) {
        self.pending_inbound.retain(|req| req.id != id);
        if self.pending_inbound.is_empty() {
            self.last_request = Some(Instant::now());
        }
    }

    pub fn outbound_started(&mut self) {
        self.pending_outbound += 1;
        for req in &self.pending_inbound {
            if req.timer.status() == TimerStatus::Running {
                let _ = req.timer.pause();
            }
        }
    }

    pub fn outbound_finished(&mut self) {
        self.pending_outbound = self.pending_outbound.saturating_sub(1);
        if self.pending_outbound == 0 {
            for req in &self.pending_inbound {
                if req.timer.status() == TimerStatus::Paused {
                    let _ = req.timer.resume();
                }
            }
        }
    }

    pub fn is_idle_for(&self, now: Instant, max_idle: std::time::Duration) -> bool {
        self.active_references == 0
            && self.pending_inbound.is_empty()
            && self
                .last_request
                .map(|last| now.saturating_duration_since(last) > max_idle)
                .unwrap_or(false)
    }

    /// Forget everything tied to a session that just ended.
    pub fn reset_session(&mut self) {
        for req in self.pending_inbound.drain(..) {
            req.timer.cancel();
        }
        self.pending_outbound = 0;
        self.last_request = None;
    }
}

pub(crate) type Runtimes = HashMap<SnapId, SnapRuntime>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::snap_machine;
    use std::time::Duration;

    fn runtime() -> SnapRuntime {
        SnapRuntime::new(snap_machine().expect("machine"), SnapStatus::Running, 5)
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_calls_pause_running_timers() {
        let mut rt = runtime();
        let timer = Arc::new(PausableTimer::new(Duration::from_secs(10)));
        timer.start().expect("start");
        rt.begin_inbound("a".into(), timer.clone());
        assert!(rt.last_request.is_none());

        rt.outbound_started();
        rt.outbound_started();
        assert_eq!(timer.status(), TimerStatus::Paused);
        tokio::time::advance(Duration::from_secs(30)).await;
        rt.outbound_finished();
        assert_eq!(timer.status(), TimerStatus::Paused);
        rt.outbound_finished();
        assert_eq!(timer.status(), TimerStatus::Running);
        assert_eq!(timer.remaining(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_requires_no_references_and_no_requests() {
        let mut rt = runtime();
        let max_idle = Duration::from_secs(5);
        assert!(!rt.is_idle_for(Instant::now(), max_idle));

        let timer = Arc::new(PausableTimer::new(Duration::from_secs(10)));
        rt.begin_inbound("a".into(), timer);
        rt.finish_inbound("a");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(rt.is_idle_for(Instant::now(), max_idle));

        rt.active_references = 1;
        assert!(!rt.is_idle_for(Instant::now(), max_idle));
    }

    #[test]
    fn pending_crash_overrides_one_stop() {
        let mut rt = runtime();
        assert_eq!(rt.stop_event(StatusEvent::Stop), StatusEvent::Stop);
        rt.crash_requested = true;
        assert_eq!(rt.stop_event(StatusEvent::Stop), StatusEvent::Crash);
        assert_eq!(rt.stop_event(StatusEvent::Stop), StatusEvent::Stop);
    }

    #[test]
    fn reset_cancels_timers() {
        let mut rt = runtime();
        let timer = Arc::new(PausableTimer::new(Duration::from_secs(1)));
        rt.begin_inbound("a".into(), timer.clone());
        rt.pending_outbound = 2;
        rt.reset_session();
        assert_eq!(timer.status(), TimerStatus::Finished);
        assert!(rt.pending_inbound.is_empty());
        assert_eq!(rt.pending_outbound, 0);
    }
}
