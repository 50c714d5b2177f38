use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;

type Flights<T> = Arc<Mutex<HashMap<String, Arc<FlightState<T>>>>>;

/// Collapses concurrent operations on the same key into one.
///
/// The first caller for a key becomes the leader: its future is spawned onto the runtime so it
/// runs to completion even if every caller goes away. Later callers for the same key attach as
/// followers and receive a clone of the same output. The key is released as soon as the output
/// is ready, so a caller arriving after that starts a fresh flight.
pub(crate) struct Singleflight<T> {
    flights: Flights<T>,
}

impl<T> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Singleflight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn begin<F, Fut>(&self, key: &str, make: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (state, runner) = {
            let mut map = self.lock();
            if let Some(state) = map.get(key) {
                state.add_ref();
                return Flight::new(self.flights.clone(), key, Arc::clone(state), false);
            }
            let state = Arc::new(FlightState::new());
            map.insert(key.to_string(), Arc::clone(&state));
            // One ref for the caller, one for the spawned runner.
            state.add_ref();
            let runner = Flight::new(self.flights.clone(), key, Arc::clone(&state), true);
            (state, runner)
        };
        let fut = make();
        tokio::spawn(async move {
            let output = fut.await;
            runner.complete(output);
        });
        Flight::new(self.flights.clone(), key, state, true)
    }

    pub(crate) fn in_flight(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<FlightState<T>>>> {
        self.flights.lock()
    }
}

enum Slot<T> {
    Pending,
    Done(T),
    Abandoned,
}

struct FlightState<T> {
    slot: watch::Sender<Slot<T>>,
    refs: AtomicUsize,
}

impl<T> FlightState<T> {
    fn new() -> Self {
        let (slot, _) = watch::channel(Slot::Pending);
        Self {
            slot,
            refs: AtomicUsize::new(1),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

pub(crate) struct Flight<T> {
    flights: Flights<T>,
    key: String,
    state: Arc<FlightState<T>>,
    leader: bool,
}

impl<T: Clone> Flight<T> {
    fn new(flights: Flights<T>, key: &str, state: Arc<FlightState<T>>, leader: bool) -> Self {
        Self {
            flights,
            key: key.to_string(),
            state,
            leader,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader
    }

    /// The shared output, or `None` if the runner died before producing one.
    pub(crate) async fn wait(&self) -> Option<T> {
        let mut rx = self.state.slot.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .ok()?;
        match &*slot {
            Slot::Done(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Publish the output and release the key in one step under the map lock.
    fn complete(self, output: T) {
        let mut map = self.flights.lock();
        self.detach(&mut map);
        self.state.slot.send_replace(Slot::Done(output));
        drop(map);
    }
}

impl<T> Flight<T> {
    fn detach(&self, map: &mut HashMap<String, Arc<FlightState<T>>>) {
        if map
            .get(&self.key)
            .is_some_and(|existing| Arc::ptr_eq(existing, &self.state))
        {
            map.remove(&self.key);
        }
    }
}

impl<T> Drop for Flight<T> {
    fn drop(&mut self) {
        let mut map = self.flights.lock();
        if self.state.release() == 0 {
            // Runner gone without an output (panic or runtime shutdown).
            self.state.slot.send_if_modified(|slot| {
                if matches!(slot, Slot::Pending) {
                    *slot = Slot::Abandoned;
                    return true;
                }
                false
            });
            self.detach(&mut map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn followers_share_the_leader_output() {
        let flights: Singleflight<u32> = Singleflight::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let calls = calls.clone();
            flights.begin("k", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.await;
                7
            })
        };
        let follower = flights.begin("k", || async { 99 });
        assert!(leader.is_leader());
        assert!(!follower.is_leader());
        assert!(flights.in_flight("k"));

        let _ = release_tx.send(());
        assert_eq!(leader.wait().await, Some(7));
        assert_eq!(follower.wait().await, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(leader);
        drop(follower);
        tokio::time::timeout(Duration::from_secs(1), async {
            while flights.in_flight("k") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("key released");
    }

    #[tokio::test]
    async fn runner_completes_after_callers_leave() {
        let flights: Singleflight<u32> = Singleflight::default();
        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = done.clone();
            let flight = flights.begin("k", move || async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
                1
            });
            drop(flight);
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while done.load(Ordering::SeqCst) == 0 || flights.in_flight("k") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("runner finished");

        let next = flights.begin("k", || async { 2 });
        assert!(next.is_leader());
        assert_eq!(next.wait().await, Some(2));
    }

    #[tokio::test]
    async fn finished_flight_is_not_joined_by_late_callers() {
        let flights: Singleflight<u32> = Singleflight::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let run = |runs: Arc<AtomicUsize>| {
            move || async move { runs.fetch_add(1, Ordering::SeqCst) as u32 + 1 }
        };

        let leader = flights.begin("k", run(runs.clone()));
        let slow_follower = flights.begin("k", run(runs.clone()));
        assert_eq!(leader.wait().await, Some(1));
        drop(leader);
        assert!(!flights.in_flight("k"));

        let late = flights.begin("k", run(runs.clone()));
        assert!(late.is_leader());
        assert_eq!(late.wait().await, Some(2));
        assert_eq!(slow_follower.wait().await, Some(1));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let flights: Singleflight<&'static str> = Singleflight::default();
        let a = flights.begin("a", || async { "a" });
        let b = flights.begin("b", || async { "b" });
        assert!(a.is_leader() && b.is_leader());
        assert_eq!(a.wait().await, Some("a"));
        assert_eq!(b.wait().await, Some("b"));
    }
}
