//! Single-flight coalescing of async work
//!
//! Concurrent callers asking for the same key share one execution of the
//! work instead of repeating it. The first caller (the leader) spawns the
//! work as a detached task; later callers (followers) attach to the same
//! shared handle and observe the identical result.
//!
//! The work runs to completion even if every caller goes away. The spawned
//! task removes its own registry entry when it finishes, so anything the
//! work records before returning (cache inserts, negative-cache entries) is
//! visible before a new flight for the same key can start.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a caller took part in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the work.
    Leader,
    /// Attached to work another caller started.
    Follower,
}

/// The spawned work panicked or was cancelled before producing a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("in-flight task aborted: {0}")]
pub struct FlightAborted(pub String);

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, FlightAborted>>>;

struct Flight<V> {
    id: u64,
    started_at: Instant,
    result: SharedResult<V>,
}

type Registry<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

/// Registry of in-flight work keyed by `K`, each producing a `V`.
pub struct SingleFlight<K, V> {
    flights: Registry<K, V>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `work` for `key`, or attach to the flight already running for it.
    ///
    /// `work` is only polled when this caller becomes the leader; a follower's
    /// `work` is dropped unpolled.
    pub async fn run<F>(&self, key: K, work: F) -> (Result<V, FlightAborted>, Role)
    where
        F: Future<Output = V> + Send + 'static,
    {
        let (result, role) = self.join_or_start(key, work);
        (result.await, role)
    }

    fn join_or_start<F>(&self, key: K, work: F) -> (SharedResult<V>, Role)
    where
        F: Future<Output = V> + Send + 'static,
    {
        let mut flights = lock(&self.flights);
        if let Some(flight) = flights.get(&key) {
            return (flight.result.clone(), Role::Follower);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.flights);
        let owned_key = key.clone();
        let handle = tokio::spawn(async move {
            let value = work.await;
            let mut flights = lock(&registry);
            // A sweep may have replaced this flight with a newer one.
            if flights.get(&owned_key).is_some_and(|f| f.id == id) {
                flights.remove(&owned_key);
            }
            value
        });

        let registry = Arc::clone(&self.flights);
        let owned_key = key.clone();
        let result = async move {
            handle.await.map_err(|e| {
                // The task never reached its own cleanup.
                let mut flights = lock(&registry);
                if flights.get(&owned_key).is_some_and(|f| f.id == id) {
                    flights.remove(&owned_key);
                }
                FlightAborted(e.to_string())
            })
        }
        .boxed()
        .shared();

        flights.insert(
            key,
            Flight {
                id,
                started_at: Instant::now(),
                result: result.clone(),
            },
        );
        (result, Role::Leader)
    }

    /// Drop registry entries older than `max_age`.
    ///
    /// Callers already attached keep their handle and still receive the
    /// result; the next caller for the key starts a fresh flight. Returns the
    /// number of entries dropped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut flights = lock(&self.flights);
        let before = flights.len();
        flights.retain(|_, flight| flight.started_at.elapsed() <= max_age);
        let dropped = before - flights.len();
        if dropped > 0 {
            warn!(dropped, max_age_ms = max_age.as_millis() as u64, "dropped stale in-flight entries");
        } else {
            debug!("no stale in-flight entries");
        }
        dropped
    }

    /// Whether work for `key` is currently registered.
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.flights).contains_key(key)
    }

    /// Number of registered flights.
    pub fn len(&self) -> usize {
        lock(&self.flights).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<String, u64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("key".to_string(), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for h in handles {
            let (value, role) = h.await.unwrap();
            assert_eq!(value.unwrap(), 42);
            if role == Role::Leader {
                leaders += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(flight.is_empty(), "finished flight must unregister itself");
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let flight: SingleFlight<&'static str, u64> = SingleFlight::new();
        let (first, role1) = flight.run("k", async { 1 }).await;
        let (second, role2) = flight.run("k", async { 2 }).await;
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
        assert_eq!(role1, Role::Leader);
        assert_eq!(role2, Role::Leader);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let flight: SingleFlight<&'static str, &'static str> = SingleFlight::new();
        let (a, b) = tokio::join!(flight.run("a", async { "a" }), flight.run("b", async { "b" }));
        assert_eq!(a, (Ok("a"), Role::Leader));
        assert_eq!(b, (Ok("b"), Role::Leader));
    }

    #[tokio::test]
    async fn sweep_drops_stale_entries_but_attached_callers_still_finish() {
        let flight: Arc<SingleFlight<&'static str, u64>> = Arc::new(SingleFlight::new());
        let runner = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("slow", async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        7
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(flight.contains(&"slow"));
        assert_eq!(flight.sweep(Duration::from_millis(5)), 1);
        assert!(!flight.contains(&"slow"));

        let (value, _) = runner.await.unwrap();
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_entries() {
        let flight: Arc<SingleFlight<&'static str, u64>> = Arc::new(SingleFlight::new());
        let runner = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("fresh", async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flight.sweep(Duration::from_secs(30)), 0);
        assert!(flight.contains(&"fresh"));
        runner.await.unwrap().0.unwrap();
    }

    #[tokio::test]
    async fn panicking_work_reports_aborted() {
        let flight: SingleFlight<&'static str, u64> = SingleFlight::new();
        let (result, _) = flight
            .run("boom", async {
                if true {
                    panic!("work failed");
                }
                0
            })
            .await;
        assert!(result.is_err());
        assert!(flight.is_empty(), "aborted flight must not linger");
    }
}
