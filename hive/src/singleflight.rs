//! Collapses concurrent calls with the same key into one.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::Mutex,
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};

/// Runs at most one future per key at a time; concurrent callers with the
/// same key wait for and share its output.
#[derive(Debug)]
pub(crate) struct SingleFlight<K, V: Clone> {
    calls: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            calls: Default::default(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Awaits the call in flight for `key`, or starts `fut` if there is
    /// none. Returns the output and whether it was shared with another
    /// caller.
    pub(crate) async fn run<F>(&self, key: K, fut: F) -> (V, bool)
    where
        F: Future<Output = V> + Send + 'static,
    {
        let (call, guard) = {
            let mut calls = self.calls.lock().expect("poisoned");
            match calls.get(&key) {
                Some(call) => (call.clone(), None),
                None => {
                    let call = fut.boxed().shared();
                    calls.insert(key.clone(), call.clone());
                    let guard = Guard {
                        flight: self,
                        key: key.clone(),
                    };
                    (call, Some(guard))
                }
            }
        };
        let shared = guard.is_none();
        let value = call.await;
        drop(guard);
        (value, shared)
    }

    /// Number of calls in flight.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.calls.lock().expect("poisoned").len()
    }
}

/// Removes the call once its first caller is done with it, whether it
/// completed or was dropped.
struct Guard<'a, K: Hash + Eq, V: Clone> {
    flight: &'a SingleFlight<K, V>,
    key: K,
}

impl<K: Hash + Eq, V: Clone> Drop for Guard<'_, K, V> {
    fn drop(&mut self) {
        self.flight.calls.lock().expect("poisoned").remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn concurrent_calls_share() {
        let flight = Arc::new(SingleFlight::<u32, u32>::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .run(1, async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }
        let mut shared = 0;
        for task in tasks {
            let (value, was_shared) = task.await.unwrap();
            assert_eq!(value, 42);
            shared += was_shared as usize;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 7);
        assert_eq!(flight.len(), 0);

        // a later call runs again
        let (value, was_shared) = flight.run(1, async { 7 }).await;
        assert_eq!((value, was_shared), (7, false));
    }

    #[tokio::test]
    async fn dropped_leader_is_forgotten() {
        let flight = SingleFlight::<u32, u32>::default();
        let slow = flight.run(1, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            1
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(10), slow)
                .await
                .is_err()
        );
        assert_eq!(flight.len(), 0);
        assert_eq!(flight.run(1, async { 2 }).await, (2, false));
    }
}
