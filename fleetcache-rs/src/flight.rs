//! Collapses concurrent executions of the same operation into a single one.
//!
//! A [Flights](Flights) table keeps track of all calls which are currently running ("in
//! flight"). If a call for a key is requested while another one for the same key is still
//! running, the caller doesn't start a second execution but waits for the first one and
//! receives a clone of its outcome. Once a call completes, it is removed from the table before
//! any waiter is woken up. Therefore a call which starts after a completed one always executes
//! afresh.
//!
//! The outcome of each call is broadcast via a [tokio::sync::watch] channel. The leader (the
//! caller which actually executes the future) owns the sender, all followers hold a receiver.
//!
//! Some failure modes need special care:
//! * If the leader panics, the panic is caught and reported to the leader and all followers as
//!   [CacheError::Panicked](crate::group::CacheError::Panicked). The key is released so that
//!   the next call runs again.
//! * If the leader is cancelled (its future is dropped), the table entry is removed and the
//!   sender is dropped without an outcome. Each follower then retries and one of them becomes
//!   the new leader.
//!
//! # Example
//!
//! ```
//! # use fleetcache::flight::Flights;
//! # use fleetcache::group::CacheError;
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let flights: Flights<i32> = Flights::new();
//! let value = flights.run("answer", async { Ok::<i32, CacheError>(42) }).await;
//!
//! assert_eq!(value.unwrap(), 42);
//! assert_eq!(flights.in_flight(), 0);
//! # });
//! ```
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::FutureExt;
use tokio::sync::watch;

use crate::group::CacheError;

type Outcome<V> = Option<Result<V, CacheError>>;

/// Keeps track of all calls in flight, keyed by name.
pub struct Flights<V> {
    calls: Mutex<HashMap<String, watch::Receiver<Outcome<V>>>>,
    shared: AtomicUsize,
}

enum Role<V> {
    Leader(watch::Sender<Outcome<V>>),
    Follower(watch::Receiver<Outcome<V>>),
}

/// Removes the table entry of a call, once its leader either completed or was dropped.
struct Landing<'a, V> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<Outcome<V>>>>,
    key: &'a str,
}

impl<V> Drop for Landing<'_, V> {
    fn drop(&mut self) {
        let _ = self.calls.lock().unwrap().remove(self.key);
    }
}

impl<V: Clone> Default for Flights<V> {
    fn default() -> Self {
        Flights::new()
    }
}

impl<V: Clone> Flights<V> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Flights {
            calls: Mutex::new(HashMap::new()),
            shared: AtomicUsize::new(0),
        }
    }

    /// Executes the given future unless another call for the same key is already in flight.
    ///
    /// In the latter case, the given future is dropped without being polled and the outcome
    /// of the running call is returned instead.
    pub async fn run<F>(&self, key: &str, call: F) -> Result<V, CacheError>
    where
        F: Future<Output = Result<V, CacheError>>,
    {
        loop {
            let role = {
                let mut calls = self.calls.lock().unwrap();
                match calls.get(key) {
                    Some(receiver) => Role::Follower(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        let _ = calls.insert(key.to_owned(), receiver);
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Leader(sender) => return self.lead(key, sender, call).await,
                Role::Follower(receiver) => {
                    let _ = self.shared.fetch_add(1, Ordering::Relaxed);
                    if let Some(outcome) = follow(receiver).await {
                        return outcome;
                    }
                    log::debug!("The call for {} was cancelled. Retrying...", key);
                }
            }
        }
    }

    async fn lead<F>(
        &self,
        key: &str,
        sender: watch::Sender<Outcome<V>>,
        call: F,
    ) -> Result<V, CacheError>
    where
        F: Future<Output = Result<V, CacheError>>,
    {
        let landing = Landing {
            calls: &self.calls,
            key,
        };

        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic);
                log::error!("The call for {} panicked: {}", key, message);
                Err(CacheError::Panicked(message))
            }
        };

        drop(landing);
        let _ = sender.send(Some(outcome.clone()));

        outcome
    }

    /// Returns the number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Returns the number of callers which joined a call in flight instead of starting one.
    pub fn shared(&self) -> usize {
        self.shared.load(Ordering::Relaxed)
    }
}

/// Waits for the outcome of a call or returns **None** if its leader was dropped.
async fn follow<V: Clone>(mut receiver: watch::Receiver<Outcome<V>>) -> Outcome<V> {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use crate::flight::Flights;
    use crate::group::CacheError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn multi_threaded() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap()
    }

    fn explode() -> Result<String, CacheError> {
        panic!("loader exploded");
    }

    /// Waits until the given number of callers joined the call in flight.
    async fn await_followers<V: Clone>(flights: &Flights<V>, followers: usize) {
        while flights.shared() < followers {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn concurrent_calls_are_executed_once() {
        multi_threaded().block_on(async {
            let flights = Arc::new(Flights::new());
            let executions = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Notify::new());

            let mut tasks = Vec::new();
            for _ in 0..10 {
                let flights = flights.clone();
                let executions = executions.clone();
                let gate = gate.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .run("key", async move {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            Ok::<String, CacheError>("value".to_owned())
                        })
                        .await
                }));
            }

            await_followers(&flights, 9).await;
            gate.notify_one();

            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap(), "value");
            }
            assert_eq!(executions.load(Ordering::SeqCst), 1);
            assert_eq!(flights.in_flight(), 0);
        });
    }

    #[test]
    fn sequential_calls_are_executed_afresh() {
        crate::testing::test_async(async {
            let flights = Flights::new();
            let executions = AtomicUsize::new(0);

            for _ in 0..2 {
                let result = flights
                    .run("key", async {
                        Ok::<usize, CacheError>(executions.fetch_add(1, Ordering::SeqCst))
                    })
                    .await;
                assert_eq!(result.is_ok(), true);
            }

            assert_eq!(executions.load(Ordering::SeqCst), 2);
            assert_eq!(flights.shared(), 0);
        });
    }

    #[test]
    fn errors_are_broadcast_to_all_waiters() {
        multi_threaded().block_on(async {
            let flights = Arc::new(Flights::<String>::new());
            let gate = Arc::new(Notify::new());

            let mut tasks = Vec::new();
            for _ in 0..5 {
                let flights = flights.clone();
                let gate = gate.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .run("key", async move {
                            gate.notified().await;
                            Err(CacheError::LoadFailed(Arc::new(anyhow::anyhow!(
                                "backend down"
                            ))))
                        })
                        .await
                }));
            }

            await_followers(&flights, 4).await;
            gate.notify_one();

            for task in tasks {
                let error = task.await.unwrap().unwrap_err();
                assert_eq!(error.to_string(), "Failed to load the value: backend down");
            }
        });
    }

    #[test]
    fn panics_are_reported_and_release_the_key() {
        multi_threaded().block_on(async {
            let flights = Arc::new(Flights::<String>::new());
            let gate = Arc::new(Notify::new());

            let leader = {
                let flights = flights.clone();
                let gate = gate.clone();
                tokio::spawn(async move {
                    flights
                        .run("key", async move {
                            gate.notified().await;
                            explode()
                        })
                        .await
                })
            };

            while flights.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let follower = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .run("key", async { Ok("follower".to_owned()) })
                        .await
                })
            };

            await_followers(&flights, 1).await;
            gate.notify_one();

            assert_eq!(
                leader.await.unwrap().unwrap_err(),
                CacheError::Panicked("loader exploded".to_owned())
            );
            assert_eq!(
                follower.await.unwrap().unwrap_err(),
                CacheError::Panicked("loader exploded".to_owned())
            );

            // The key is free again...
            assert_eq!(flights.in_flight(), 0);
            let result = flights.run("key", async { Ok("fresh".to_owned()) }).await;
            assert_eq!(result.unwrap(), "fresh");
        });
    }

    #[test]
    fn followers_take_over_if_the_leader_is_cancelled() {
        multi_threaded().block_on(async {
            let flights = Arc::new(Flights::<String>::new());

            let leader = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .run("key", async {
                            futures::future::pending::<()>().await;
                            Ok("never".to_owned())
                        })
                        .await
                })
            };

            while flights.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let follower = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .run("key", async { Ok("follower".to_owned()) })
                        .await
                })
            };

            await_followers(&flights, 1).await;
            leader.abort();

            assert_eq!(follower.await.unwrap().unwrap(), "follower");
            assert_eq!(flights.in_flight(), 0);
        });
    }
}
