// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-client bounded-concurrency work scheduling for command executors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

/// Default number of concurrent executions per client id.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// A bounded-concurrency work scheduler.
///
/// Each submitted unit of work holds one permit while its `process` step runs.
/// The `acknowledge` step always runs after `process`, whether or not
/// `process` succeeded internally, and the permit is released afterwards.
pub struct Dispatcher {
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    /// Create a dispatcher permitting `concurrency` parallel executions.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Schedule a unit of work.
    ///
    /// Returns immediately; the work waits for a permit in the background.
    /// `process` and `acknowledge` are responsible for logging their own
    /// failures; nothing is surfaced to the submitter.
    pub fn submit<P, A>(&self, process: P, acknowledge: A)
    where
        P: Future<Output = ()> + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    process.await;
                    // Acknowledgement is always attempted, even if the
                    // processing path failed internally
                    acknowledge();
                    // _permit released on drop
                }
                Err(_) => {
                    log::error!("Dispatcher semaphore closed; dropping work item");
                    acknowledge();
                }
            }
        });
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Registry mapping client ids to their shared [`Dispatcher`].
///
/// Executors on the same client id share one dispatcher so their total
/// concurrency does not multiply. Entries are created on first use and never
/// evicted; production wiring installs a single registry via the application
/// context, and tests inject their own.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: Mutex<HashMap<String, Arc<Dispatcher>>>,
}

impl DispatcherRegistry {
    /// Get the dispatcher for a client id, creating it with the given
    /// concurrency on first use. Later callers share the existing dispatcher
    /// regardless of their preferred concurrency.
    #[must_use]
    pub fn get_or_create(&self, client_id: &str, preferred_concurrency: usize) -> Arc<Dispatcher> {
        let mut dispatchers = self.dispatchers.lock().unwrap();
        dispatchers
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Dispatcher::new(preferred_concurrency)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    #[tokio::test]
    async fn acknowledge_runs_after_process() {
        let dispatcher = Dispatcher::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let order_p = order.clone();
        let order_a = order.clone();
        dispatcher.submit(
            async move {
                order_p.lock().unwrap().push("process");
            },
            move || {
                order_a.lock().unwrap().push("acknowledge");
                let _ = done_tx.send(());
            },
        );

        done_rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["process", "acknowledge"]);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let dispatcher = Arc::new(Dispatcher::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            dispatcher.submit(
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                },
                move || {
                    done.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while done.load(Ordering::SeqCst) < 8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.available_permits(), 2);
    }

    #[tokio::test]
    async fn registry_shares_dispatcher_per_client_id() {
        let registry = DispatcherRegistry::default();
        let d1 = registry.get_or_create("client-a", 4);
        let d2 = registry.get_or_create("client-a", 99);
        let d3 = registry.get_or_create("client-b", 4);
        assert!(Arc::ptr_eq(&d1, &d2));
        assert!(!Arc::ptr_eq(&d1, &d3));
        // First use fixes the concurrency
        assert_eq!(d2.available_permits(), 4);
    }
}
