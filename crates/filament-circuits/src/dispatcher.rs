//! Per-circuit serialized executor.
//!
//! Each circuit owns one dispatcher: a single worker task fed by a bounded
//! queue. Jobs run one at a time in arrival order, so per-circuit logic
//! behaves as if single-threaded even though the process runs many
//! circuits on the shared runtime. The dispatcher binds the circuit handle
//! into every job it runs; nothing in this crate reaches for an ambient
//! "current circuit".

use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::host::Circuit;

type Job = Box<dyn FnOnce(Circuit) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Error)]
#[error("circuit dispatcher is closed")]
pub struct DispatcherClosed;

pub struct Dispatcher {
    intake: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
}

impl Dispatcher {
    /// Spawns the worker task; must run inside a tokio runtime.
    pub fn new(circuit: Circuit, queue_depth: usize) -> Self {
        let (intake, mut jobs) = mpsc::channel::<Job>(queue_depth.max(1));
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let task = job(circuit.clone());
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    warn!(circuit_id = %circuit.id(), "dispatched circuit task panicked");
                }
            }
        });
        Self {
            intake: parking_lot::Mutex::new(Some(intake)),
        }
    }

    /// Queues `job` and waits for it to run to completion. Jobs queued
    /// while another is executing run strictly after it, FIFO. There is no
    /// internal timeout: a stalled job occupies the dispatcher until it
    /// finishes.
    pub async fn run<T, F, Fut>(&self, job: F) -> Result<T, DispatcherClosed>
    where
        F: FnOnce(Circuit) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done, outcome) = oneshot::channel();
        let boxed: Job = Box::new(move |circuit| {
            Box::pin(async move {
                let _ = done.send(job(circuit).await);
            })
        });

        let sender = self
            .intake
            .lock()
            .as_ref()
            .cloned()
            .ok_or(DispatcherClosed)?;
        sender.send(boxed).await.map_err(|_| DispatcherClosed)?;
        outcome.await.map_err(|_| DispatcherClosed)
    }

    /// Stops intake. Jobs already queued still run; the worker exits once
    /// the queue drains.
    pub fn close(&self) {
        self.intake.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.intake.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityIssuer;
    use crate::proxy::ClientProxy;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn circuit() -> Circuit {
        let issuer = IdentityIssuer::new("dispatcher-tests").unwrap();
        Circuit::new(issuer.issue().unwrap(), Arc::new(ClientProxy::unbound()))
    }

    #[test_deadline::tokio_deadline]
    async fn jobs_run_in_arrival_order_without_overlap() {
        let dispatcher = Arc::new(Dispatcher::new(circuit(), 16));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut waiters = Vec::new();
        for index in 0..8usize {
            let dispatcher = Arc::clone(&dispatcher);
            let log = Arc::clone(&log);
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            waiters.push(tokio::spawn(async move {
                dispatcher
                    .run(move |_circuit| async move {
                        if in_flight.swap(true, Ordering::SeqCst) {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        log.lock().push(index);
                        in_flight.store(false, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
            // Let the spawned caller enqueue before the next one exists so
            // arrival order is deterministic.
            tokio::task::yield_now().await;
        }
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test_deadline::tokio_deadline]
    async fn run_returns_the_job_result() {
        let dispatcher = Dispatcher::new(circuit(), 4);
        let value = dispatcher.run(|_circuit| async { 7u32 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test_deadline::tokio_deadline]
    async fn the_bound_circuit_handle_reaches_every_job() {
        let circuit = circuit();
        let expected = circuit.id().clone();
        let dispatcher = Dispatcher::new(circuit, 4);
        let seen = dispatcher
            .run(|circuit| async move { circuit.id().clone() })
            .await
            .unwrap();
        assert_eq!(seen, expected);
    }

    #[test_deadline::tokio_deadline]
    async fn closed_dispatcher_rejects_new_jobs() {
        let dispatcher = Dispatcher::new(circuit(), 4);
        dispatcher.close();
        assert!(dispatcher.is_closed());
        assert!(dispatcher.run(|_circuit| async {}).await.is_err());
    }

    #[test_deadline::tokio_deadline]
    async fn a_panicking_job_does_not_kill_the_worker() {
        let dispatcher = Dispatcher::new(circuit(), 4);
        let result = dispatcher
            .run(|_circuit| async { panic!("job panic") })
            .await;
        assert!(result.is_err());

        let value = dispatcher.run(|_circuit| async { 3u32 }).await.unwrap();
        assert_eq!(value, 3);
    }
}
