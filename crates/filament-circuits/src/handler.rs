//! Lifecycle observers and the ordered pipeline that drives them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use tracing::warn;

use crate::host::Circuit;

/// A priority-ordered lifecycle observer. Handlers never call each other;
/// the circuit host invokes the whole pipeline at each transition.
#[async_trait]
pub trait CircuitHandler: Send + Sync {
    /// Lower values run first. Ties keep registration order.
    fn priority(&self) -> i32 {
        0
    }

    async fn on_circuit_opened(&self, _circuit: &Circuit) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_connection_up(&self, _circuit: &Circuit) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_connection_down(&self, _circuit: &Circuit) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_circuit_closed(&self, _circuit: &Circuit) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Opened,
    ConnectionUp,
    ConnectionDown,
    Closed,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Opened => "circuit_opened",
            Stage::ConnectionUp => "connection_up",
            Stage::ConnectionDown => "connection_down",
            Stage::Closed => "circuit_closed",
        }
    }
}

/// The ordered handler set for one circuit. Ordering is fixed once at
/// construction (ascending priority, stable for ties) and never changes
/// for the circuit's lifetime.
pub struct HandlerPipeline {
    handlers: Vec<Arc<dyn CircuitHandler>>,
}

impl HandlerPipeline {
    pub fn new(mut handlers: Vec<Arc<dyn CircuitHandler>>) -> Self {
        handlers.sort_by_key(|handler| handler.priority());
        Self { handlers }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub async fn circuit_opened(&self, circuit: &Circuit) {
        self.emit(Stage::Opened, circuit).await;
    }

    pub async fn connection_up(&self, circuit: &Circuit) {
        self.emit(Stage::ConnectionUp, circuit).await;
    }

    pub async fn connection_down(&self, circuit: &Circuit) {
        self.emit(Stage::ConnectionDown, circuit).await;
    }

    pub async fn circuit_closed(&self, circuit: &Circuit) {
        self.emit(Stage::Closed, circuit).await;
    }

    /// Runs every handler in order. A failing or panicking handler is
    /// logged and skipped; the rest of the pipeline and the lifecycle
    /// transition itself always proceed.
    async fn emit(&self, stage: Stage, circuit: &Circuit) {
        for handler in &self.handlers {
            let callback = match stage {
                Stage::Opened => handler.on_circuit_opened(circuit),
                Stage::ConnectionUp => handler.on_connection_up(circuit),
                Stage::ConnectionDown => handler.on_connection_down(circuit),
                Stage::Closed => handler.on_circuit_closed(circuit),
            };
            match AssertUnwindSafe(callback).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    counter!("filament_handler_failures_total", 1, "stage" => stage.name());
                    warn!(
                        circuit_id = %circuit.id(),
                        stage = stage.name(),
                        error = %err,
                        "circuit handler failed"
                    );
                }
                Err(_) => {
                    counter!("filament_handler_failures_total", 1, "stage" => stage.name());
                    warn!(
                        circuit_id = %circuit.id(),
                        stage = stage.name(),
                        "circuit handler panicked"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Circuit;
    use crate::identity::IdentityIssuer;
    use crate::proxy::ClientProxy;

    fn circuit() -> Circuit {
        let issuer = IdentityIssuer::new("handler-tests").unwrap();
        Circuit::new(issuer.issue().unwrap(), Arc::new(ClientProxy::unbound()))
    }

    struct Recorder {
        label: &'static str,
        priority: i32,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        fail: bool,
        panic: bool,
    }

    impl Recorder {
        fn ok(
            label: &'static str,
            priority: i32,
            log: &Arc<parking_lot::Mutex<Vec<&'static str>>>,
        ) -> Arc<dyn CircuitHandler> {
            Arc::new(Self {
                label,
                priority,
                log: Arc::clone(log),
                fail: false,
                panic: false,
            })
        }
    }

    #[async_trait]
    impl CircuitHandler for Recorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_circuit_opened(&self, _circuit: &Circuit) -> anyhow::Result<()> {
            self.log.lock().push(self.label);
            if self.panic {
                panic!("handler panic");
            }
            if self.fail {
                anyhow::bail!("handler failure");
            }
            Ok(())
        }
    }

    #[test_deadline::tokio_deadline]
    async fn handlers_run_in_priority_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pipeline = HandlerPipeline::new(vec![
            Recorder::ok("p5", 5, &log),
            Recorder::ok("p1", 1, &log),
            Recorder::ok("p3", 3, &log),
        ]);

        pipeline.circuit_opened(&circuit()).await;
        assert_eq!(*log.lock(), vec!["p1", "p3", "p5"]);
    }

    #[test_deadline::tokio_deadline]
    async fn equal_priorities_keep_registration_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pipeline = HandlerPipeline::new(vec![
            Recorder::ok("first", 0, &log),
            Recorder::ok("second", 0, &log),
            Recorder::ok("third", 0, &log),
        ]);

        pipeline.circuit_opened(&circuit()).await;
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test_deadline::tokio_deadline]
    async fn a_failing_handler_does_not_stop_the_rest() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let failing: Arc<dyn CircuitHandler> = Arc::new(Recorder {
            label: "p1",
            priority: 1,
            log: Arc::clone(&log),
            fail: true,
            panic: false,
        });
        let pipeline = HandlerPipeline::new(vec![
            Recorder::ok("p5", 5, &log),
            failing,
            Recorder::ok("p3", 3, &log),
        ]);

        pipeline.circuit_opened(&circuit()).await;
        assert_eq!(*log.lock(), vec!["p1", "p3", "p5"]);
    }

    #[test_deadline::tokio_deadline]
    async fn a_panicking_handler_is_isolated() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let panicking: Arc<dyn CircuitHandler> = Arc::new(Recorder {
            label: "boom",
            priority: 0,
            log: Arc::clone(&log),
            fail: false,
            panic: true,
        });
        let pipeline =
            HandlerPipeline::new(vec![panicking, Recorder::ok("after", 1, &log)]);

        pipeline.circuit_opened(&circuit()).await;
        assert_eq!(*log.lock(), vec!["boom", "after"]);
    }
}
