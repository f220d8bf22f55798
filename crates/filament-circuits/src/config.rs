use std::env;
use std::time::Duration;

/// Tunables for circuit retention and per-circuit dispatch.
#[derive(Debug, Clone)]
pub struct CircuitOptions {
    /// How long a disconnected circuit is held for reconnection before it
    /// is disposed.
    pub disconnected_retention: Duration,
    /// Upper bound on disconnected circuits held at once; the oldest
    /// disconnect is evicted first when the bound is hit.
    pub max_retained_disconnected: usize,
    /// Queue depth of each circuit's dispatcher.
    pub dispatcher_queue_depth: usize,
}

impl CircuitOptions {
    pub fn from_env() -> Self {
        let disconnected_retention = env::var("FILAMENT_RETENTION_SECS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETENTION);
        let max_retained_disconnected = env::var("FILAMENT_MAX_RETAINED")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETAINED);
        let dispatcher_queue_depth = env::var("FILAMENT_DISPATCH_DEPTH")
            .ok()
            .and_then(|val| val.parse().ok())
            .filter(|depth| *depth > 0)
            .unwrap_or(DEFAULT_DISPATCH_DEPTH);

        Self {
            disconnected_retention,
            max_retained_disconnected,
            dispatcher_queue_depth,
        }
    }
}

const DEFAULT_RETENTION: Duration = Duration::from_secs(180);
const DEFAULT_MAX_RETAINED: usize = 100;
const DEFAULT_DISPATCH_DEPTH: usize = 64;

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            disconnected_retention: DEFAULT_RETENTION,
            max_retained_disconnected: DEFAULT_MAX_RETAINED,
            dispatcher_queue_depth: DEFAULT_DISPATCH_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn defaults_match_documented_policy() {
        let options = CircuitOptions::default();
        assert_eq!(options.disconnected_retention, Duration::from_secs(180));
        assert_eq!(options.max_retained_disconnected, 100);
        assert_eq!(options.dispatcher_queue_depth, 64);
    }
}
