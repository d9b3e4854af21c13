use tracing::info;

/// Sink for per-service release history
pub trait EventWriter: Send + Sync {
    fn log_event(&self, namespace: &str, service: &str, message: &str);
}

/// Writes events to the `audit` tracing target
#[derive(Debug, Default, Clone)]
pub struct TracingEventWriter;

impl EventWriter for TracingEventWriter {
    fn log_event(&self, namespace: &str, service: &str, message: &str) {
        info!(target: "audit", namespace, service, "{}", message);
    }
}
