use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result type for job handlers
pub type JobResult = Result<(), String>;

/// Trait for job handlers
pub trait JobHandler: Send + Sync {
    /// Perform the job with the given arguments
    fn perform(&self, args: &Value) -> JobResult;
}

impl<F> JobHandler for F
where
    F: Fn(&Value) -> JobResult + Send + Sync,
{
    fn perform(&self, args: &Value) -> JobResult {
        self(args)
    }
}

/// Registry of job handlers by class name
pub struct JobHandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        JobHandlerRegistry {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler for a job class
    pub fn register<H: JobHandler + 'static>(&self, class: impl Into<String>, handler: H) {
        let mut handlers = self.handlers.write();
        handlers.insert(class.into(), Arc::new(handler));
    }

    /// Get the handler for a job class
    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read();
        handlers.get(class).cloned()
    }

    pub fn has_handler(&self, class: &str) -> bool {
        let handlers = self.handlers.read();
        handlers.contains_key(class)
    }

    /// All registered class names, sorted
    pub fn classes(&self) -> Vec<String> {
        let handlers = self.handlers.read();
        let mut classes: Vec<String> = handlers.keys().cloned().collect();
        classes.sort();
        classes
    }
}

impl Default for JobHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs its arguments
pub struct EchoHandler;

impl JobHandler for EchoHandler {
    fn perform(&self, args: &Value) -> JobResult {
        tracing::info!("echo: {}", args);
        Ok(())
    }
}

/// Sleeps for `{"ms": n}` milliseconds, or a fixed default
pub struct SleepHandler {
    default_ms: u64,
}

impl SleepHandler {
    pub fn new(default_ms: u64) -> Self {
        SleepHandler { default_ms }
    }
}

impl JobHandler for SleepHandler {
    fn perform(&self, args: &Value) -> JobResult {
        let ms = args
            .get("ms")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_ms);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(())
    }
}

/// Always fails with `{"message": "..."}` or a generic message
pub struct FailHandler;

impl JobHandler for FailHandler {
    fn perform(&self, args: &Value) -> JobResult {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("job failed on purpose");
        Err(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry() {
        let registry = JobHandlerRegistry::new();
        registry.register("echo", EchoHandler);
        registry.register("double", |args: &Value| {
            if args.as_u64().is_some() {
                Ok(())
            } else {
                Err("expected a number".to_string())
            }
        });

        assert!(registry.has_handler("echo"));
        assert!(!registry.has_handler("unknown"));
        assert_eq!(registry.classes(), vec!["double".to_string(), "echo".to_string()]);

        let handler = registry.get("double").unwrap();
        assert!(handler.perform(&json!(2)).is_ok());
        assert!(handler.perform(&json!("x")).is_err());
    }

    #[test]
    fn test_fail_handler_message() {
        assert_eq!(
            FailHandler.perform(&json!({ "message": "nope" })),
            Err("nope".to_string())
        );
        assert!(FailHandler.perform(&Value::Null).is_err());
    }

    #[test]
    fn test_sleep_handler() {
        let start = std::time::Instant::now();
        SleepHandler::new(0).perform(&json!({ "ms": 20 })).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
