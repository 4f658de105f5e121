use std::sync::Arc;

use thiserror::Error;

/// Failure carried by a task and every value bridged out of it.
///
/// Tasks may be observed by several parties at once (parent tasks, pending
/// values, the trace barrier), so the underlying error is shared behind an
/// `Arc` and cloned to each of them unchanged.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct TaskError(pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();

        // Keep identity when a task failure travels through another bridge.
        match err.downcast::<TaskError>() {
            Ok(task) => task,
            Err(err) => Self(Arc::new(err)),
        }
    }

    pub fn msg(msg: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Builds the error reported for a task whose body panicked.
    pub(crate) fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
            format!("Task panicked: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            format!("Task panicked: {s}")
        } else {
            String::from("Task panicked with unknown payload")
        };

        Self::msg(msg)
    }

    /// Access to the original error, e.g. for `downcast_ref`.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::new(e)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No tokio runtime is available to run tasks on")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("Task '{0}' was dropped before completion")]
    Dropped(String),

    #[error("Task '{0}' did not record an outcome")]
    Unfinished(String),

    #[error("Spawned future failed to join:\n{0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_keeps_identity() {
        let original = TaskError::msg("boom");
        let wrapped: anyhow::Error = original.clone().into();
        let back = TaskError::new(wrapped);

        assert!(Arc::ptr_eq(&original.0, &back.0));
        assert_eq!(back.to_string(), "boom");
    }

    #[test]
    fn test_task_error_is_transparent() {
        let err = TaskError::new(anyhow::anyhow!("root cause").context("while fetching"));
        let dyn_err: &dyn std::error::Error = &err;

        assert_eq!(err.to_string(), "while fetching");
        assert_eq!(dyn_err.source().map(|s| s.to_string()).as_deref(), Some("root cause"));
    }

    #[test]
    fn test_panic_payloads() {
        let err = TaskError::from_panic(Box::new("index out of range"));
        assert_eq!(err.to_string(), "Task panicked: index out of range");

        let err = TaskError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "Task panicked: owned");

        let err = TaskError::from_panic(Box::new(42_u8));
        assert_eq!(err.to_string(), "Task panicked with unknown payload");
    }

    #[test]
    fn test_downcast() {
        let err = TaskError::new(BridgeError::Dropped("x".into()));
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::Dropped(_))
        ));
    }
}
