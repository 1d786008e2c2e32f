use super::{Engine, EngineExit, EngineRun, Isolation};
use crate::boundary::{EngineExitSignal, run_as_engine};
use crate::error::JmrunError;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Entry point of an engine embedded in the host process.
///
/// It ends a run either by returning, when the test continues on threads of
/// its own, or by calling [`crate::boundary::request_exit`]. Threads of its
/// own should be started with [`crate::boundary::spawn_engine_thread`] so a
/// late exit request cannot end the host.
pub type EntryPoint = Arc<dyn Fn(Vec<String>) + Send + Sync + 'static>;

/// Calls an embedded engine on a blocking thread.
///
/// Runs must be supervised behind an [`crate::boundary::ExitBoundary`],
/// otherwise an exit request terminates the host.
#[derive(Clone)]
pub struct InProcessEngine {
    name: String,
    entry: EntryPoint,
}

impl InProcessEngine {
    pub fn new<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            entry: Arc::new(entry),
        }
    }
}

#[async_trait]
impl Engine for InProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn isolation(&self) -> Isolation {
        Isolation::SharedProcess
    }

    async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineRun>, JmrunError> {
        let entry = self.entry.clone();
        let args = args.to_vec();
        let name = self.name.clone();

        let task = tokio::task::spawn_blocking(move || {
            match run_as_engine(|| entry(args)) {
                Ok(()) => Ok(EngineExit::Detached),
                Err(payload) => exit_from_payload(&name, payload),
            }
        });

        Ok(Box::new(InProcessRun {
            name: self.name.clone(),
            task,
            exit: None,
        }))
    }
}

fn exit_from_payload(name: &str, payload: Box<dyn Any + Send>) -> Result<EngineExit, String> {
    if let Some(signal) = EngineExitSignal::from_payload(payload.as_ref()) {
        debug!(engine = name, code = signal.code(), "Engine requested exit");
        return Ok(EngineExit::Code(signal.code()));
    }

    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    Err(format!("{name} panicked: {message}"))
}

struct InProcessRun {
    name: String,
    task: JoinHandle<Result<EngineExit, String>>,
    exit: Option<Result<EngineExit, String>>,
}

#[async_trait]
impl EngineRun for InProcessRun {
    async fn wait(&mut self) -> Result<EngineExit, JmrunError> {
        let exit = match self.exit.take() {
            Some(exit) => exit,
            // Polling a finished JoinHandle again panics, so the result is cached
            None => (&mut self.task)
                .await
                .map_err(|e| format!("{} task failed: {e}", self.name))
                .and_then(|exit| exit),
        };
        self.exit = Some(exit.clone());
        exit.map_err(JmrunError::engine_error)
    }

    async fn stop(&mut self) -> Result<(), JmrunError> {
        if self.exit.is_none() && !self.task.is_finished() {
            // A blocking thread cannot be aborted. Its exit requests unwind
            // the engine thread only.
            warn!(engine = %self.name, "Embedded engine cannot be stopped, leaving it running");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{ExitBoundary, request_exit};
    use crate::test_support::boundary_lock;

    #[tokio::test]
    async fn test_returning_entry_point_is_detached() {
        let engine = InProcessEngine::new("embedded", |_args| {});
        let mut run = engine.launch(&["-n".to_string()]).await.unwrap();
        assert_eq!(run.wait().await.unwrap(), EngineExit::Detached);
        assert_eq!(run.wait().await.unwrap(), EngineExit::Detached);
    }

    #[tokio::test]
    async fn test_exit_request_becomes_code() {
        let _serial = boundary_lock();
        let boundary = ExitBoundary::install().unwrap();

        let engine = InProcessEngine::new("embedded", |args: Vec<String>| {
            request_exit(args.len() as i32);
        });
        let mut run = engine
            .launch(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        let exit = run.wait().await;

        boundary.restore();
        assert_eq!(exit.unwrap(), EngineExit::Code(3));
    }

    #[tokio::test]
    async fn test_other_panic_is_engine_error() {
        let _serial = boundary_lock();
        let boundary = ExitBoundary::install().unwrap();

        let engine = InProcessEngine::new("embedded", |_args| panic!("plan is corrupt"));
        let mut run = engine.launch(&[]).await.unwrap();
        let exit = run.wait().await;

        boundary.restore();
        match exit {
            Err(JmrunError::EngineError(message)) => assert!(message.contains("plan is corrupt")),
            other => panic!("unexpected exit: {other:?}"),
        }
    }
}
