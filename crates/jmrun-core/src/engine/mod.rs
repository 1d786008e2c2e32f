//! Engines a run can be launched on.

mod in_process;
mod subprocess;

pub use in_process::{EntryPoint, InProcessEngine};
pub use subprocess::SubprocessEngine;

use crate::error::JmrunError;
use async_trait::async_trait;
use std::fmt;

/// Where an engine run executes relative to the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// A child process per run; its exit status is the exit channel
    Subprocess,
    /// Inside the host process; exit requests are intercepted by the boundary
    SharedProcess,
}

/// How the engine left its entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// The engine terminated with this status code
    Code(i32),
    /// The entry point returned while the test keeps running in the
    /// background; only the log can tell when it is over
    Detached,
}

impl fmt::Display for EngineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineExit::Code(code) => write!(f, "exit code {code}"),
            EngineExit::Detached => write!(f, "detached"),
        }
    }
}

/// Something that can start the load-testing engine
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn isolation(&self) -> Isolation;

    /// Start the engine with the ordered run arguments
    async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineRun>, JmrunError>;
}

/// One launched engine invocation
#[async_trait]
pub trait EngineRun: Send {
    /// Wait for the engine to leave its entry point.
    ///
    /// Cancel safe; once the engine has exited every call returns the same
    /// value.
    async fn wait(&mut self) -> Result<EngineExit, JmrunError>;

    /// Stop the engine if it is still running
    async fn stop(&mut self) -> Result<(), JmrunError>;
}
