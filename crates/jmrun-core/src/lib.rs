//! jmrun Core - Platform-independent run orchestration
//!
//! This crate provides configuration, argument building, completion
//! detection, run supervision and result post-processing for driving a
//! load-testing engine. Platform-specific process management lives in the
//! platform crates.

mod args;
mod batch;
mod boundary;
mod collector;
mod config;
mod discovery;
mod engine;
mod error;
mod plugins;
mod process;
mod report;
mod scanner;
mod stdio;
mod supervisor;
mod watcher;

pub use args::*;
pub use batch::*;
pub use boundary::*;
pub use collector::*;
pub use config::*;
pub use discovery::*;
pub use engine::*;
pub use error::*;
pub use plugins::*;
pub use process::*;
pub use report::*;
pub use scanner::*;
pub use stdio::*;
pub use supervisor::*;
pub use watcher::*;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static BOUNDARY_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch the exit boundary or the panic hook
    pub fn boundary_lock() -> MutexGuard<'static, ()> {
        BOUNDARY_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
