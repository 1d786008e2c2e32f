//! Completion Watcher: infers the end of a run from the engine log.

use crate::error::JmrunError;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Logged by the engine once the test plan has run to completion
pub const END_OF_TEST_SENTINEL: &str = "Test has ended";

/// Logged by the engine when the test plan could not be loaded
pub const SETUP_FAILURE_SENTINEL: &str = "Could not open";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Verdict of the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The end-of-test sentinel was seen
    Finished,
    /// The setup failure sentinel was seen
    SetupFailed,
    /// Watching was cancelled before any sentinel appeared
    Interrupted,
}

/// Position of the watcher in the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTailState {
    /// Bytes of the log consumed so far
    pub offset: u64,
    /// Set once a sentinel has been seen
    pub ended: bool,
    /// Number of times the watcher went to sleep waiting for new lines
    pub polls: u64,
    pending: Vec<u8>,
}

/// Polls an append-only log for the completion sentinels
#[derive(Debug)]
pub struct CompletionWatcher {
    log_file: PathBuf,
    poll_interval: Duration,
    state: LogTailState,
}

impl CompletionWatcher {
    /// Watch `log_file` from its first byte
    pub fn new(log_file: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            log_file: log_file.into(),
            poll_interval,
            state: LogTailState::default(),
        }
    }

    /// Watch only what gets appended to `log_file` from now on.
    ///
    /// A log that does not exist yet is watched from its first byte.
    pub async fn starting_now(
        log_file: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Result<Self, JmrunError> {
        let mut watcher = Self::new(log_file, poll_interval);
        match tokio::fs::metadata(&watcher.log_file).await {
            Ok(metadata) => watcher.state.offset = metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JmrunError::io("inspecting log file", &watcher.log_file)(e)),
        }
        Ok(watcher)
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn state(&self) -> &LogTailState {
        &self.state
    }

    /// Poll until a sentinel shows up or `token` is cancelled
    pub async fn watch(&mut self, token: &CancellationToken) -> Result<Completion, JmrunError> {
        debug!(log = %self.log_file.display(), offset = self.state.offset, "Watching engine log");

        loop {
            if let Some(completion) = self.check_for_end().await? {
                info!(log = %self.log_file.display(), ?completion, "Engine log reports end of run");
                return Ok(completion);
            }

            self.state.polls += 1;
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!(log = %self.log_file.display(), "Stopped watching engine log before the run ended");
                    return Ok(Completion::Interrupted);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Read everything appended since the last call and look for a sentinel.
    ///
    /// Only complete lines are matched; a trailing partial line is kept until
    /// its newline arrives. Nothing after the first sentinel line is examined.
    pub async fn check_for_end(&mut self) -> Result<Option<Completion>, JmrunError> {
        if self.state.ended {
            return Ok(None);
        }

        let mut file = match tokio::fs::File::open(&self.log_file).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(JmrunError::io("opening log file", &self.log_file)(e)),
        };

        let len = file
            .metadata()
            .await
            .map_err(JmrunError::io("inspecting log file", &self.log_file))?
            .len();
        if len < self.state.offset {
            debug!(log = %self.log_file.display(), "Log file was truncated, reading from the start");
            self.state.offset = 0;
            self.state.pending.clear();
        }

        file.seek(SeekFrom::Start(self.state.offset))
            .await
            .map_err(JmrunError::io("reading log file", &self.log_file))?;
        let mut appended = Vec::new();
        let read = file
            .read_to_end(&mut appended)
            .await
            .map_err(JmrunError::io("reading log file", &self.log_file))?;
        self.state.offset += read as u64;
        self.state.pending.extend_from_slice(&appended);

        while let Some(newline) = self.state.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.state.pending.drain(..=newline).collect();
            if let Some(completion) = match_sentinel(&String::from_utf8_lossy(&line)) {
                self.state.ended = true;
                self.state.pending.clear();
                return Ok(Some(completion));
            }
        }

        Ok(None)
    }
}

/// Case-sensitive substring match, end-of-test checked first
pub fn match_sentinel(line: &str) -> Option<Completion> {
    if line.contains(END_OF_TEST_SENTINEL) {
        Some(Completion::Finished)
    } else if line.contains(SETUP_FAILURE_SENTINEL) {
        Some(Completion::SetupFailed)
    } else {
        None
    }
}
