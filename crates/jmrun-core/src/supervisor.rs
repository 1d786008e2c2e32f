//! Run Supervisor: owns one engine run from launch to outcome.

use crate::args::RunRequest;
use crate::boundary::ExitBoundary;
use crate::config::JmeterConfig;
use crate::engine::{Engine, EngineExit, EngineRun, Isolation};
use crate::error::JmrunError;
use crate::watcher::{Completion, CompletionWatcher};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of exactly one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The engine finished; the result file is ready for collection
    Completed(PathBuf),
    /// The engine reported a failure with this code
    CompletedWithNonZeroCode(i32),
    /// The run was cancelled before the engine finished
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Armed,
    Running,
    Succeeded,
    FailedNonZero(i32),
    Interrupted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Armed => write!(f, "armed"),
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::FailedNonZero(code) => write!(f, "failed ({code})"),
            RunState::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl From<&RunOutcome> for RunState {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(_) => RunState::Succeeded,
            RunOutcome::CompletedWithNonZeroCode(code) => RunState::FailedNonZero(*code),
            RunOutcome::Interrupted => RunState::Interrupted,
        }
    }
}

/// Whichever signal arrived first
enum First {
    Cancelled,
    Engine(EngineExit),
    Log(Completion),
}

/// Launches the engine and watches its log until the run has an outcome
pub struct RunSupervisor {
    engine: Arc<dyn Engine>,
    log_file: PathBuf,
    poll_interval: Duration,
}

impl RunSupervisor {
    pub fn new(engine: Arc<dyn Engine>, log_file: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            engine,
            log_file: log_file.into(),
            poll_interval,
        }
    }

    pub fn from_config(engine: Arc<dyn Engine>, config: &JmeterConfig) -> Self {
        Self::new(engine, config.log_file(), config.poll_interval())
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Run `request` to one [`RunOutcome`].
    ///
    /// Engines sharing the host process run behind an [`ExitBoundary`], which
    /// is restored before this returns on every path.
    pub async fn supervise(
        &self,
        request: &RunRequest,
        token: &CancellationToken,
    ) -> Result<RunOutcome, JmrunError> {
        let test = request.test_file().display().to_string();
        let mut state = RunState::Idle;

        let boundary = match self.engine.isolation() {
            Isolation::SharedProcess => Some(ExitBoundary::install()?),
            Isolation::Subprocess => None,
        };
        transition(&test, &mut state, RunState::Armed);

        let result = self.drive(request, token, &test, &mut state).await;

        if let Some(boundary) = boundary {
            boundary.restore();
        }

        match &result {
            Ok(outcome) => transition(&test, &mut state, RunState::from(outcome)),
            Err(e) => warn!(test = %test, error = %e, "Run aborted"),
        }
        transition(&test, &mut state, RunState::Idle);
        result
    }

    async fn drive(
        &self,
        request: &RunRequest,
        token: &CancellationToken,
        test: &str,
        state: &mut RunState,
    ) -> Result<RunOutcome, JmrunError> {
        info!(test = %test, engine = self.engine.name(), "Executing test");

        // Anything already in the log belongs to an earlier run
        let watcher = CompletionWatcher::starting_now(&self.log_file, self.poll_interval).await?;
        let watch_stop = token.child_token();
        let _stop_watching = watch_stop.clone().drop_guard();
        let mut watch_task = spawn_watcher(watcher, watch_stop);

        let mut run = self.engine.launch(&request.to_args()).await?;
        transition(test, state, RunState::Running);

        match self.decide(request, run.as_mut(), &mut watch_task, token, test).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(abandon(run.as_mut(), test, e).await),
        }
    }

    /// Race cancellation, engine exit and the log until one settles the run
    async fn decide(
        &self,
        request: &RunRequest,
        run: &mut dyn EngineRun,
        watch_task: &mut JoinHandle<Result<Completion, JmrunError>>,
        token: &CancellationToken,
        test: &str,
    ) -> Result<RunOutcome, JmrunError> {
        let first = tokio::select! {
            biased;
            _ = token.cancelled() => First::Cancelled,
            exit = run.wait() => First::Engine(exit?),
            completion = &mut *watch_task => First::Log(joined(completion)?),
        };

        let outcome = match first {
            First::Cancelled | First::Log(Completion::Interrupted) => interrupt(run, test).await,
            First::Engine(EngineExit::Code(0)) => completed(request),
            First::Engine(EngineExit::Code(code)) => RunOutcome::CompletedWithNonZeroCode(code),
            First::Engine(EngineExit::Detached) => {
                debug!(test = %test, "Engine returned, waiting for the log to report the end of the run");
                let completion = tokio::select! {
                    biased;
                    _ = token.cancelled() => Completion::Interrupted,
                    completion = &mut *watch_task => joined(completion)?,
                };
                match completion {
                    Completion::Finished => completed(request),
                    Completion::SetupFailed => RunOutcome::CompletedWithNonZeroCode(1),
                    Completion::Interrupted => interrupt(run, test).await,
                }
            }
            First::Log(Completion::Finished) => {
                let exit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    exit = self.exit_after_log(run) => Some(exit?),
                };
                match exit {
                    None => interrupt(run, test).await,
                    Some(Some(EngineExit::Code(code))) if code != 0 => {
                        RunOutcome::CompletedWithNonZeroCode(code)
                    }
                    Some(Some(_)) => completed(request),
                    Some(None) => {
                        warn!(test = %test, "Engine still running after the end of the test, stopping it");
                        if let Err(e) = run.stop().await {
                            warn!(test = %test, error = %e, "Failed to stop engine");
                        }
                        completed(request)
                    }
                }
            }
            First::Log(Completion::SetupFailed) => {
                RunOutcome::CompletedWithNonZeroCode(self.setup_failure_code(run, test).await?)
            }
        };

        Ok(outcome)
    }

    /// Exit of an engine that already logged a sentinel, if it arrives
    /// within one poll interval
    async fn exit_after_log(&self, run: &mut dyn EngineRun) -> Result<Option<EngineExit>, JmrunError> {
        match tokio::time::timeout(self.poll_interval, run.wait()).await {
            Ok(exit) => exit.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Prefer the engine's own nonzero code if it exits within one poll
    /// interval of the setup failure, otherwise stop it and report 1.
    async fn setup_failure_code(&self, run: &mut dyn EngineRun, test: &str) -> Result<i32, JmrunError> {
        warn!(test = %test, "Engine could not open the test plan");
        match self.exit_after_log(run).await? {
            Some(EngineExit::Code(code)) if code != 0 => Ok(code),
            Some(_) => Ok(1),
            None => {
                if let Err(e) = run.stop().await {
                    warn!(test = %test, error = %e, "Failed to stop engine after setup failure");
                }
                Ok(1)
            }
        }
    }
}

fn spawn_watcher(
    mut watcher: CompletionWatcher,
    stop: CancellationToken,
) -> JoinHandle<Result<Completion, JmrunError>> {
    tokio::spawn(async move { watcher.watch(&stop).await })
}

fn joined(
    result: Result<Result<Completion, JmrunError>, JoinError>,
) -> Result<Completion, JmrunError> {
    result.map_err(|e| JmrunError::engine_error(format!("Completion watcher failed: {e}")))?
}

fn completed(request: &RunRequest) -> RunOutcome {
    RunOutcome::Completed(request.result_file().to_path_buf())
}

/// Stop the engine before giving up on the run
async fn abandon(run: &mut dyn EngineRun, test: &str, error: JmrunError) -> JmrunError {
    warn!(test = %test, error = %error, "Run failed, stopping engine");
    if let Err(e) = run.stop().await {
        warn!(test = %test, error = %e, "Failed to stop engine");
    }
    error
}

async fn interrupt(run: &mut dyn EngineRun, test: &str) -> RunOutcome {
    warn!(test = %test, "Run interrupted, stopping engine");
    if let Err(e) = run.stop().await {
        warn!(test = %test, error = %e, "Failed to stop engine");
    }
    RunOutcome::Interrupted
}

fn transition(test: &str, state: &mut RunState, next: RunState) {
    debug!(test = %test, from = %state, to = %next, "Run state changed");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgumentBuilder;
    use crate::boundary::{request_exit, spawn_engine_thread};
    use crate::engine::InProcessEngine;
    use crate::test_support::boundary_lock;
    use async_trait::async_trait;
    use std::io::Write;
    use std::panic;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc};
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(20);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    /// Async engine that writes log lines, then exits with `exit` or hangs
    struct ScriptedEngine {
        log: PathBuf,
        lines: Vec<&'static str>,
        exit: Option<EngineExit>,
        stopped: Arc<AtomicBool>,
    }

    impl ScriptedEngine {
        fn new(log: &Path, lines: &[&'static str], exit: Option<EngineExit>) -> Self {
            Self {
                log: log.to_path_buf(),
                lines: lines.to_vec(),
                exit,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct ScriptedRun {
        task: Option<JoinHandle<EngineExit>>,
        exit: Option<EngineExit>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn isolation(&self) -> Isolation {
            Isolation::Subprocess
        }

        async fn launch(&self, _args: &[String]) -> Result<Box<dyn EngineRun>, JmrunError> {
            let log = self.log.clone();
            let lines = self.lines.clone();
            let exit = self.exit;
            let task = tokio::spawn(async move {
                for line in lines {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    append(&log, &format!("{line}\n"));
                }
                match exit {
                    Some(exit) => exit,
                    None => std::future::pending().await,
                }
            });
            Ok(Box::new(ScriptedRun {
                task: Some(task),
                exit: None,
                stopped: self.stopped.clone(),
            }))
        }
    }

    #[async_trait]
    impl EngineRun for ScriptedRun {
        async fn wait(&mut self) -> Result<EngineExit, JmrunError> {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            let Some(task) = self.task.as_mut() else {
                return Ok(EngineExit::Code(143));
            };
            let exit = task.await.map_err(|e| JmrunError::engine_error(e.to_string()))?;
            self.exit = Some(exit);
            Ok(exit)
        }

        async fn stop(&mut self) -> Result<(), JmrunError> {
            if let Some(task) = self.task.take() {
                task.abort();
            }
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request(dir: &TempDir) -> RunRequest {
        std::fs::create_dir_all(dir.path().join("report")).unwrap();
        let plan = dir.path().join("login.jmx");
        std::fs::write(&plan, "<jmeterTestPlan/>").unwrap();
        ArgumentBuilder::new(
            dir.path().join("report"),
            dir.path(),
            dir.path().join("jmeter.properties"),
            Vec::new(),
            false,
        )
        .build(&plan)
        .unwrap()
    }

    fn supervisor(engine: impl Engine + 'static, log: &Path) -> RunSupervisor {
        RunSupervisor::new(Arc::new(engine), log, POLL)
    }

    #[tokio::test]
    async fn test_finished_and_zero_exit_completes() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let request = request(&dir);
        let engine = ScriptedEngine::new(
            &log,
            &["INFO starting", "INFO Test has ended"],
            Some(EngineExit::Code(0)),
        );

        let outcome = supervisor(engine, &log)
            .supervise(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed(request.result_file().to_path_buf())
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_sentinel() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let engine = ScriptedEngine::new(&log, &["INFO starting"], Some(EngineExit::Code(3)));

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::CompletedWithNonZeroCode(3));
    }

    #[tokio::test]
    async fn test_setup_failure_uses_engine_code() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let engine = ScriptedEngine::new(
            &log,
            &["ERROR Could not open login.jmx"],
            Some(EngineExit::Code(2)),
        );

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::CompletedWithNonZeroCode(2));
    }

    #[tokio::test]
    async fn test_setup_failure_stops_hanging_engine() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let engine = ScriptedEngine::new(&log, &["noise", "ERROR Could not open login.jmx"], None);
        let stopped = engine.stopped.clone();

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::CompletedWithNonZeroCode(1));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sentinels_from_earlier_runs_are_ignored() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        append(&log, "INFO Test has ended\n");
        let engine = ScriptedEngine::new(&log, &["ERROR Could not open login.jmx"], None);

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::CompletedWithNonZeroCode(1));
    }

    #[tokio::test]
    async fn test_interrupted_before_any_sentinel() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let engine = ScriptedEngine::new(&log, &["INFO starting", "INFO running"], None);
        let stopped = engine.stopped.clone();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(POLL * 3 + Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &token)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_engine_hanging_after_end_is_stopped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let request = request(&dir);
        let engine = ScriptedEngine::new(&log, &["INFO Test has ended"], None);
        let stopped = engine.stopped.clone();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor(engine, &log).supervise(&request, &CancellationToken::new()),
        )
        .await
        .expect("run must not wait for a hanging engine")
        .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed(request.result_file().to_path_buf())
        );
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_nonzero_exit_after_end_fails() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let engine = ScriptedEngine::new(&log, &["INFO Test has ended"], Some(EngineExit::Code(6)));

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::CompletedWithNonZeroCode(6));
    }

    /// Engine whose exit status cannot be read
    struct BrokenEngine {
        stopped: Arc<AtomicBool>,
    }

    struct BrokenRun {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Engine for BrokenEngine {
        fn name(&self) -> &str {
            "broken"
        }

        fn isolation(&self) -> Isolation {
            Isolation::Subprocess
        }

        async fn launch(&self, _args: &[String]) -> Result<Box<dyn EngineRun>, JmrunError> {
            Ok(Box::new(BrokenRun {
                stopped: self.stopped.clone(),
            }))
        }
    }

    #[async_trait]
    impl EngineRun for BrokenRun {
        async fn wait(&mut self) -> Result<EngineExit, JmrunError> {
            Err(JmrunError::engine_error("wait failed"))
        }

        async fn stop(&mut self) -> Result<(), JmrunError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_engine_error_stops_engine() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let stopped = Arc::new(AtomicBool::new(false));
        let engine = BrokenEngine {
            stopped: stopped.clone(),
        };

        let result = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(JmrunError::EngineError(_))));
        assert!(stopped.load(Ordering::SeqCst));
    }

    /// Installs a hook that counts the panics it sees
    fn counting_hook() -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        panic::set_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        calls
    }

    /// Sends on drop, which also happens while a thread unwinds
    struct Finished(mpsc::Sender<()>);

    impl Drop for Finished {
        fn drop(&mut self) {
            let _ = self.0.send(());
        }
    }

    #[tokio::test]
    async fn test_interrupted_in_process_run_restores_hook() {
        let _serial = boundary_lock();
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");

        let original = panic::take_hook();
        let calls = counting_hook();

        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let go_rx = Mutex::new(go_rx);
        let engine = InProcessEngine::new("embedded", move |_args| {
            let _finished = Finished(done_tx.clone());
            let _ = go_rx.lock().unwrap().recv();
            request_exit(0);
        });

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(POLL * 3).await;
            canceller.cancel();
        });

        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &token)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(!ExitBoundary::is_installed());

        let _ = panic::catch_unwind(|| -> i32 { panic!("seen by the restored hook") });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The engine asks to exit after its boundary is gone; only its
        // thread ends
        go_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        panic::set_hook(original);
    }

    #[tokio::test]
    async fn test_in_process_exit_restores_hook() {
        let _serial = boundary_lock();
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let request = request(&dir);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let original = panic::take_hook();
        panic::set_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let engine = InProcessEngine::new("embedded", |_args| request_exit(0));
        let outcome = supervisor(engine, &log)
            .supervise(&request, &CancellationToken::new())
            .await;

        assert!(!ExitBoundary::is_installed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let _ = panic::catch_unwind(|| -> i32 { panic!("seen by the restored hook") });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        panic::set_hook(original);

        assert_eq!(
            outcome.unwrap(),
            RunOutcome::Completed(request.result_file().to_path_buf())
        );
    }

    #[tokio::test]
    async fn test_in_process_nonzero_exit() {
        let _serial = boundary_lock();
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");

        let original = panic::take_hook();
        let calls = counting_hook();

        let engine = InProcessEngine::new("embedded", |_args| request_exit(7));
        let outcome = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await;

        assert!(!ExitBoundary::is_installed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let _ = panic::catch_unwind(|| -> i32 { panic!("seen by the restored hook") });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        panic::set_hook(original);

        assert_eq!(outcome.unwrap(), RunOutcome::CompletedWithNonZeroCode(7));
    }

    #[tokio::test]
    async fn test_detached_engine_completes_from_log() {
        let _serial = boundary_lock();
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let request = request(&dir);

        let engine_log = log.clone();
        let engine = InProcessEngine::new("embedded", move |_args| {
            let log = engine_log.clone();
            spawn_engine_thread("engine-worker", move || {
                std::thread::sleep(Duration::from_millis(30));
                append(&log, "INFO Test has ended\n");
            })
            .unwrap();
        });
        let outcome = supervisor(engine, &log)
            .supervise(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed(request.result_file().to_path_buf())
        );
    }

    #[tokio::test]
    async fn test_busy_boundary_rejects_in_process_run() {
        let _serial = boundary_lock();
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("jmeter.log");
        let held = ExitBoundary::install().unwrap();

        let engine = InProcessEngine::new("embedded", |_args| request_exit(0));
        let result = supervisor(engine, &log)
            .supervise(&request(&dir), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(JmrunError::BoundaryBusy)));
        assert!(ExitBoundary::is_installed());
        held.restore();
    }
}
