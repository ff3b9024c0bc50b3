//! Worker lifecycle management.
//!
//! A worker runs either as a child process (the same binary with the hidden
//! `worker` subcommand) or as a dedicated thread. Either way the controller
//! only sees a [`WorkerHandle`]: a command channel plus the execution unit
//! it waits on at teardown.
//!
//! Teardown never kills the worker. It sends `Terminate`, then waits a
//! bounded time for the unit to finish; a worker that does not finish in
//! time is left running and reported as [`ModelError::CleanupTimeout`].

use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::channel::{self, ControllerEnd, WorkerEnd};
use super::ipc_types::{Command, Response};
use super::shutdown;
use super::worker_main::{
    run_worker_thread, WorkerArgs, WorkerError, WorkerExit, WorkerOptions, DEFAULT_POLL_INTERVAL,
};
use crate::engine::{EngineConfig, EngineFactory};
use crate::error::ModelError;
use crate::store::ModelStore;

pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL: Duration = Duration::from_millis(10);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// How the worker is isolated from the controller.
pub enum WorkerMode {
    /// Child process. `program` defaults to the current executable.
    Process {
        program: Option<PathBuf>,
        engine: EngineConfig,
    },
    /// Dedicated thread; the engine is built inside it.
    Thread { engine: EngineFactory },
}

impl fmt::Debug for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMode::Process { program, engine } => f
                .debug_struct("Process")
                .field("program", program)
                .field("engine", engine)
                .finish(),
            WorkerMode::Thread { .. } => f.write_str("Thread"),
        }
    }
}

impl Default for WorkerMode {
    fn default() -> Self {
        WorkerMode::Process {
            program: None,
            engine: EngineConfig::default(),
        }
    }
}

/// Everything a worker needs besides its engine.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub model: String,
    /// Shared with thread workers; process workers reopen it from
    /// [`ModelStore::config`].
    pub store: Arc<dyn ModelStore>,
    pub history: Option<PathBuf>,
    pub poll_interval: Duration,
    pub reply_timeout: Option<Duration>,
    pub teardown_timeout: Duration,
}

impl LaunchConfig {
    pub fn new(model: &str, store: Arc<dyn ModelStore>) -> Self {
        Self {
            model: model.to_string(),
            store,
            history: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reply_timeout: None,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

enum ExecutionUnit {
    Process(Child),
    Thread(JoinHandle<Result<WorkerExit, WorkerError>>),
}

impl ExecutionUnit {
    fn is_finished(&mut self) -> bool {
        match self {
            ExecutionUnit::Process(child) => !matches!(child.try_wait(), Ok(None)),
            ExecutionUnit::Thread(handle) => handle.is_finished(),
        }
    }

    /// Reap a finished unit and log how it ended.
    fn reap(self, id: u64) {
        match self {
            ExecutionUnit::Process(mut child) => match child.wait() {
                Ok(status) if status.success() => {
                    log::info!("[PROCESS_MGR] Worker #{id} exited cleanly")
                }
                Ok(status) => log::warn!("[PROCESS_MGR] Worker #{id} exited with {status}"),
                Err(e) => log::warn!("[PROCESS_MGR] Failed to reap worker #{id}: {e}"),
            },
            ExecutionUnit::Thread(handle) => match handle.join() {
                Ok(Ok(exit)) => log::info!("[PROCESS_MGR] Worker #{id} finished ({exit:?})"),
                Ok(Err(e)) => log::warn!("[PROCESS_MGR] Worker #{id} failed: {e}"),
                Err(_) => log::error!("[PROCESS_MGR] Worker #{id} panicked"),
            },
        }
    }
}

/// Controller-side handle to one running worker.
pub struct WorkerHandle {
    id: u64,
    unit: Option<ExecutionUnit>,
    channel: ControllerEnd,
    interrupt: Arc<AtomicBool>,
    teardown_timeout: Duration,
}

/// Start a worker for `launch.model`.
pub fn spawn_worker(mode: WorkerMode, launch: &LaunchConfig) -> Result<WorkerHandle, ModelError> {
    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    let (controller, end) = channel::pair(launch.reply_timeout);
    let interrupt = Arc::new(AtomicBool::new(false));

    let unit = match mode {
        WorkerMode::Process { program, engine } => {
            ExecutionUnit::Process(spawn_process(id, program, &engine, launch, end)?)
        }
        WorkerMode::Thread { engine } => {
            let options = WorkerOptions {
                model: launch.model.clone(),
                history: launch.history.clone(),
                poll_interval: launch.poll_interval,
            };
            let store = launch.store.clone();
            let stop = interrupt.clone();
            log::info!("[PROCESS_MGR] Starting worker #{id} thread for '{}'", launch.model);
            let handle = thread::Builder::new()
                .name(format!("madx-worker-{id}"))
                .spawn(move || run_worker_thread(end, engine, store, options, stop))
                .map_err(ModelError::Spawn)?;
            ExecutionUnit::Thread(handle)
        }
    };

    shutdown::register(id, controller.command_sender());
    Ok(WorkerHandle {
        id,
        unit: Some(unit),
        channel: controller,
        interrupt,
        teardown_timeout: launch.teardown_timeout,
    })
}

fn spawn_process(
    id: u64,
    program: Option<PathBuf>,
    engine: &EngineConfig,
    launch: &LaunchConfig,
    end: WorkerEnd,
) -> Result<Child, ModelError> {
    let store = launch.store.config().ok_or_else(|| {
        ModelError::Spawn(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "model store cannot be reopened by a worker process",
        ))
    })?;
    let program = match program {
        Some(p) => p,
        None => std::env::current_exe().map_err(ModelError::Spawn)?,
    };
    let args = WorkerArgs::new(
        &launch.model,
        &store,
        engine,
        launch.history.as_deref(),
        launch.poll_interval,
    );

    log::info!(
        "[PROCESS_MGR] Spawning worker #{id}: {} worker --model {}",
        program.display(),
        launch.model
    );
    let mut child = std::process::Command::new(&program)
        .arg("worker")
        .args(args.to_args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // worker logs go to our stderr
        .spawn()
        .map_err(ModelError::Spawn)?;

    let bridged = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => {
            let WorkerEnd {
                commands,
                responses,
            } = end;
            channel::spawn_line_writer(&format!("worker-{id}-stdin"), commands, stdin).and_then(|_| {
                channel::spawn_line_reader(&format!("worker-{id}-stdout"), stdout, responses)
            })
        }
        _ => Err(std::io::Error::other("worker pipes unavailable")),
    };
    if let Err(e) = bridged {
        log::error!("[PROCESS_MGR] Failed to attach to worker #{id}: {e}");
        let _ = child.kill();
        let _ = child.wait();
        return Err(ModelError::Spawn(e));
    }
    log::info!("[PROCESS_MGR] Worker #{id} running (pid={})", child.id());
    Ok(child)
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one command and wait for its reply.
    pub fn send(&mut self, command: &Command) -> Result<Response, ModelError> {
        self.ensure_live()?;
        self.channel.send(command)
    }

    #[cfg(test)]
    fn send_frame(&mut self, frame: super::ipc_types::Frame) -> Result<Response, ModelError> {
        self.ensure_live()?;
        self.channel.send_frame(frame)
    }

    fn ensure_live(&self) -> Result<(), ModelError> {
        if self.unit.is_none() {
            return Err(ModelError::WorkerUnavailable(
                "worker has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Ask the worker to stop at its next idle poll, as SIGTERM would.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        #[cfg(not(windows))]
        {
            if let Some(ExecutionUnit::Process(child)) = &self.unit {
                if let Ok(pid) = libc::pid_t::try_from(child.id()) {
                    // SAFETY: plain kill(2) on our own child's pid.
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                }
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.unit.as_mut().is_some_and(|unit| !unit.is_finished())
    }

    pub fn is_broken(&self) -> bool {
        self.channel.is_broken()
    }

    /// Terminate the worker and wait up to the teardown bound. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), ModelError> {
        let Some(mut unit) = self.unit.take() else {
            return Ok(());
        };
        shutdown::deregister(self.id);

        self.channel.hang_up();

        let deadline = Instant::now() + self.teardown_timeout;
        while !unit.is_finished() {
            if Instant::now() >= deadline {
                log::error!(
                    "[PROCESS_MGR] Worker #{} did not exit within {:?}, leaving it running",
                    self.id,
                    self.teardown_timeout
                );
                return Err(ModelError::CleanupTimeout(self.teardown_timeout));
            }
            thread::sleep(EXIT_POLL);
        }
        unit.reap(self.id);
        Ok(())
    }

    #[cfg(test)]
    fn from_thread(
        handle: JoinHandle<Result<WorkerExit, WorkerError>>,
        channel: ControllerEnd,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            unit: Some(ExecutionUnit::Thread(handle)),
            channel,
            interrupt: Arc::new(AtomicBool::new(false)),
            teardown_timeout,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("[PROCESS_MGR] Worker #{} teardown failed: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dry_run::{DryRunEngine, EngineJournal};
    use crate::engine::Engine;
    use crate::store::LocalStore;

    fn fixture() -> (tempfile::TempDir, LaunchConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lebt.json"),
            crate::model::descriptor::tests::SAMPLE,
        )
        .unwrap();
        let mut launch = LaunchConfig::new("lebt", Arc::new(LocalStore::new(dir.path())));
        launch.poll_interval = Duration::from_millis(20);
        launch.teardown_timeout = Duration::from_secs(2);
        (dir, launch)
    }

    fn dry_run(journal: &EngineJournal) -> WorkerMode {
        let journal = journal.clone();
        WorkerMode::Thread {
            engine: Box::new(move || Ok(Box::new(DryRunEngine::with_journal(journal)) as Box<dyn Engine>)),
        }
    }

    #[test]
    fn test_thread_worker_lifecycle() {
        let (_dir, launch) = fixture();
        let journal = EngineJournal::new();
        let mut worker = spawn_worker(dry_run(&journal), &launch).unwrap();
        assert!(worker.is_running());

        let reply = worker
            .send(&Command::RawStatement {
                text: "x = 1;".into(),
            })
            .unwrap();
        assert_eq!(reply, Response::Ack);

        let started = Instant::now();
        worker.shutdown().unwrap();
        assert!(started.elapsed() < launch.teardown_timeout);
        assert!(!worker.is_running());
        assert_eq!(journal.statements(), vec!["x = 1;"]);

        // idempotent, and closed for business
        worker.shutdown().unwrap();
        assert!(matches!(
            worker.send(&Command::ListSequences),
            Err(ModelError::WorkerUnavailable(_))
        ));
    }

    #[test]
    fn test_malformed_frame_takes_worker_down() {
        let (_dir, launch) = fixture();
        let mut worker = spawn_worker(dry_run(&EngineJournal::new()), &launch).unwrap();
        let err = worker.send_frame("{\"type\":\"Bogus\"}".to_string()).unwrap_err();
        assert!(matches!(err, ModelError::WorkerUnavailable(_)));
        assert!(worker.is_broken());
        let err = worker.send(&Command::ListSequences).unwrap_err();
        assert!(matches!(err, ModelError::WorkerUnavailable(_)));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_failed_engine_setup_surfaces_on_first_command() {
        let (_dir, launch) = fixture();
        let mode = WorkerMode::Thread {
            engine: Box::new(|| Err(crate::engine::EngineError::Exited)),
        };
        let mut worker = spawn_worker(mode, &launch).unwrap();
        assert!(matches!(
            worker.send(&Command::ListSequences),
            Err(ModelError::WorkerUnavailable(_))
        ));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_interrupt_stops_idle_worker() {
        let (_dir, launch) = fixture();
        let mut worker = spawn_worker(dry_run(&EngineJournal::new()), &launch).unwrap();
        worker.interrupt();
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(EXIT_POLL);
        }
        assert!(!worker.is_running());
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_slow_worker_exits_after_reply_timeout() {
        let (_dir, mut launch) = fixture();
        launch.reply_timeout = Some(Duration::from_millis(50));
        let mode = WorkerMode::Thread {
            engine: Box::new(|| {
                Ok(Box::new(DryRunEngine::new().with_delay(Duration::from_millis(200))) as Box<dyn Engine>)
            }),
        };
        let mut worker = spawn_worker(mode, &launch).unwrap();
        let err = worker
            .send(&Command::RawStatement {
                text: "x = 1;".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::WorkerUnavailable(ref reason) if reason.contains("no reply")));
        assert!(worker.is_broken());

        let started = Instant::now();
        worker.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!worker.is_running());
    }

    #[test]
    fn test_stuck_worker_is_left_running() {
        let (controller, end) = channel::pair(None);
        let stuck = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            drop(end);
            Ok(WorkerExit::Disconnected)
        });
        let mut worker = WorkerHandle::from_thread(stuck, controller, Duration::from_millis(50));
        let started = Instant::now();
        let err = worker.shutdown().unwrap_err();
        assert!(matches!(err, ModelError::CleanupTimeout(_)));
        assert!(started.elapsed() < Duration::from_millis(400));
        // second teardown has nothing left to do
        worker.shutdown().unwrap();
    }
}
