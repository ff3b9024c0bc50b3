//! Worker entry points and dispatch loop.
//!
//! The worker owns one engine instance and serves commands strictly one at a
//! time: a command is fully executed and its reply sent before the next
//! frame is read. While idle it polls the channel so it notices a closed
//! channel or a termination request within one poll interval.
//!
//! In a worker process, stdout carries protocol frames only. All log output
//! goes to stderr (inherited by the parent).

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use super::channel::{self, ControllerEnd, WorkerEnd};
use super::ipc_types::{decode_command, encode_response, Command, ProtocolFault, Response};
use super::shutdown;
use crate::engine::history::HistoryEngine;
use crate::engine::{Engine, EngineConfig, EngineError, EngineFactory, ModelFile};
use crate::store::{ModelStore, StoreConfig, StoreError, INIT_SCRIPT};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_PROTOCOL_FAULT: i32 = 70;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolFault),
    #[error("engine setup failed: {0}")]
    Setup(#[source] EngineError),
    #[error("engine failed during {command}: {source}")]
    Engine {
        command: &'static str,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("controller closed the channel before the reply was sent")]
    ReplyDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Dispatching,
    Terminated,
}

/// Why a worker left its loop cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Received `Terminate`.
    Terminated,
    /// The controller dropped its end of the channel.
    Disconnected,
    /// A termination signal was delivered.
    Interrupted,
}

/// Command line of the `worker` subcommand.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct WorkerArgs {
    /// Model served by this worker.
    #[arg(long)]
    pub model: String,
    /// Append every engine statement to this file.
    #[arg(long)]
    pub history: Option<PathBuf>,
    /// Local model store root.
    #[arg(long, conflicts_with = "store_url")]
    pub store_dir: Option<PathBuf>,
    /// Remote model store base URL.
    #[arg(long)]
    pub store_url: Option<String>,
    /// Engine executable.
    #[arg(long, conflicts_with = "dry_run")]
    pub madx: Option<PathBuf>,
    /// Record engine interactions instead of running the engine.
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long, default_value_t = 2000)]
    pub poll_interval_ms: u64,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl WorkerArgs {
    pub fn new(
        model: &str,
        store: &StoreConfig,
        engine: &EngineConfig,
        history: Option<&Path>,
        poll_interval: Duration,
    ) -> Self {
        let (store_dir, store_url) = match store {
            StoreConfig::Local { root } => (Some(root.clone()), None),
            StoreConfig::Remote { url } => (None, Some(url.clone())),
        };
        let (madx, dry_run) = match engine {
            EngineConfig::Madx { executable } => (Some(executable.clone()), false),
            EngineConfig::DryRun => (None, true),
        };
        Self {
            model: model.to_string(),
            history: history.map(Path::to_path_buf),
            store_dir,
            store_url,
            madx,
            dry_run,
            poll_interval_ms: u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX),
            log_level: log::max_level().to_string().to_lowercase(),
        }
    }

    pub fn store(&self) -> StoreConfig {
        match (&self.store_url, &self.store_dir) {
            (Some(url), _) => StoreConfig::Remote { url: url.clone() },
            (None, Some(root)) => StoreConfig::Local { root: root.clone() },
            (None, None) => StoreConfig::default(),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        match (&self.madx, self.dry_run) {
            (_, true) => EngineConfig::DryRun,
            (Some(executable), false) => EngineConfig::Madx {
                executable: executable.clone(),
            },
            (None, false) => EngineConfig::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Arguments following the `worker` subcommand.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--model".into(), self.model.clone().into()];
        if let Some(history) = &self.history {
            args.extend(["--history".into(), history.into()]);
        }
        if let Some(dir) = &self.store_dir {
            args.extend(["--store-dir".into(), dir.into()]);
        }
        if let Some(url) = &self.store_url {
            args.extend(["--store-url".into(), url.into()]);
        }
        if let Some(madx) = &self.madx {
            args.extend(["--madx".into(), madx.into()]);
        }
        if self.dry_run {
            args.push("--dry-run".into());
        }
        args.extend([
            "--poll-interval-ms".into(),
            self.poll_interval_ms.to_string().into(),
            "--log-level".into(),
            self.log_level.clone().into(),
        ]);
        args
    }
}

/// Build the engine, attach the history log and run the store's init
/// script. Happens once, before the dispatch loop.
pub fn prepare_engine(
    factory: EngineFactory,
    model: &str,
    history: Option<&Path>,
    store: &dyn ModelStore,
) -> Result<Box<dyn Engine>, WorkerError> {
    let engine = factory().map_err(WorkerError::Setup)?;
    let mut engine: Box<dyn Engine> = match history {
        Some(path) => {
            log::info!("[WORKER] Command history: {}", path.display());
            Box::new(HistoryEngine::open(engine, path).map_err(WorkerError::Setup)?)
        }
        None => engine,
    };
    if store.is_remote() {
        let script = store.fetch_file(model, INIT_SCRIPT)?;
        engine
            .execute(&String::from_utf8_lossy(&script))
            .map_err(WorkerError::Setup)?;
        log::info!("[WORKER] Init script executed");
    }
    Ok(engine)
}

/// One engine instance plus the store it resolves model files from.
pub struct Worker<E> {
    model: String,
    engine: E,
    store: Arc<dyn ModelStore>,
    state: WorkerState,
}

impl<E: Engine> Worker<E> {
    pub fn new(model: &str, engine: E, store: Arc<dyn ModelStore>) -> Self {
        Self {
            model: model.to_string(),
            engine,
            store,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Serve commands until `Terminate`, disconnection or `stop`.
    ///
    /// Consumes the channel end: both endpoints are closed when this returns.
    /// Errors (protocol faults, engine failures) end the loop without a reply.
    pub fn run(
        &mut self,
        end: WorkerEnd,
        poll_interval: Duration,
        stop: &AtomicBool,
    ) -> Result<WorkerExit, WorkerError> {
        log::info!("[WORKER] Ready, waiting for commands...");
        let result = self.serve(&end, poll_interval, stop);
        self.state = WorkerState::Terminated;
        result
    }

    fn serve(
        &mut self,
        end: &WorkerEnd,
        poll_interval: Duration,
        stop: &AtomicBool,
    ) -> Result<WorkerExit, WorkerError> {
        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("[WORKER] Termination requested, shutting down");
                return Ok(WorkerExit::Interrupted);
            }

            let frame = match end.commands.recv_timeout(poll_interval) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("[WORKER] Command channel closed, shutting down");
                    return Ok(WorkerExit::Disconnected);
                }
            };

            let command = decode_command(&frame).inspect_err(|fault| {
                log::error!("[WORKER] Protocol fault, aborting: {fault}");
            })?;

            self.state = WorkerState::Dispatching;
            let Some(response) = self.dispatch(command)? else {
                log::info!("[WORKER] Terminate received");
                return Ok(WorkerExit::Terminated);
            };
            let reply = encode_response(&response)?;
            end.responses.send(reply).map_err(|_| WorkerError::ReplyDropped)?;
            self.state = WorkerState::Idle;
        }
    }

    /// Execute one command. `None` means `Terminate`.
    fn dispatch(&mut self, command: Command) -> Result<Option<Response>, WorkerError> {
        let kind = command.kind();
        log::debug!("[WORKER] Dispatching {kind}");
        let engine_err = |source| WorkerError::Engine {
            command: kind,
            source,
        };
        let response = match command {
            Command::Call { file } => {
                let bytes = self.store.fetch_file(&self.model, &file)?;
                let model_file = ModelFile {
                    path: self.store.local_path(&self.model, &file),
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                    name: file,
                };
                self.engine.call(&model_file).map_err(engine_err)?;
                Response::Ack
            }
            Command::RawStatement { text } => {
                self.engine.execute(&text).map_err(engine_err)?;
                Response::Ack
            }
            Command::ListSequences => Response::SequenceNames {
                names: self.engine.sequences().map_err(engine_err)?,
            },
            Command::Twiss(args) => {
                let (table, summary) = self.engine.twiss(&args).map_err(engine_err)?;
                Response::TableResult { table, summary }
            }
            Command::Survey(args) => {
                let (table, summary) = self.engine.survey(&args).map_err(engine_err)?;
                Response::TableResult { table, summary }
            }
            Command::Aperture(args) => {
                let (table, summary) = self.engine.aperture(&args).map_err(engine_err)?;
                Response::TableResult { table, summary }
            }
            Command::Terminate => return Ok(None),
        };
        Ok(Some(response))
    }
}

/// Options shared by both execution units.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub model: String,
    pub history: Option<PathBuf>,
    pub poll_interval: Duration,
}

/// Body of a thread-mode worker.
pub fn run_worker_thread(
    end: WorkerEnd,
    factory: EngineFactory,
    store: Arc<dyn ModelStore>,
    options: WorkerOptions,
    stop: Arc<AtomicBool>,
) -> Result<WorkerExit, WorkerError> {
    let engine = prepare_engine(factory, &options.model, options.history.as_deref(), &*store)?;
    let mut worker = Worker::new(&options.model, engine, store);
    worker.run(end, options.poll_interval, &stop)
}

/// Run the worker process. Returns the process exit code.
pub fn run_worker_process(args: &WorkerArgs) -> i32 {
    log::info!(
        "[WORKER] Starting model worker process for '{}' (pid={})",
        args.model,
        std::process::id()
    );
    shutdown::install_termination_handler();

    let (controller_side, end) = channel::pair(None);
    let ControllerEnd {
        commands, responses, ..
    } = controller_side;
    let bridges = channel::spawn_line_reader("worker-stdin", io::stdin(), commands).and_then(|reader| {
        channel::spawn_line_writer("worker-stdout", responses, io::stdout()).map(|writer| (reader, writer))
    });
    let (_reader, writer) = match bridges {
        Ok(handles) => handles,
        Err(e) => {
            log::error!("[WORKER] Failed to start pipe threads: {e}");
            return EXIT_FAILURE;
        }
    };

    let store = args.store().open();
    let result = prepare_engine(
        args.engine().into_factory(),
        &args.model,
        args.history.as_deref(),
        &*store,
    )
    .and_then(|engine| {
        Worker::new(&args.model, engine, store).run(end, args.poll_interval(), shutdown::termination_flag())
    });

    // the loop dropped its end; wait for the last reply to be flushed
    let _ = writer.join();

    match result {
        Ok(exit) => {
            log::info!("[WORKER] Exiting ({exit:?})");
            EXIT_OK
        }
        Err(WorkerError::Protocol(fault)) => {
            log::error!("[WORKER] Aborting on protocol fault: {fault}");
            EXIT_PROTOCOL_FAULT
        }
        Err(e) => {
            log::error!("[WORKER] Aborting: {e}");
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dry_run::{DryRunEngine, EngineJournal};
    use crate::engine::TableKind;
    use crate::store::LocalStore;
    use crate::worker::ipc_types::{decode_response, encode_command, TableArgs};
    use std::thread;

    const POLL: Duration = Duration::from_millis(20);

    fn store_fixture() -> (tempfile::TempDir, Arc<dyn ModelStore>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lebt.json"),
            crate::model::descriptor::tests::SAMPLE,
        )
        .unwrap();
        std::fs::write(dir.path().join("lebt.seq"), "s1: sequence, l=10;\nendsequence;\n").unwrap();
        let store: Arc<dyn ModelStore> = Arc::new(LocalStore::new(dir.path()));
        (dir, store)
    }

    fn spawn(
        engine: DryRunEngine,
        store: Arc<dyn ModelStore>,
        stop: Arc<AtomicBool>,
    ) -> (ControllerEnd, thread::JoinHandle<Result<WorkerExit, WorkerError>>) {
        let (controller, end) = channel::pair(None);
        let handle = thread::spawn(move || {
            let mut worker = Worker::new("lebt", engine, store);
            let result = worker.run(end, POLL, &stop);
            assert_eq!(worker.state(), WorkerState::Terminated);
            result
        });
        (controller, handle)
    }

    #[test]
    fn test_dispatch_sequence() {
        let (_dir, store) = store_fixture();
        let journal = EngineJournal::new();
        let (mut controller, handle) = spawn(
            DryRunEngine::with_journal(journal.clone()),
            store,
            Arc::new(AtomicBool::new(false)),
        );

        let call = Command::Call {
            file: "lebt.seq".into(),
        };
        assert_eq!(controller.send(&call).unwrap(), Response::Ack);
        assert_eq!(
            controller.send(&Command::ListSequences).unwrap(),
            Response::SequenceNames {
                names: vec!["s1".into()]
            }
        );
        let twiss = Command::Twiss(TableArgs::new("s1", vec!["name".into()]));
        assert!(matches!(
            controller.send(&twiss).unwrap(),
            Response::TableResult { .. }
        ));
        controller.post(&Command::Terminate).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), WorkerExit::Terminated);
        assert_eq!(journal.calls(), vec!["lebt.seq"]);
        assert_eq!(journal.tables(TableKind::Twiss).len(), 1);
    }

    #[test]
    fn test_malformed_frame_aborts_without_reply() {
        let (_dir, store) = store_fixture();
        let (controller, handle) = spawn(DryRunEngine::new(), store, Arc::new(AtomicBool::new(false)));
        controller
            .commands
            .send(r#"{"type":"Bogus"}"#.to_string())
            .unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(WorkerError::Protocol(_))));
        assert!(controller.responses.recv().is_err());
    }

    #[test]
    fn test_engine_failure_ends_loop() {
        let (_dir, store) = store_fixture();
        let (controller, handle) = spawn(
            DryRunEngine::new().fail_on("crash"),
            store,
            Arc::new(AtomicBool::new(false)),
        );
        let frame = encode_command(&Command::RawStatement {
            text: "crash;".into(),
        });
        controller.commands.send(frame).unwrap();
        assert!(matches!(
            handle.join().unwrap(),
            Err(WorkerError::Engine {
                command: "RawStatement",
                ..
            })
        ));
        assert!(controller.responses.recv().is_err());
    }

    #[test]
    fn test_missing_file_ends_loop() {
        let (_dir, store) = store_fixture();
        let (controller, handle) = spawn(DryRunEngine::new(), store, Arc::new(AtomicBool::new(false)));
        let frame = encode_command(&Command::Call {
            file: "missing.str".into(),
        });
        controller.commands.send(frame).unwrap();
        assert!(matches!(handle.join().unwrap(), Err(WorkerError::Store(_))));
    }

    #[test]
    fn test_disconnect_exits_cleanly() {
        let (_dir, store) = store_fixture();
        let (controller, handle) = spawn(DryRunEngine::new(), store, Arc::new(AtomicBool::new(false)));
        drop(controller);
        assert_eq!(handle.join().unwrap().unwrap(), WorkerExit::Disconnected);
    }

    #[test]
    fn test_stop_flag_exits_on_next_poll() {
        let (_dir, store) = store_fixture();
        let stop = Arc::new(AtomicBool::new(false));
        let (_controller, handle) = spawn(DryRunEngine::new(), store, stop.clone());
        stop.store(true, Ordering::SeqCst);
        assert_eq!(handle.join().unwrap().unwrap(), WorkerExit::Interrupted);
    }

    #[test]
    fn test_replies_keep_request_order() {
        let (_dir, store) = store_fixture();
        let (mut controller, handle) = spawn(DryRunEngine::new(), store, Arc::new(AtomicBool::new(false)));
        for i in 0..5 {
            let frame = encode_command(&Command::RawStatement {
                text: format!("s{i}: sequence, l=1;"),
            });
            controller.commands.send(frame).unwrap();
            let reply = controller.responses.recv().unwrap();
            assert_eq!(decode_response(&reply).unwrap(), Response::Ack);
        }
        let names = controller.send(&Command::ListSequences).unwrap();
        assert_eq!(
            names,
            Response::SequenceNames {
                names: (0..5).map(|i| format!("s{i}")).collect()
            }
        );
        drop(controller);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_prepare_engine_with_history() {
        let (dir, store) = store_fixture();
        let history = dir.path().join("history.madx");
        let mut engine = prepare_engine(
            Box::new(|| Ok(Box::new(DryRunEngine::new()) as Box<dyn Engine>)),
            "lebt",
            Some(&history),
            &*store,
        )
        .unwrap();
        engine.execute("x = 1;").unwrap();
        drop(engine);
        assert_eq!(std::fs::read_to_string(history).unwrap(), "x = 1;\n");
    }

    #[test]
    fn test_prepare_engine_runs_remote_init_script() {
        let store = crate::store::tests::MemoryStore::with_files(&[("initscript", "beam;\n")]);
        let journal = EngineJournal::new();
        let factory_journal = journal.clone();
        prepare_engine(
            Box::new(move || Ok(Box::new(DryRunEngine::with_journal(factory_journal)) as Box<dyn Engine>)),
            "lebt",
            None,
            &store,
        )
        .unwrap();
        assert_eq!(journal.statements(), vec!["beam;\n"]);

        // a remote store without an init script cannot host a worker
        let empty = crate::store::tests::MemoryStore::default();
        let err = prepare_engine(
            Box::new(|| Ok(Box::new(DryRunEngine::new()) as Box<dyn Engine>)),
            "lebt",
            None,
            &empty,
        )
        .err()
        .unwrap();
        assert!(matches!(err, WorkerError::Store(_)), "{err}");
    }

    #[test]
    fn test_worker_args_roundtrip() {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: WorkerArgs,
        }

        let args = WorkerArgs::new(
            "lebt",
            &StoreConfig::Remote {
                url: "http://db".into(),
            },
            &EngineConfig::DryRun,
            Some(Path::new("h.madx")),
            Duration::from_millis(250),
        );
        let mut argv: Vec<OsString> = vec!["worker".into()];
        argv.extend(args.to_args());
        let parsed = Wrapper::try_parse_from(argv).unwrap().args;
        assert_eq!(parsed, args);
        assert_eq!(parsed.engine(), EngineConfig::DryRun);
        assert_eq!(parsed.store(), StoreConfig::Remote { url: "http://db".into() });
        assert_eq!(parsed.poll_interval(), Duration::from_millis(250));
    }
}
