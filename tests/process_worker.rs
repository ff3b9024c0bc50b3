//! Process-isolated workers, driven through the real binary with the
//! dry-run engine.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use madx_model::engine::EngineConfig;
use madx_model::{Model, ModelError, ModelOptions, StoreConfig, TableRequest, WorkerMode};

const BIN: &str = env!("CARGO_BIN_EXE_madx_model");

const DESCRIPTOR: &str = r##"{
    "sequence": "lebt.seq",
    "default": {"sequence": "s1", "optics": "A"},
    "sequences": {
        "s1": {"aperfiles": ["s1.aper"], "ranges": {"full": {"range": "#s/#e"}}},
        "s2": {}
    },
    "optics": {
        "A": {"strengths": ["f1.str"]},
        "B": {"knobs": {"K1": true}}
    },
    "knobs": {"K1": {"qp_k1": 2.0, "qp2_k1": -0.5}}
}"##;

fn model_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("lebt.json"), DESCRIPTOR).unwrap();
    std::fs::write(
        root.join("lebt.seq"),
        "s1: sequence, l=10;\nendsequence;\ns2: sequence, l=4;\nendsequence;\n",
    )
    .unwrap();
    std::fs::write(root.join("f1.str"), "qp_k1 = 1.5;\n").unwrap();
    std::fs::write(root.join("s1.aper"), "qp, apertype=circle;\n").unwrap();
    dir
}

fn store(dir: &Path) -> StoreConfig {
    StoreConfig::Local {
        root: dir.to_path_buf(),
    }
}

fn process_options(history: Option<PathBuf>) -> ModelOptions {
    ModelOptions {
        history,
        worker: WorkerMode::Process {
            program: Some(PathBuf::from(BIN)),
            engine: EngineConfig::DryRun,
        },
        poll_interval: Duration::from_millis(50),
        teardown_timeout: Duration::from_secs(5),
        ..ModelOptions::default()
    }
}

fn spawn_raw_worker(dir: &Path) -> Child {
    Command::new(BIN)
        .args(["worker", "--model", "lebt", "--dry-run", "--poll-interval-ms", "50"])
        .arg("--store-dir")
        .arg(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn wait_with_bound(child: &mut Child, bound: Duration) -> Option<i32> {
    let deadline = Instant::now() + bound;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return status.code();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = child.kill();
    panic!("worker did not exit within {bound:?}");
}

#[test]
fn test_model_over_process_worker() {
    let dir = model_dir();
    let history = dir.path().join("history.madx");
    let mut model = Model::open(&store(dir.path()), "lebt", process_options(Some(history.clone()))).unwrap();

    assert_eq!(model.get_sequences().unwrap(), vec!["s1", "s2"]);
    model.set_optics("B").unwrap();
    model.set_optics("B").unwrap();
    let (table, summary) = model.aperture(&TableRequest::aperture()).unwrap();
    assert_eq!(table.columns[0], "name");
    assert_eq!(summary["sequence"].as_str(), Some("s1"));
    assert!(model.sequence_state("s1").unwrap().aperture_files_loaded);

    let started = Instant::now();
    model.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let log = std::fs::read_to_string(history).unwrap();
    assert!(log.contains("! call lebt.seq"));
    assert!(log.contains("qp_k1 = 1.5;"));
    assert_eq!(log.matches("qp_k1 = 2;").count(), 1);
    assert_eq!(log.matches("qp2_k1 = -0.5;").count(), 1);
    assert_eq!(log.matches("twiss, sequence=s1;").count(), 1);
    assert!(log.contains("! call s1.aper"));
    assert!(log.trim_end().ends_with("aperture;"));
}

#[test]
fn test_engine_failure_reported_as_unavailable() {
    let dir = model_dir();
    let mut options = process_options(None);
    options.worker = WorkerMode::Process {
        program: Some(PathBuf::from(BIN)),
        engine: EngineConfig::Madx {
            executable: dir.path().join("no-such-madx"),
        },
    };
    // the worker cannot start its engine and exits before answering
    let err = Model::open(&store(dir.path()), "lebt", options).unwrap_err();
    assert!(matches!(err, ModelError::WorkerUnavailable(_)), "{err}");
}

#[test]
fn test_malformed_frame_aborts_worker() {
    let dir = model_dir();
    let mut child = spawn_raw_worker(dir.path());
    let mut stdin = child.stdin.take().unwrap();
    writeln!(stdin, r#"{{"type":"Launch","target":"moon"}}"#).unwrap();
    stdin.flush().unwrap();

    assert_eq!(wait_with_bound(&mut child, Duration::from_secs(5)), Some(70));
    let mut stdout = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut stdout)
        .unwrap();
    assert!(stdout.is_empty(), "unexpected reply: {stdout}");
}

#[test]
fn test_terminate_and_eof_exit_cleanly() {
    let dir = model_dir();

    let mut child = spawn_raw_worker(dir.path());
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    writeln!(stdin, r#"{{"type":"RawStatement","text":"x = 1;"}}"#).unwrap();
    stdin.flush().unwrap();
    let mut reply = String::new();
    stdout.read_line(&mut reply).unwrap();
    assert_eq!(reply.trim(), r#"{"type":"Ack"}"#);
    writeln!(stdin, r#"{{"type":"Terminate"}}"#).unwrap();
    stdin.flush().unwrap();
    assert_eq!(wait_with_bound(&mut child, Duration::from_secs(5)), Some(0));

    let mut child = spawn_raw_worker(dir.path());
    drop(child.stdin.take());
    assert_eq!(wait_with_bound(&mut child, Duration::from_secs(5)), Some(0));
}

#[cfg(unix)]
#[test]
fn test_sigterm_is_a_clean_exit() {
    let dir = model_dir();
    let mut child = spawn_raw_worker(dir.path());
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    // one round trip so the handler is installed
    writeln!(stdin, r#"{{"type":"ListSequences"}}"#).unwrap();
    stdin.flush().unwrap();
    let mut reply = String::new();
    stdout.read_line(&mut reply).unwrap();
    assert!(reply.contains("SequenceNames"));

    let pid = libc::pid_t::try_from(child.id()).unwrap();
    // SAFETY: signalling our own child.
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);
    assert_eq!(wait_with_bound(&mut child, Duration::from_secs(5)), Some(0));
    drop(stdin);
}

#[test]
fn test_cli_prints_json() {
    let dir = model_dir();
    let config = dir.path().join("settings.json");
    std::fs::write(
        &config,
        serde_json::json!({
            "store": {"kind": "local", "root": dir.path()},
            "worker": {"poll_interval_secs": 0.05},
            "log": {"level": "warn"}
        })
        .to_string(),
    )
    .unwrap();

    let output = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .args(["--model", "lebt", "--dry-run", "sequences"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let names: Vec<String> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(names, vec!["s1", "s2"]);

    let output = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .args(["--model", "lebt", "--dry-run", "--optics", "Z", "optics"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown optics 'Z'"));
}
