//! Engine backed by an external `madx` executable.
//!
//! Input is streamed to the engine's stdin. Because the engine's stdout is
//! block-buffered when it is not a terminal, completion of each batch is
//! detected through a marker file the engine echoes into once everything
//! before it has run. Result tables are read back from TFS files.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use madx_model_types::{Summary, Table, TableArgs};

use super::{table_statement, tfs, Engine, EngineError, ModelFile, SequenceRegistry, TableKind};

const SYNC_POLL: Duration = Duration::from_millis(5);
const EXIT_WAIT: Duration = Duration::from_secs(2);

pub struct MadxEngine {
    child: Child,
    stdin: ChildStdin,
    output: Receiver<String>,
    scratch: PathBuf,
    registry: SequenceRegistry,
    /// Sequence currently expanded with `use`.
    active: Option<String>,
    batches: u64,
}

impl MadxEngine {
    pub fn spawn(executable: &Path) -> Result<Self, EngineError> {
        let scratch = std::env::temp_dir().join(format!("madx-model-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch).map_err(EngineError::Start)?;

        log::info!("[MADX] Starting engine: {}", executable.display());
        let mut child = Command::new(executable)
            .current_dir(&scratch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(EngineError::Start)?;
        let stdin = child.stdin.take().ok_or(EngineError::Exited)?;
        let stdout = child.stdout.take().ok_or(EngineError::Exited)?;

        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("madx-stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(l) => {
                            if line_tx.send(l).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .map_err(EngineError::Start)?;

        let mut engine = Self {
            child,
            stdin,
            output: line_rx,
            scratch,
            registry: SequenceRegistry::default(),
            active: None,
            batches: 0,
        };
        engine.run("option, -echo, -info, warn;")?;
        Ok(engine)
    }

    /// Feed `input` to the engine and wait until it has been processed.
    fn run(&mut self, input: &str) -> Result<(), EngineError> {
        self.batches += 1;
        let marker = format!("madx-model-sync-{}", self.batches);
        let sync_file = self.scratch.join(format!("{marker}.txt"));

        writeln!(self.stdin, "{}", terminated(input))?;
        writeln!(
            self.stdin,
            "assign, echo=\"{}\";\nprint, text=\"{marker}\";\nassign, echo=terminal;",
            sync_file.display()
        )?;
        self.stdin.flush()?;

        loop {
            if let Ok(text) = fs::read_to_string(&sync_file) {
                if text.contains(&marker) {
                    let _ = fs::remove_file(&sync_file);
                    break;
                }
            }
            if let Some(status) = self.child.try_wait()? {
                log::error!("[MADX] Engine exited with {status}");
                return Err(self.fatal_message().map_or(EngineError::Exited, EngineError::Fatal));
            }
            thread::sleep(SYNC_POLL);
        }

        match self.fatal_message() {
            Some(message) => Err(EngineError::Fatal(message)),
            None => Ok(()),
        }
    }

    /// Drain buffered engine output, returning the first fatal error line.
    fn fatal_message(&self) -> Option<String> {
        let mut fatal = None;
        for line in self.output.try_iter() {
            log::trace!("[MADX] {line}");
            if fatal.is_none() {
                if let Some(idx) = line.to_ascii_lowercase().find("fatal:") {
                    fatal = Some(line[idx + "fatal:".len()..].trim().to_string());
                }
            }
        }
        fatal
    }

    fn ensure_active(&mut self, sequence: &str) -> Result<(), EngineError> {
        if self.active.as_deref() != Some(sequence) {
            self.run(&format!("use, sequence={sequence};"))?;
            self.active = Some(sequence.to_string());
        }
        Ok(())
    }

    fn table(&mut self, kind: TableKind, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        let (file, temporary) = match &args.output {
            Some(path) => (PathBuf::from(path), false),
            None => (
                self.scratch
                    .join(format!("{}-{}.tfs", kind.name(), uuid::Uuid::new_v4())),
                true,
            ),
        };
        let file_str = file.display().to_string();

        let mut input = String::new();
        if kind != TableKind::Aperture && !args.columns.is_empty() {
            input.push_str(&format!(
                "select, flag={kind}, clear;\nselect, flag={kind}, column={};\n",
                args.columns.join(","),
                kind = kind.name()
            ));
        }
        if kind == TableKind::Survey && args.range.is_some() {
            log::warn!("[MADX] survey does not support ranges, computing the full sequence");
        }
        input.push_str(&table_statement(kind, args, Some(&file_str)));
        self.run(&input)?;

        let text = fs::read_to_string(&file)?;
        if temporary {
            let _ = fs::remove_file(&file);
        }
        let (table, summary) = tfs::parse(&text)?;
        Ok((table.select(&args.columns), summary))
    }
}

/// `input` with a closing `;` on its own line when the last statement lacks
/// one, so the sync statements that follow are not parsed as part of it.
fn terminated(input: &str) -> String {
    let input = input.trim_end();
    if input.is_empty() || input.ends_with(';') {
        input.to_string()
    } else {
        format!("{input}\n;")
    }
}

impl Engine for MadxEngine {
    fn call(&mut self, file: &ModelFile) -> Result<(), EngineError> {
        let Some(path) = &file.path else {
            self.registry.scan(&file.content, Some(&self.scratch));
            return self.run(&file.content);
        };
        // nested calls in a model file resolve against its own directory
        let path = fs::canonicalize(path)?;
        let dir = path
            .parent()
            .map_or_else(|| self.scratch.clone(), Path::to_path_buf);
        self.registry.scan(&file.content, Some(&dir));
        let input = format!(
            "chdir, dir=\"{}\";\ncall, file=\"{}\";\nchdir, dir=\"{}\";",
            dir.display(),
            path.display(),
            self.scratch.display()
        );
        self.run(&input)
    }

    fn execute(&mut self, statement: &str) -> Result<(), EngineError> {
        self.registry.scan(statement, Some(&self.scratch));
        self.run(statement)
    }

    fn sequences(&mut self) -> Result<Vec<String>, EngineError> {
        Ok(self.registry.names())
    }

    fn twiss(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.ensure_active(&args.sequence)?;
        self.table(TableKind::Twiss, args)
    }

    fn survey(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.ensure_active(&args.sequence)?;
        self.table(TableKind::Survey, args)
    }

    fn aperture(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        if self.active.as_deref() != Some(args.sequence.as_str()) {
            // aperture reads the twiss table of the sequence in use
            self.ensure_active(&args.sequence)?;
            self.run("twiss;")?;
        }
        self.table(TableKind::Aperture, args)
    }
}

impl Drop for MadxEngine {
    fn drop(&mut self) {
        let _ = writeln!(self.stdin, "exit;");
        let _ = self.stdin.flush();
        let deadline = Instant::now() + EXIT_WAIT;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(SYNC_POLL),
                _ => {
                    log::warn!("[MADX] Engine did not exit, killing it");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        let _ = fs::remove_dir_all(&self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated() {
        assert_eq!(terminated("x = 1;\n"), "x = 1;");
        assert_eq!(terminated("x = 1"), "x = 1\n;");
        assert_eq!(terminated("beam, particle=electron"), "beam, particle=electron\n;");
        // a trailing comment must not swallow the terminator
        assert_eq!(terminated("x = 1;\n! done\n"), "x = 1;\n! done\n;");
        assert_eq!(terminated("  \n"), "");
    }
}
