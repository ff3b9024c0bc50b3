//! The simulation engine as seen by the worker.
//!
//! The worker owns exactly one [`Engine`] and is the only thing that ever
//! touches it. Implementations:
//! - [`madx::MadxEngine`]: an external `madx` executable driven over pipes
//! - [`dry_run::DryRunEngine`]: records interactions, computes nothing
//! - [`history::HistoryEngine`]: decorator writing a command history log

pub mod dry_run;
pub mod history;
pub mod madx;
pub mod tfs;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use madx_model_types::{Summary, Table, TableArgs};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Start(#[source] std::io::Error),
    #[error("engine i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine exited unexpectedly")]
    Exited,
    #[error("engine reported a fatal error: {0}")]
    Fatal(String),
    #[error("failed to read result table: {0}")]
    Table(#[from] tfs::TfsError),
}

/// Which table computation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Twiss,
    Survey,
    Aperture,
}

impl TableKind {
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Twiss => "twiss",
            TableKind::Survey => "survey",
            TableKind::Aperture => "aperture",
        }
    }
}

/// A model file resolved by the worker.
#[derive(Debug, Clone)]
pub struct ModelFile {
    pub name: String,
    pub content: String,
    /// Set when the file lives on local disk.
    pub path: Option<PathBuf>,
}

pub trait Engine {
    /// Execute a file's statements as one batch.
    fn call(&mut self, file: &ModelFile) -> Result<(), EngineError>;

    fn execute(&mut self, statement: &str) -> Result<(), EngineError>;

    /// Declared sequence names, in declaration order.
    fn sequences(&mut self) -> Result<Vec<String>, EngineError>;

    fn twiss(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError>;

    fn survey(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError>;

    fn aperture(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError>;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn call(&mut self, file: &ModelFile) -> Result<(), EngineError> {
        (**self).call(file)
    }

    fn execute(&mut self, statement: &str) -> Result<(), EngineError> {
        (**self).execute(statement)
    }

    fn sequences(&mut self) -> Result<Vec<String>, EngineError> {
        (**self).sequences()
    }

    fn twiss(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        (**self).twiss(args)
    }

    fn survey(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        (**self).survey(args)
    }

    fn aperture(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        (**self).aperture(args)
    }
}

/// Builds the engine inside the worker's execution unit.
pub type EngineFactory = Box<dyn FnOnce() -> Result<Box<dyn Engine>, EngineError> + Send>;

/// Serializable engine selection (settings file, worker command line).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    Madx { executable: PathBuf },
    DryRun,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Madx {
            executable: PathBuf::from("madx"),
        }
    }
}

impl EngineConfig {
    pub fn build(&self) -> Result<Box<dyn Engine>, EngineError> {
        match self {
            EngineConfig::Madx { executable } => Ok(Box::new(madx::MadxEngine::spawn(executable)?)),
            EngineConfig::DryRun => Ok(Box::new(dry_run::DryRunEngine::new())),
        }
    }

    pub fn into_factory(self) -> EngineFactory {
        Box::new(move || self.build())
    }
}

/// Engine statement equivalent to a table computation.
pub fn table_statement(kind: TableKind, args: &TableArgs, file: Option<&str>) -> String {
    // aperture always runs on the sequence in use
    let mut stmt = match kind {
        TableKind::Aperture => kind.name().to_string(),
        _ => format!("{}, sequence={}", kind.name(), args.sequence),
    };
    if let Some(range) = &args.range {
        if kind != TableKind::Survey {
            stmt.push_str(&format!(", range={range}"));
        }
    }
    if kind == TableKind::Aperture {
        if let Some(offsets) = &args.offsets {
            stmt.push_str(&format!(", offsetelem=\"{offsets}\""));
        }
    }
    if let Some(file) = file {
        stmt.push_str(&format!(", file=\"{file}\""));
    }
    stmt.push(';');
    stmt
}

lazy_static::lazy_static! {
    static ref SEQUENCE_DECL: Regex =
        Regex::new(r"(?im)^\s*([a-z_][\w.$]*)\s*:\s*sequence\s*[,;]").expect("valid regex");
    static ref CALL_STMT: Regex =
        Regex::new(r#"(?im)^\s*call\s*,\s*file\s*=\s*"?([^";\s]+)"?"#).expect("valid regex");
}

/// Sequence names declared by executed text, first declaration first.
#[derive(Debug, Clone, Default)]
pub struct SequenceRegistry {
    names: Vec<String>,
}

impl SequenceRegistry {
    /// Record the sequences `text` declares. With a `base` directory,
    /// `call, file=...` statements are followed too, relative targets
    /// resolving against `base` the way the engine resolves them against
    /// its working directory.
    pub fn scan(&mut self, text: &str, base: Option<&Path>) {
        let mut visited = HashSet::new();
        self.scan_nested(text, base, &mut visited);
    }

    fn scan_nested(&mut self, text: &str, base: Option<&Path>, visited: &mut HashSet<PathBuf>) {
        let Some(base) = base else {
            for caps in SEQUENCE_DECL.captures_iter(text) {
                self.add(&caps[1]);
            }
            return;
        };

        // declarations and calls in source order
        let mut items: Vec<(usize, bool, &str)> = SEQUENCE_DECL
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| (m.start(), false, m.as_str())))
            .chain(
                CALL_STMT
                    .captures_iter(text)
                    .filter_map(|c| c.get(1).map(|m| (m.start(), true, m.as_str()))),
            )
            .collect();
        items.sort_by_key(|&(pos, _, _)| pos);

        for (_, is_call, value) in items {
            if !is_call {
                self.add(value);
                continue;
            }
            let target = base.join(value);
            if !visited.insert(target.clone()) {
                continue;
            }
            match std::fs::read_to_string(&target) {
                Ok(nested) => self.scan_nested(&nested, Some(base), visited),
                Err(e) => log::debug!("[MADX] Not scanning {}: {e}", target.display()),
            }
        }
    }

    fn add(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        if !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.clone()
    }
}
