//! Command history log.
//!
//! Every statement the engine receives is appended to the log before it is
//! executed, so the log can be replayed to reproduce a session.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use madx_model_types::{Summary, Table, TableArgs};

use super::{table_statement, Engine, EngineError, ModelFile, TableKind};

pub struct HistoryEngine<E> {
    inner: E,
    log: BufWriter<File>,
}

impl<E: Engine> HistoryEngine<E> {
    pub fn open(inner: E, path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner,
            log: BufWriter::new(file),
        })
    }

    fn record(&mut self, text: &str) -> Result<(), EngineError> {
        self.log.write_all(text.trim_end().as_bytes())?;
        self.log.write_all(b"\n")?;
        self.log.flush()?;
        Ok(())
    }
}

impl<E: Engine> Engine for HistoryEngine<E> {
    fn call(&mut self, file: &ModelFile) -> Result<(), EngineError> {
        self.record(&format!("! call {}", file.name))?;
        self.record(&file.content)?;
        self.inner.call(file)
    }

    fn execute(&mut self, statement: &str) -> Result<(), EngineError> {
        self.record(statement)?;
        self.inner.execute(statement)
    }

    fn sequences(&mut self) -> Result<Vec<String>, EngineError> {
        self.inner.sequences()
    }

    fn twiss(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.record(&table_statement(TableKind::Twiss, args, args.output.as_deref()))?;
        self.inner.twiss(args)
    }

    fn survey(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.record(&table_statement(TableKind::Survey, args, args.output.as_deref()))?;
        self.inner.survey(args)
    }

    fn aperture(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.record(&table_statement(TableKind::Aperture, args, args.output.as_deref()))?;
        self.inner.aperture(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dry_run::DryRunEngine;

    #[test]
    fn test_history_contains_all_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("history.madx");
        {
            let mut engine = HistoryEngine::open(DryRunEngine::new(), &path).unwrap();
            engine
                .call(&ModelFile {
                    name: "lebt.seq".into(),
                    content: "s1: sequence, l=10;\nendsequence;\n".into(),
                    path: None,
                })
                .unwrap();
            engine.execute("qp_k1 = 2;").unwrap();
            engine.twiss(&TableArgs::new("s1", vec![])).unwrap();
        }
        let history = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            history,
            "! call lebt.seq\ns1: sequence, l=10;\nendsequence;\nqp_k1 = 2;\ntwiss, sequence=s1;\n"
        );
    }

    #[test]
    fn test_history_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.madx");
        for stmt in ["a = 1;", "b = 2;"] {
            let mut engine = HistoryEngine::open(DryRunEngine::new(), &path).unwrap();
            engine.execute(stmt).unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a = 1;\nb = 2;\n");
    }
}
