//! Engine that records every interaction instead of computing anything.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use madx_model_types::{Summary, Table, TableArgs, Value};

use super::{Engine, EngineError, ModelFile, SequenceRegistry, TableKind};

/// One recorded engine interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Call(String),
    Execute(String),
    Sequences,
    Table(TableKind, TableArgs),
}

/// Shared, cloneable log of [`EngineCall`]s.
#[derive(Debug, Clone, Default)]
pub struct EngineJournal {
    calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl EngineJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: EngineCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    pub fn snapshot(&self) -> Vec<EngineCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Names of called files, in order.
    pub fn calls(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Call(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Executed statements, in order.
    pub fn statements(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Execute(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Arguments of every table computation of one kind, in order.
    pub fn tables(&self, kind: TableKind) -> Vec<TableArgs> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Table(k, args) if k == kind => Some(args),
                _ => None,
            })
            .collect()
    }
}

/// Records calls in an [`EngineJournal`] and returns empty tables.
#[derive(Debug, Default)]
pub struct DryRunEngine {
    journal: EngineJournal,
    registry: SequenceRegistry,
    fail_on: Option<String>,
    delay: Option<Duration>,
}

impl DryRunEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: EngineJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Fail (as a crashing engine would) on any statement or file containing
    /// `needle`.
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    /// Take `delay` over every statement, file and table, like a busy engine.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn journal(&self) -> &EngineJournal {
        &self.journal
    }

    fn check(&self, text: &str) -> Result<(), EngineError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match &self.fail_on {
            Some(needle) if text.contains(needle.as_str()) => {
                Err(EngineError::Fatal(format!("injected failure on '{needle}'")))
            }
            _ => Ok(()),
        }
    }

    fn table(&mut self, kind: TableKind, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.journal.push(EngineCall::Table(kind, args.clone()));
        self.check(&args.sequence)?;
        let mut summary = Summary::new();
        summary.insert("name".to_string(), Value::Text(kind.name().to_uppercase()));
        summary.insert("sequence".to_string(), Value::Text(args.sequence.clone()));
        Ok((Table::new(args.columns.clone()), summary))
    }
}

impl Engine for DryRunEngine {
    fn call(&mut self, file: &ModelFile) -> Result<(), EngineError> {
        self.journal.push(EngineCall::Call(file.name.clone()));
        self.check(&file.content)?;
        let base = file.path.as_deref().and_then(Path::parent);
        self.registry.scan(&file.content, base);
        Ok(())
    }

    fn execute(&mut self, statement: &str) -> Result<(), EngineError> {
        self.journal.push(EngineCall::Execute(statement.to_string()));
        self.check(statement)?;
        self.registry.scan(statement, None);
        Ok(())
    }

    fn sequences(&mut self) -> Result<Vec<String>, EngineError> {
        self.journal.push(EngineCall::Sequences);
        Ok(self.registry.names())
    }

    fn twiss(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.table(TableKind::Twiss, args)
    }

    fn survey(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.table(TableKind::Survey, args)
    }

    fn aperture(&mut self, args: &TableArgs) -> Result<(Table, Summary), EngineError> {
        self.table(TableKind::Aperture, args)
    }
}
