//! Commands the controller sends and the responses the worker returns.

use serde::{Deserialize, Serialize};

use crate::table::{Summary, Table};

/// Arguments of a table computation (twiss, survey, aperture).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TableArgs {
    pub sequence: String,
    pub columns: Vec<String>,
    /// Engine range expression, e.g. `#s/#e`. `None` means the full sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    /// Also write the table to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Element offsets file, only used by aperture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<String>,
}

impl TableArgs {
    pub fn new(sequence: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            sequence: sequence.into(),
            columns,
            ..Self::default()
        }
    }
}

/// Commands the controller can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Command {
    /// Execute a model file (resolved by the worker from its store).
    Call { file: String },
    /// Execute one engine statement.
    RawStatement { text: String },
    /// List the sequences the engine knows about.
    ListSequences,
    Twiss(TableArgs),
    Survey(TableArgs),
    Aperture(TableArgs),
    /// Close the channel and exit. No reply is sent.
    Terminate,
}

impl Command {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Call { .. } => "Call",
            Command::RawStatement { .. } => "RawStatement",
            Command::ListSequences => "ListSequences",
            Command::Twiss(_) => "Twiss",
            Command::Survey(_) => "Survey",
            Command::Aperture(_) => "Aperture",
            Command::Terminate => "Terminate",
        }
    }
}

/// Responses the worker sends back, one per command (except `Terminate`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    Ack,
    SequenceNames { names: Vec<String> },
    TableResult { table: Table, summary: Summary },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "Ack",
            Response::SequenceNames { .. } => "SequenceNames",
            Response::TableResult { .. } => "TableResult",
        }
    }
}
