//! The model controller.
//!
//! Holds the descriptor, the per-sequence state and the worker handle, and
//! turns high-level operations into command/response exchanges. Lookup
//! errors are detected here before the worker is contacted.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::descriptor::{DescriptorError, ModelDescriptor};
use super::state::{SequenceState, SequenceStates};
use crate::error::ModelError;
use crate::store::{ModelStore, StoreConfig, StoreError};
use crate::worker::ipc_types::{Command, Response, Summary, Table, TableArgs};
use crate::worker::process_manager::{
    spawn_worker, LaunchConfig, WorkerHandle, WorkerMode, DEFAULT_TEARDOWN_TIMEOUT,
};
use crate::worker::worker_main::DEFAULT_POLL_INTERVAL;

pub const TWISS_COLUMNS: &[&str] = &[
    "name", "s", "betx", "bety", "x", "y", "dx", "dy", "px", "py", "mux", "muy",
];
pub const SURVEY_COLUMNS: &[&str] = &["name", "l", "angle", "x", "y", "z", "theta"];
pub const APERTURE_COLUMNS: &[&str] = &[
    "name", "l", "s", "n1", "aper_1", "aper_2", "aper_3", "aper_4",
];

#[derive(Debug)]
pub struct ModelOptions {
    /// Initial optics; the descriptor default when `None`.
    pub optics: Option<String>,
    /// Engine command history log.
    pub history: Option<PathBuf>,
    pub worker: WorkerMode,
    pub poll_interval: Duration,
    pub teardown_timeout: Duration,
    /// Bound on each reply. `None` waits as long as the worker is alive.
    pub reply_timeout: Option<Duration>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            optics: None,
            history: None,
            worker: WorkerMode::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            reply_timeout: None,
        }
    }
}

/// Arguments of a twiss, survey or aperture request.
///
/// For twiss and survey `range` is an engine range expression; for aperture
/// it names one of the sequence's declared ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRequest {
    pub sequence: Option<String>,
    pub columns: Vec<String>,
    pub range: Option<String>,
    pub output: Option<PathBuf>,
}

impl TableRequest {
    fn with_columns(columns: &[&str]) -> Self {
        Self {
            sequence: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            range: None,
            output: None,
        }
    }

    pub fn twiss() -> Self {
        Self::with_columns(TWISS_COLUMNS)
    }

    pub fn survey() -> Self {
        Self::with_columns(SURVEY_COLUMNS)
    }

    pub fn aperture() -> Self {
        Self::with_columns(APERTURE_COLUMNS)
    }

    pub fn sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    fn range_name(&self) -> Option<&str> {
        self.range.as_deref().filter(|r| !r.is_empty())
    }
}

/// Offsets file handed to an aperture computation.
enum OffsetsFile {
    Local(PathBuf),
    /// Fetched from a remote store; removed on drop.
    Temporary(PathBuf),
}

impl OffsetsFile {
    fn path(&self) -> &PathBuf {
        match self {
            OffsetsFile::Local(path) | OffsetsFile::Temporary(path) => path,
        }
    }
}

impl Drop for OffsetsFile {
    fn drop(&mut self) {
        if let OffsetsFile::Temporary(path) = self {
            if let Err(e) = fs::remove_file(&*path) {
                log::warn!("[MODEL] Failed to remove {}: {e}", path.display());
            }
        }
    }
}

/// A loaded accelerator model bound to its own worker.
pub struct Model {
    name: String,
    descriptor: ModelDescriptor,
    store: Arc<dyn ModelStore>,
    worker: WorkerHandle,
    states: SequenceStates,
    optics: Option<String>,
}

impl Model {
    /// Load `name` from `store`, start its worker, call the sequence file and
    /// apply the initial optics.
    pub fn open(store: &StoreConfig, name: &str, options: ModelOptions) -> Result<Self, ModelError> {
        Self::with_store(store.open(), name, options)
    }

    /// [`Model::open`] over an already opened store. Process workers reopen
    /// the store from its [`ModelStore::config`].
    pub fn with_store(
        store: Arc<dyn ModelStore>,
        name: &str,
        options: ModelOptions,
    ) -> Result<Self, ModelError> {
        let descriptor = store.load(name)?;
        let initial_optics = options
            .optics
            .clone()
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| descriptor.default.optics.clone());
        if descriptor.optics(&initial_optics).is_none() {
            return Err(ModelError::UnknownOptics(initial_optics));
        }

        let launch = LaunchConfig {
            model: name.to_string(),
            store: store.clone(),
            history: options.history,
            poll_interval: options.poll_interval,
            reply_timeout: options.reply_timeout,
            teardown_timeout: options.teardown_timeout,
        };
        let worker = spawn_worker(options.worker, &launch)?;

        let mut model = Self {
            name: name.to_string(),
            states: SequenceStates::new(descriptor.sequences.keys().cloned()),
            descriptor,
            store,
            worker,
            optics: None,
        };
        let sequence_file = model.descriptor.sequence.clone();
        model.call(&sequence_file)?;
        model.set_optics(&initial_optics)?;
        log::info!("[MODEL] Model '{name}' ready with optics '{initial_optics}'");
        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn current_optics(&self) -> Option<&str> {
        self.optics.as_deref()
    }

    pub fn sequence_state(&self, sequence: &str) -> Option<SequenceState> {
        self.states.get(sequence)
    }

    pub fn has_sequence(&self, sequence: &str) -> bool {
        self.descriptor.sequence(sequence).is_some()
    }

    pub fn has_optics(&self, optics: &str) -> bool {
        self.descriptor.optics(optics).is_some()
    }

    pub fn list_optics(&self) -> Vec<String> {
        self.descriptor.optics.keys().cloned().collect()
    }

    pub fn list_ranges(&self, sequence: &str) -> Result<Vec<String>, ModelError> {
        self.descriptor
            .list_ranges(sequence)
            .ok_or_else(|| ModelError::UnknownSequence(sequence.to_string()))
    }

    /// Apply an optics. An empty name selects the default optics; applying
    /// the current optics again does nothing.
    pub fn set_optics(&mut self, optics: &str) -> Result<(), ModelError> {
        let optics = if optics.is_empty() {
            self.descriptor.default.optics.clone()
        } else {
            optics.to_string()
        };
        if self.optics.as_deref() == Some(optics.as_str()) {
            log::info!("[MODEL] Optics '{optics}' already applied");
            return Ok(());
        }
        let spec = self
            .descriptor
            .optics(&optics)
            .cloned()
            .ok_or_else(|| ModelError::UnknownOptics(optics.clone()))?;

        for file in &spec.strengths {
            self.call(file)?;
        }
        for (knob, enabled) in &spec.knobs {
            self.set_knob(knob, if *enabled { 1.0 } else { 0.0 })?;
        }
        for beam in &spec.beams {
            let statement = self.descriptor.beams.get(beam).cloned().ok_or_else(|| {
                ModelError::Descriptor(DescriptorError::DanglingReference {
                    optics: optics.clone(),
                    kind: "beam",
                    name: beam.clone(),
                })
            })?;
            self.command(&statement)?;
        }

        log::info!("[MODEL] Optics set to '{optics}'");
        self.optics = Some(optics);
        Ok(())
    }

    /// Set every element mapped by `knob` to its coefficient times `scale`.
    pub fn set_knob(&mut self, knob: &str, scale: f64) -> Result<(), ModelError> {
        let elements = self
            .descriptor
            .knob(knob)
            .cloned()
            .ok_or_else(|| ModelError::UnknownKnob(knob.to_string()))?;
        if elements.values().any(|coefficient| !(coefficient * scale).is_finite()) {
            return Err(ModelError::InvalidKnobScale {
                knob: knob.to_string(),
                scale,
            });
        }
        for (element, coefficient) in &elements {
            self.command(&format!("{element} = {};", coefficient * scale))?;
        }
        Ok(())
    }

    /// Sequence names as reported by the engine.
    pub fn get_sequences(&mut self) -> Result<Vec<String>, ModelError> {
        match self.exchange(Command::ListSequences)? {
            Response::SequenceNames { names } => Ok(names),
            other => Err(ModelError::UnexpectedResponse {
                command: "ListSequences",
                got: other.kind(),
            }),
        }
    }

    /// Execute one of the model's files.
    pub fn call(&mut self, file: &str) -> Result<(), ModelError> {
        self.expect_ack(Command::Call {
            file: file.to_string(),
        })
    }

    /// Execute a raw engine statement.
    pub fn command(&mut self, statement: &str) -> Result<(), ModelError> {
        self.expect_ack(Command::RawStatement {
            text: statement.to_string(),
        })
    }

    pub fn twiss(&mut self, request: &TableRequest) -> Result<(Table, Summary), ModelError> {
        let sequence = self.resolve_sequence(request.sequence.as_deref())?;
        let full_range = request.range_name().is_none();
        let args = self.table_args(&sequence, request, request.range_name().map(str::to_string));
        let result = self.expect_table(Command::Twiss(args))?;
        if full_range {
            self.states.mark_twiss_computed(&sequence);
        }
        Ok(result)
    }

    pub fn survey(&mut self, request: &TableRequest) -> Result<(Table, Summary), ModelError> {
        let sequence = self.resolve_sequence(request.sequence.as_deref())?;
        let args = self.table_args(&sequence, request, request.range_name().map(str::to_string));
        self.expect_table(Command::Survey(args))
    }

    /// Aperture over the full sequence or one of its declared ranges.
    ///
    /// Runs a full twiss first if none has completed for the sequence, and
    /// loads the sequence's aperture files once.
    pub fn aperture(&mut self, request: &TableRequest) -> Result<(Table, Summary), ModelError> {
        let sequence = self.resolve_sequence(request.sequence.as_deref())?;
        let range = match request.range_name() {
            Some(name) => Some(self.descriptor.range(&sequence, name).cloned().ok_or_else(|| {
                ModelError::UnknownRange {
                    sequence: sequence.clone(),
                    range: name.to_string(),
                    available: self.descriptor.list_ranges(&sequence).unwrap_or_default(),
                }
            })?),
            None => None,
        };

        let state = self.states.get(&sequence).unwrap_or_default();
        if !state.twiss_computed {
            log::debug!("[MODEL] Running prerequisite twiss for '{sequence}'");
            self.twiss(&TableRequest::twiss().sequence(sequence.as_str()))?;
        }
        if !state.aperture_files_loaded {
            let files = self
                .descriptor
                .sequence(&sequence)
                .map(|s| s.aperfiles.clone())
                .unwrap_or_default();
            for file in &files {
                self.call(file)?;
            }
            self.states.mark_aperture_files_loaded(&sequence);
        }

        // offsets only apply to a named range
        let offsets = match request.range_name() {
            Some(name) => match self.descriptor.offsets_file(&sequence, name).map(str::to_string) {
                Some(file) => Some(self.resolve_offsets(&file)?),
                None => None,
            },
            None => None,
        };

        let mut args = self.table_args(&sequence, request, range.map(|r| r.range));
        args.offsets = offsets.as_ref().map(|o| o.path().display().to_string());
        let result = self.expect_table(Command::Aperture(args));
        drop(offsets);
        result
    }

    /// Terminate the worker and wait for it within the teardown bound.
    pub fn close(mut self) -> Result<(), ModelError> {
        self.worker.shutdown()
    }

    fn resolve_sequence(&self, sequence: Option<&str>) -> Result<String, ModelError> {
        let sequence = match sequence.filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => self.descriptor.default.sequence.clone(),
        };
        if !self.has_sequence(&sequence) {
            return Err(ModelError::UnknownSequence(sequence));
        }
        Ok(sequence)
    }

    fn table_args(&self, sequence: &str, request: &TableRequest, range: Option<String>) -> TableArgs {
        let mut args = TableArgs::new(sequence, request.columns.clone());
        args.range = range;
        args.output = request.output.as_ref().map(|p| p.display().to_string());
        args
    }

    fn resolve_offsets(&self, file: &str) -> Result<OffsetsFile, ModelError> {
        if !self.store.is_remote() {
            return self
                .store
                .local_path(&self.name, file)
                .map(OffsetsFile::Local)
                .ok_or_else(|| {
                    StoreError::FileNotFound {
                        model: self.name.clone(),
                        file: file.to_string(),
                    }
                    .into()
                });
        }
        let bytes = self.store.fetch_file(&self.name, file)?;
        let path = std::env::temp_dir().join(format!("madx-offsets-{}.tfs", uuid::Uuid::new_v4()));
        fs::write(&path, bytes)?;
        Ok(OffsetsFile::Temporary(path))
    }

    fn exchange(&mut self, command: Command) -> Result<Response, ModelError> {
        log::debug!("[MODEL] Sending {}", command.kind());
        self.worker.send(&command)
    }

    fn expect_ack(&mut self, command: Command) -> Result<(), ModelError> {
        let kind = command.kind();
        match self.exchange(command)? {
            Response::Ack => Ok(()),
            other => Err(ModelError::UnexpectedResponse {
                command: kind,
                got: other.kind(),
            }),
        }
    }

    fn expect_table(&mut self, command: Command) -> Result<(Table, Summary), ModelError> {
        let kind = command.kind();
        match self.exchange(command)? {
            Response::TableResult { table, summary } => Ok((table, summary)),
            other => Err(ModelError::UnexpectedResponse {
                command: kind,
                got: other.kind(),
            }),
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("optics", &self.optics)
            .field("worker", &self.worker.id())
            .finish()
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        if let Err(e) = self.worker.shutdown() {
            log::error!("[MODEL] Teardown of '{}' failed: {e}", self.name);
        }
    }
}
