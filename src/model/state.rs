//! Per-sequence bookkeeping owned by the controller.

use std::collections::BTreeMap;

/// What has already happened to one sequence in the current worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    /// A full-range twiss has completed.
    pub twiss_computed: bool,
    /// The sequence's aperture files have been called.
    pub aperture_files_loaded: bool,
}

/// One [`SequenceState`] per declared sequence, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SequenceStates {
    states: BTreeMap<String, SequenceState>,
}

impl SequenceStates {
    pub fn new<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: sequences
                .into_iter()
                .map(|s| (s.into(), SequenceState::default()))
                .collect(),
        }
    }

    pub fn get(&self, sequence: &str) -> Option<SequenceState> {
        self.states.get(sequence).copied()
    }

    pub fn mark_twiss_computed(&mut self, sequence: &str) {
        if let Some(state) = self.states.get_mut(sequence) {
            state.twiss_computed = true;
        }
    }

    /// Aperture files may only be marked loaded after a full twiss.
    pub fn mark_aperture_files_loaded(&mut self, sequence: &str) {
        if let Some(state) = self.states.get_mut(sequence) {
            debug_assert!(state.twiss_computed, "aperture files loaded before twiss");
            state.aperture_files_loaded = true;
        }
    }
}
