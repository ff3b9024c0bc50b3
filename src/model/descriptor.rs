//! Declarative model description.
//!
//! Loaded once per controller from the model store and read-only afterwards.
//! See [`ModelDescriptor`] for the JSON layout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("malformed model descriptor: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("default {kind} '{name}' is not declared")]
    MissingDefault { kind: &'static str, name: String },
    #[error("optics '{optics}' references undeclared {kind} '{name}'")]
    DanglingReference {
        optics: String,
        kind: &'static str,
        name: String,
    },
    #[error("range '{range}' of sequence '{sequence}' references undeclared offsets entry {offsets}")]
    MissingOffsets {
        sequence: String,
        range: String,
        offsets: u32,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Defaults {
    pub sequence: String,
    pub optics: String,
}

/// A named sub-interval of a sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RangeSpec {
    /// Engine range expression, e.g. `#s/#e` or `ip1/ip2`.
    pub range: String,
    /// Key into the sequence's offsets table. 0 = no offsets.
    #[serde(default)]
    pub offsets: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SequenceSpec {
    #[serde(default)]
    pub aperfiles: Vec<String>,
    #[serde(default)]
    pub ranges: BTreeMap<String, RangeSpec>,
    #[serde(default)]
    pub offsets: BTreeMap<u32, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OpticsSpec {
    /// Strength files, called in order.
    #[serde(default)]
    pub strengths: Vec<String>,
    /// Knob name -> on (scale 1.0) / off (scale 0.0).
    #[serde(default)]
    pub knobs: BTreeMap<String, bool>,
    /// Beam names, keys of [`ModelDescriptor::beams`].
    #[serde(default)]
    pub beams: Vec<String>,
}

/// Everything the controller knows about a model before the engine runs.
///
/// ```json
/// {
///   "sequence": "lebt.seq",
///   "default": {"sequence": "s1", "optics": "A"},
///   "dbdirs": ["db"],
///   "sequences": {"s1": {"aperfiles": ["s1.aper"],
///                        "ranges": {"arc": {"range": "qp[1]/sb", "offsets": 1}},
///                        "offsets": {"1": "s1.offsets.tfs"}}},
///   "optics": {"A": {"strengths": ["a.str"], "knobs": {"k1": true}, "beams": ["b1"]}},
///   "beams": {"b1": "beam, particle=proton, sequence=s1;"},
///   "knobs": {"k1": {"qp_k1": 0.5}}
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Base sequence definition file, called once at construction.
    pub sequence: String,
    pub default: Defaults,
    /// Candidate directories for model files, relative to the store root.
    #[serde(default)]
    pub dbdirs: Vec<String>,
    #[serde(default)]
    pub sequences: BTreeMap<String, SequenceSpec>,
    #[serde(default)]
    pub optics: BTreeMap<String, OpticsSpec>,
    #[serde(default)]
    pub beams: BTreeMap<String, String>,
    /// Knob name -> element name -> coefficient.
    #[serde(default)]
    pub knobs: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ModelDescriptor {
    /// Parse and validate a descriptor document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let descriptor: ModelDescriptor = serde_json::from_slice(bytes)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check that every cross reference resolves.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !self.optics.contains_key(&self.default.optics) {
            return Err(DescriptorError::MissingDefault {
                kind: "optics",
                name: self.default.optics.clone(),
            });
        }
        if !self.sequences.contains_key(&self.default.sequence) {
            return Err(DescriptorError::MissingDefault {
                kind: "sequence",
                name: self.default.sequence.clone(),
            });
        }
        for (name, optics) in &self.optics {
            if let Some(knob) = optics.knobs.keys().find(|k| !self.knobs.contains_key(*k)) {
                return Err(DescriptorError::DanglingReference {
                    optics: name.clone(),
                    kind: "knob",
                    name: knob.clone(),
                });
            }
            if let Some(beam) = optics.beams.iter().find(|b| !self.beams.contains_key(*b)) {
                return Err(DescriptorError::DanglingReference {
                    optics: name.clone(),
                    kind: "beam",
                    name: beam.clone(),
                });
            }
        }
        for (seq_name, seq) in &self.sequences {
            for (range_name, range) in &seq.ranges {
                if range.offsets != 0 && !seq.offsets.contains_key(&range.offsets) {
                    return Err(DescriptorError::MissingOffsets {
                        sequence: seq_name.clone(),
                        range: range_name.clone(),
                        offsets: range.offsets,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceSpec> {
        self.sequences.get(name)
    }

    pub fn optics(&self, name: &str) -> Option<&OpticsSpec> {
        self.optics.get(name)
    }

    pub fn knob(&self, name: &str) -> Option<&BTreeMap<String, f64>> {
        self.knobs.get(name)
    }

    pub fn range(&self, sequence: &str, range: &str) -> Option<&RangeSpec> {
        self.sequences.get(sequence)?.ranges.get(range)
    }

    pub fn list_ranges(&self, sequence: &str) -> Option<Vec<String>> {
        self.sequences
            .get(sequence)
            .map(|s| s.ranges.keys().cloned().collect())
    }

    /// Offsets file for a range, if the range declares one.
    pub fn offsets_file(&self, sequence: &str, range: &str) -> Option<&str> {
        let seq = self.sequences.get(sequence)?;
        let spec = seq.ranges.get(range)?;
        if spec.offsets == 0 {
            return None;
        }
        seq.offsets.get(&spec.offsets).map(String::as_str)
    }
}
