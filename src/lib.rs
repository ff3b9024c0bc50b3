//! Drive an accelerator-lattice engine from an isolated worker.
//!
//! A [`Model`] loads a model descriptor from a [`store`], starts a worker
//! (child process or thread) that owns the engine, and turns high-level
//! operations (optics, knobs, twiss, survey, aperture) into commands on a
//! strict request/response channel.

pub mod engine;
pub mod error;
pub mod logger;
pub mod model;
pub mod settings;
pub mod store;
pub mod worker;

pub use error::ModelError;
pub use madx_model_types::{Summary, Table, Value};
pub use model::{Model, ModelDescriptor, ModelOptions, SequenceState, TableRequest};
pub use settings::Settings;
pub use store::{ModelStore, StoreConfig};
pub use worker::process_manager::WorkerMode;
