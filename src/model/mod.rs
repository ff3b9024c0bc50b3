pub mod controller;
pub mod descriptor;
pub mod state;

pub use controller::{Model, ModelOptions, TableRequest};
pub use descriptor::ModelDescriptor;
pub use state::SequenceState;
