//! Wire types shared by the model controller and its worker.
//!
//! Every value here crosses the command channel as one JSON object per line,
//! so all of them derive `Serialize`/`Deserialize`.

pub mod command;
pub mod table;

pub use command::{Command, Response, TableArgs};
pub use table::{Summary, Table, Value};
