//! Isolated model worker.
//!
//! The engine runs in its own execution unit (child process or thread) for:
//! - Isolation: engine state and crashes never touch the controller
//! - Serialization: one command in flight, served strictly in order

pub mod channel;
pub mod ipc_types;
pub mod process_manager;
pub mod shutdown;
pub mod worker_main;
