//! Worker runtime: command queues, subworkers, and the shared status board.

pub mod runtime;
pub mod status;

pub use runtime::{spawn, EventTranslator, Worker, WorkerCommand, WorkerRuntime};
pub use status::{StatusBoard, WorkerStatus};
