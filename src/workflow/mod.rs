pub mod activities;
pub mod engine;
pub mod photo_upload;
pub mod store;
pub mod worker;

pub use engine::{RetryPolicy, WorkflowEngine};
pub use store::{ExecutionState, StartOutcome};
pub use worker::Worker;
