//! Task engine.
//!
//! - `model`: specs, results, and the on-disk store
//! - `hooks`: lifecycle callbacks
//! - `manager`: the bounded background scheduler
//! - `runner`: executes a spec file through the tool registry (sandbox entrypoint)

pub mod hooks;
pub mod manager;
pub mod model;
pub mod runner;

pub use hooks::TaskEvent;
pub use manager::{TaskManager, Work};
pub use model::{TaskError, TaskInfo, TaskResult, TaskSpec, TaskStatus, TaskStore};
