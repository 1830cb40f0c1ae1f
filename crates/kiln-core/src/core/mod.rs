//! Process-level building blocks.
//!
//! - `interrupt`: Ctrl+C / terminate flags shared with the task monitor
//! - `project`: on-disk layout of a project's `.kiln` directory
//! - `session`: session ids and sandbox marker variables

pub mod interrupt;
pub mod project;
pub mod session;
