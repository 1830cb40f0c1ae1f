//! Core kiln library (task engine, sandbox, dispatch, tools, config).

pub mod config;
pub mod core;
pub mod dispatch;
pub mod logging;
pub mod rpc;
pub mod sandbox;
pub mod tasks;
pub mod tools;
