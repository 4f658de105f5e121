#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod bridge;
mod context;
mod core;
pub mod engine;
mod error;
#[cfg(feature = "logging")]
pub mod log;
mod store;
pub mod trace;

pub use crate::bridge::{Bridge, DEFAULT_TASK_NAME, IntoOutcome, PendingValue, Spawned};
pub use crate::context::RequestContext;
pub use crate::core::{Environment, MODE_VAR, Mode};
pub use crate::engine::{Engine, Task, TaskRef};
pub use crate::error::{BridgeError, TaskError};
pub use crate::store::{ARGUMENTS_KEY, ContextTaskStore, TaskSet, TaskStore};
