//! framefarm render node agent.
//!
//! The agent runs on every render instance. It pulls task scripts from the
//! work queue, renders them inside the project directory and uploads each
//! task's output to the artifact store, keeping the queue message hidden
//! from other nodes for as long as the task is in flight.
//!
//! ## Architecture
//!
//! - **Agent** ([`agent`]): startup, project fetch and the completion marker
//! - **Task loop** ([`runner`]): the active/push slots, visibility renewal
//!   and teardown
//! - **Supervision** ([`supervisor`]): render processes and uploads behind
//!   one pollable interface
//! - **Signals** ([`signals`]): cooperative cancellation through a `watch`
//!   channel

pub mod agent;
pub mod completion;
pub mod config;
pub mod error;
pub mod logging;
pub mod project;
pub mod runner;
pub mod sidefiles;
pub mod signals;
pub mod supervisor;
pub mod task;

pub use agent::{run_agent, AgentOutcome};
pub use completion::DoneMode;
pub use config::NodeConfig;
pub use error::NodeError;
pub use runner::{RunnerConfig, TaskRunner};
pub use sidefiles::SideFiles;
