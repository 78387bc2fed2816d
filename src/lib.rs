//! Cooperative, event-driven scheduler for writing HDL testbenches as async Rust.
//!
//! Tests are `async` functions taking a [`Sim`] handle. They suspend on
//! [`Trigger`]s (signal edges, timers, combinations of those, or another
//! task finishing) and the [`Scheduler`] resumes them in simulation order,
//! driving any simulator that implements [`SimAdapter`].

pub mod assertion;
pub mod config;
pub mod error;
pub mod executor;
pub mod junit;
pub mod mem_sim;
pub mod obj;
pub mod prelude;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod sim_if;
pub mod testbench;
pub mod trigger;
pub mod utils;
pub mod value;

pub use config::TbConfig;
pub use error::{ConfigError, ReportError, TbError};
pub use executor::{JoinHandle, Sim, TaskId, TaskStatus, Wait};
pub use mem_sim::MemSim;
pub use runner::Runner;
pub use scheduler::{RunOutcome, RunStats, SchedState, Scheduler, TaskFailure};
pub use sim_if::{Advance, Change, Progress, SignalId, SimAdapter, StepReport};
pub use trigger::{EdgeKind, Fired, Policy, Trigger};
pub use value::Val;

/// What every task resolves to.
pub type TaskResult<T = Val> = Result<T, TbError>;
