pub use crate::assertion::AssertionStats;
pub use crate::config::TbConfig;
pub use crate::error::TbError;
pub use crate::executor::{JoinHandle, Sim, TaskId, TaskStatus};
pub use crate::mem_sim::MemSim;
pub use crate::obj::TbObj;
pub use crate::runner::Runner;
pub use crate::scheduler::{RunOutcome, Scheduler};
pub use crate::signal::SimObject;
pub use crate::sim_if::{SignalId, SimAdapter};
pub use crate::testbench::{clock, Monitor, Scoreboard};
pub use crate::trigger::{Fired, Trigger};
pub use crate::utils::clock_cycles;
pub use crate::value::Val;
pub use crate::{run_tests, tb_assert, TaskResult};
