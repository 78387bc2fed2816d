//! Error types for tasks, the scheduler loop, configuration and reporting.

use crate::executor::TaskId;

/// Errors a task can fail with, and the run-level errors the scheduler
/// reports when a simulation cannot continue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TbError {
    /// A test-level check failed.
    #[error("assertion failed at t={time}: {message}")]
    AssertionFailed {
        /// Simulation time of the failed check.
        time: u64,
        /// What was checked.
        message: String,
    },

    /// The task failed explicitly.
    #[error("{0}")]
    Failed(String),

    /// The awaited task was cancelled before it finished.
    #[error("{task} was cancelled")]
    Cancelled {
        /// The cancelled task.
        task: TaskId,
    },

    /// Cancelling a task tree found a descendant whose failure nobody observed.
    #[error("cancelling {task} surfaced failure of {child}: {source}")]
    CancellationPropagation {
        /// The task that was cancelled.
        task: TaskId,
        /// The descendant that had failed.
        child: TaskId,
        /// The descendant's failure.
        source: Box<TbError>,
    },

    /// A condition guarded by a timeout did not occur in time.
    #[error("timed out at t={time} waiting for {trigger}")]
    Timeout {
        /// Simulation time when the deadline fired.
        time: u64,
        /// The condition that was awaited.
        trigger: String,
    },

    /// Tasks are suspended but no simulator event can ever wake them.
    #[error("deadlock at t={time}: {} task(s) waiting forever", .waiting.len())]
    Deadlock {
        /// Simulation time when the deadlock was detected.
        time: u64,
        /// `task -> trigger` descriptions of every stuck task.
        waiting: Vec<String>,
    },

    /// The simulator ended underneath the scheduler.
    #[error("simulation terminated at t={time}: {reason}")]
    SimulationTerminated {
        /// Last simulation time reached.
        time: u64,
        /// Reason given by the simulator adapter.
        reason: String,
    },

    /// The simulation passed the configured time limit.
    #[error("time limit exceeded: {limit}")]
    TimeLimitExceeded {
        /// The configured limit in simulation steps.
        limit: u64,
    },

    /// Too many consecutive advances did not move simulation time.
    #[error("delta cycle limit exceeded at t={time} (max {max} deltas)")]
    DeltaCycleLimit {
        /// Simulation time where the limit was hit.
        time: u64,
        /// Configured maximum.
        max: u32,
    },

    /// A scheduler invariant was violated. Always a programming error.
    #[error("scheduler invariant violated: {0}")]
    Invariant(String),

    /// No signal with this name exists in the design.
    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    /// A time unit string was not recognised.
    #[error("invalid time unit '{0}'")]
    InvalidTimeUnit(String),

    /// A time value cannot be expressed in whole simulation steps.
    #[error("can't convert {time} {unit} to sim steps without rounding (precision 1e{precision} s)")]
    TimeRounding {
        /// The requested time.
        time: f64,
        /// The requested unit.
        unit: String,
        /// The simulator precision exponent.
        precision: i8,
    },

    /// A time value needs more simulation steps than fit in a `u64`.
    #[error("{time} {unit} is out of range at precision 1e{precision} s")]
    TimeOutOfRange {
        time: f64,
        unit: String,
        precision: i8,
    },

    /// A signal value is wider than the type it was read as.
    #[error("value {value:#x} of {signal} does not fit in {bits} bits")]
    ValueOverflow {
        signal: String,
        value: u64,
        bits: u32,
    },
}

/// Errors raised while loading a [`TbConfig`](crate::config::TbConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A value is out of its permitted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while writing test reports.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// The report file could not be created.
    #[error("failed to create report: {0}")]
    Io(#[from] std::io::Error),

    /// The XML writer failed.
    #[error("failed to write junit xml: {0}")]
    Xml(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assertion_failed_display() {
        let e = TbError::AssertionFailed {
            time: 40,
            message: "q != d".into(),
        };
        assert_eq!(e.to_string(), "assertion failed at t=40: q != d");
    }

    #[test]
    fn deadlock_display_counts_waiters() {
        let e = TbError::Deadlock {
            time: 7,
            waiting: vec!["a".into(), "b".into()],
        };
        assert_eq!(e.to_string(), "deadlock at t=7: 2 task(s) waiting forever");
    }

    #[test]
    fn cancellation_propagation_display() {
        let e = TbError::CancellationPropagation {
            task: TaskId(1),
            child: TaskId(2),
            source: Box::new(TbError::Failed("boom".into())),
        };
        assert_eq!(
            e.to_string(),
            "cancelling task#1 surfaced failure of task#2: boom"
        );
    }

    #[test]
    fn config_parse_display() {
        let e = ConfigError::Parse("expected table".into());
        assert_eq!(e.to_string(), "failed to parse configuration: expected table");
    }
}
