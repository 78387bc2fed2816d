//! The boundary between the scheduler and a simulator.
//!
//! A simulator is anything implementing [`SimAdapter`]: it holds the design's
//! signal values, applies writes, and advances simulation time on request,
//! reporting every signal change it observed on the way.

use std::fmt;

use crate::error::TbError;

/// Handle of a signal inside the simulated design.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub usize);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig#{}", self.0)
    }
}

/// How far the scheduler asks the simulator to go.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Run until the next signal change, however far away.
    NextChange,
    /// Run until `n` steps have elapsed or a signal changes, whichever is first.
    By(u64),
}

/// One signal transition observed during an advance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub signal: SignalId,
    pub old: u64,
    pub new: u64,
}

/// What an advance produced: the new time cursor and the changes seen since
/// the previous cursor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    pub time: u64,
    pub changes: Vec<Change>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Advanced(StepReport),
    /// No further events are possible; the simulation has run dry.
    Exhausted,
}

pub trait SimAdapter {
    /// Move simulation time forward. Must never report a time earlier than
    /// [`now`](SimAdapter::now). Fails with [`TbError::SimulationTerminated`]
    /// when the underlying simulator ends.
    fn advance(&mut self, target: Advance) -> Result<Progress, TbError>;
    fn read(&self, signal: SignalId) -> Result<u64, TbError>;
    /// Deposit a value. Reads see it at once; the change itself is reported
    /// by the next [`advance`](SimAdapter::advance).
    fn write(&mut self, signal: SignalId, value: u64) -> Result<(), TbError>;
    fn signal_by_name(&self, name: &str) -> Result<SignalId, TbError>;
    fn now(&self) -> u64;
    fn signal_name(&self, _signal: SignalId) -> Option<String> {
        None
    }
    /// Power-of-ten exponent of one simulation step in seconds.
    fn precision(&self) -> i8 {
        -9
    }
    fn log(&self, time: u64, msg: &str) {
        tracing::info!(target: "tbsched::sim", time, "{}", msg);
    }
}

pub fn time_scale(unit: &str) -> Result<i8, TbError> {
    match unit {
        "fs" => Ok(-15),
        "ps" => Ok(-12),
        "ns" => Ok(-9),
        "us" => Ok(-6),
        "ms" => Ok(-3),
        "sec" | "s" => Ok(0),
        "step" | "steps" => Err(TbError::InvalidTimeUnit(
            "steps are not a physical unit, use timer_steps()".to_string(),
        )),
        _ => Err(TbError::InvalidTimeUnit(unit.to_string())),
    }
}

/// Convert a physical time into whole simulation steps.
pub fn to_steps(time: f64, unit: &str, precision: i8) -> Result<u64, TbError> {
    let steps = ldexp10(time, i32::from(time_scale(unit)?) - i32::from(precision));
    if steps >= u64::MAX as f64 {
        Err(TbError::TimeOutOfRange {
            time,
            unit: unit.to_string(),
            precision,
        })
    } else if steps >= 0.0 && steps % 1.0 == 0.0 {
        Ok(steps as u64)
    } else {
        Err(TbError::TimeRounding {
            time,
            unit: unit.to_string(),
            precision,
        })
    }
}

/// Convert simulation steps into a physical time. Loses precision for very
/// large step counts, so keep it to reporting.
pub fn from_steps(steps: u64, unit: &str, precision: i8) -> Result<f64, TbError> {
    Ok(ldexp10(steps as f64, i32::from(precision) - i32::from(time_scale(unit)?)))
}

fn ldexp10(frac: f64, exp: i32) -> f64 {
    // Like math.ldexp, but base 10. Dividing keeps small exponents exact.
    if exp >= 0 {
        frac * 10f64.powi(exp)
    } else {
        frac / 10f64.powi(-exp)
    }
}
