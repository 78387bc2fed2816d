//! A deterministic in-memory simulator.
//!
//! [`MemSim`] has no design behind it: signal values only change through
//! scheduled stimuli, free-running clocks, and writes from tasks. That is
//! enough to replay a recorded event trace or to drive a testbench without a
//! real simulator.

use std::collections::{BTreeMap, HashMap};

use intmap::IntMap;

use crate::error::TbError;
use crate::sim_if::{Advance, Change, Progress, SignalId, SimAdapter, StepReport};

struct Clock {
    signal: SignalId,
    high: u64,
    low: u64,
    next_toggle: u64,
}

pub struct MemSim {
    now: u64,
    precision: i8,
    names: HashMap<String, SignalId>,
    signal_names: Vec<String>,
    values: IntMap<u64>,
    // first-write old value per signal, in write order
    deposits: Vec<(SignalId, u64)>,
    stimuli: BTreeMap<u64, Vec<(SignalId, u64)>>,
    clocks: Vec<Clock>,
    horizon: Option<u64>,
    terminate_at: Option<(u64, String)>,
}

impl Default for MemSim {
    fn default() -> Self {
        Self::new()
    }
}

impl MemSim {
    pub fn new() -> Self {
        Self {
            now: 0,
            precision: -9,
            names: HashMap::new(),
            signal_names: Vec::new(),
            values: IntMap::new(),
            deposits: Vec::new(),
            stimuli: BTreeMap::new(),
            clocks: Vec::new(),
            horizon: None,
            terminate_at: None,
        }
    }

    /// Build a simulator replaying `(time, signal, value)` events. Signals are
    /// created on first mention with an initial value of 0.
    pub fn from_trace<'a>(events: impl IntoIterator<Item = (u64, &'a str, u64)>) -> Self {
        let mut sim = Self::new();
        for (time, name, value) in events {
            let id = match sim.names.get(name) {
                Some(id) => *id,
                None => sim.add_signal(name, 0),
            };
            sim.drive(time, id, value);
        }
        sim
    }

    pub fn with_precision(mut self, precision: i8) -> Self {
        self.precision = precision;
        self
    }

    /// Nothing happens after `time`; advancing past it reports [`Progress::Exhausted`].
    pub fn with_horizon(mut self, time: u64) -> Self {
        self.horizon = Some(time);
        self
    }

    /// The simulator dies at `time`, as a crashing simulator would.
    pub fn terminate_at(mut self, time: u64, reason: &str) -> Self {
        self.terminate_at = Some((time, reason.to_string()));
        self
    }

    pub fn add_signal(&mut self, name: &str, init: u64) -> SignalId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = SignalId(self.signal_names.len());
        self.signal_names.push(name.to_string());
        self.names.insert(name.to_string(), id);
        self.values.insert(id.0 as u64, init);
        id
    }

    /// Schedule `signal` to take `value` at absolute `time`. Times in the past
    /// are applied at the next advance.
    pub fn drive(&mut self, time: u64, signal: SignalId, value: u64) {
        let time = time.max(self.now);
        self.stimuli.entry(time).or_default().push((signal, value));
    }

    /// Free-running clock starting low; the first rising edge is at `period - period / 2`.
    pub fn add_clock(&mut self, signal: SignalId, period: u64) {
        let high = (period / 2).max(1);
        let low = period.saturating_sub(high).max(1);
        self.clocks.push(Clock {
            signal,
            high,
            low,
            next_toggle: self.now + low,
        });
    }

    fn value(&self, signal: SignalId) -> Result<u64, TbError> {
        self.values
            .get(signal.0 as u64)
            .copied()
            .ok_or_else(|| TbError::UnknownSignal(signal.to_string()))
    }

    fn next_event(&self) -> Option<u64> {
        let stim = self.stimuli.keys().next().copied();
        let clk = self.clocks.iter().map(|c| c.next_toggle).min();
        match (stim, clk) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply a value, merging with any change already recorded for this step.
    fn apply(&mut self, changes: &mut Vec<Change>, signal: SignalId, value: u64) {
        let old = self.values.get(signal.0 as u64).copied().unwrap_or(0);
        self.values.insert(signal.0 as u64, value);
        match changes.iter_mut().find(|c| c.signal == signal) {
            Some(change) => change.new = value,
            None => changes.push(Change { signal, old, new: value }),
        }
    }

    fn flush_deposits(&mut self) -> Vec<Change> {
        let deposits = std::mem::take(&mut self.deposits);
        deposits
            .into_iter()
            .filter_map(|(signal, old)| {
                let new = self.values.get(signal.0 as u64).copied().unwrap_or(old);
                (old != new).then_some(Change { signal, old, new })
            })
            .collect()
    }
}

impl SimAdapter for MemSim {
    fn advance(&mut self, target: Advance) -> Result<Progress, TbError> {
        // writes settle first, as a delta step at the current time
        let changes = self.flush_deposits();
        if !changes.is_empty() {
            return Ok(Progress::Advanced(StepReport {
                time: self.now,
                changes,
            }));
        }

        let next = self.next_event();
        let time = match (target, next) {
            (Advance::NextChange, None) => return Ok(Progress::Exhausted),
            (Advance::NextChange, Some(t)) => t,
            (Advance::By(d), Some(t)) => t.min(self.now.saturating_add(d)),
            (Advance::By(d), None) => self.now.saturating_add(d),
        };
        if let Some((at, reason)) = &self.terminate_at {
            if time >= *at {
                return Err(TbError::SimulationTerminated {
                    time: self.now,
                    reason: reason.clone(),
                });
            }
        }
        if self.horizon.is_some_and(|h| time > h) {
            return Ok(Progress::Exhausted);
        }
        self.now = time;

        let mut changes = Vec::new();
        if let Some(stimuli) = self.stimuli.remove(&time) {
            for (signal, value) in stimuli {
                self.apply(&mut changes, signal, value);
            }
        }
        for i in 0..self.clocks.len() {
            if self.clocks[i].next_toggle != time {
                continue;
            }
            let signal = self.clocks[i].signal;
            let value = self.value(signal)? & 1 ^ 1;
            let clock = &mut self.clocks[i];
            clock.next_toggle += if value == 1 { clock.high } else { clock.low };
            self.apply(&mut changes, signal, value);
        }
        changes.retain(|c| c.old != c.new);
        Ok(Progress::Advanced(StepReport { time, changes }))
    }

    fn read(&self, signal: SignalId) -> Result<u64, TbError> {
        self.value(signal)
    }

    fn write(&mut self, signal: SignalId, value: u64) -> Result<(), TbError> {
        let old = self.value(signal)?;
        if !self.deposits.iter().any(|(s, _)| *s == signal) {
            self.deposits.push((signal, old));
        }
        self.values.insert(signal.0 as u64, value);
        Ok(())
    }

    fn signal_by_name(&self, name: &str) -> Result<SignalId, TbError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| TbError::UnknownSignal(name.to_string()))
    }

    fn signal_name(&self, signal: SignalId) -> Option<String> {
        self.signal_names.get(signal.0).cloned()
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn precision(&self) -> i8 {
        self.precision
    }
}
