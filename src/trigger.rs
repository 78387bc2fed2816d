use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::executor::TaskId;
use crate::sim_if::{Advance, Change, SignalId};

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum EdgeKind {
    Any,
    Rising,
    Falling,
}

impl EdgeKind {
    /// Edges are taken on bit 0, so multi-bit signals behave like their LSB.
    pub fn matches(self, old: u64, new: u64) -> bool {
        match self {
            EdgeKind::Any => old != new,
            EdgeKind::Rising => old & 1 == 0 && new & 1 == 1,
            EdgeKind::Falling => old & 1 == 1 && new & 1 == 0,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Policy {
    Any,
    All,
}

/// A condition a task suspends on.
///
/// Triggers are plain values compared structurally; awaiting one goes through
/// [`Sim::wait`](crate::executor::Sim::wait) or one of its shorthands.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Trigger {
    Edge(SignalId, EdgeKind),
    /// Relative delay in simulation steps, counted from the moment of suspension.
    Timer(u64),
    Combined(Vec<Trigger>, Policy),
    /// Completion of another task.
    Join(TaskId),
}

impl Trigger {
    pub fn rising_edge(signal: SignalId) -> Self {
        Trigger::Edge(signal, EdgeKind::Rising)
    }
    pub fn falling_edge(signal: SignalId) -> Self {
        Trigger::Edge(signal, EdgeKind::Falling)
    }
    pub fn edge(signal: SignalId) -> Self {
        Trigger::Edge(signal, EdgeKind::Any)
    }
    pub fn timer(steps: u64) -> Self {
        Trigger::Timer(steps)
    }
    pub fn any(triggers: Vec<Trigger>) -> Self {
        Trigger::Combined(triggers, Policy::Any)
    }
    pub fn all(triggers: Vec<Trigger>) -> Self {
        Trigger::Combined(triggers, Policy::All)
    }
    pub fn join(task: TaskId) -> Self {
        Trigger::Join(task)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Edge(sig, EdgeKind::Rising) => write!(f, "RisingEdge({})", sig),
            Trigger::Edge(sig, EdgeKind::Falling) => write!(f, "FallingEdge({})", sig),
            Trigger::Edge(sig, EdgeKind::Any) => write!(f, "Edge({})", sig),
            Trigger::Timer(steps) => write!(f, "Timer({})", steps),
            Trigger::Join(task) => write!(f, "Join({})", task),
            Trigger::Combined(children, policy) => {
                let sep = match policy {
                    Policy::Any => " | ",
                    Policy::All => " & ",
                };
                write!(f, "(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Indices of the top-level children of a combined trigger that fired in the
/// resolution pass that woke the task. Empty for non-combined triggers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fired(pub Vec<usize>);

impl Fired {
    pub fn contains(&self, child: usize) -> bool {
        self.0.contains(&child)
    }
}

/// Everything a resolution pass looks at.
pub(crate) struct Events<'a> {
    pub time: u64,
    pub changes: &'a [Change],
    pub completed: Option<TaskId>,
}

impl Events<'_> {
    pub fn at(time: u64) -> Self {
        Events { time, changes: &[], completed: None }
    }
}

/// A trigger bound to one registration: timers carry absolute deadlines and
/// `All` remembers which children already fired.
#[derive(Debug)]
enum Armed {
    Edge(SignalId, EdgeKind),
    Timer { deadline: u64 },
    Join { task: TaskId, done: bool },
    Any(Vec<Armed>),
    All(Vec<(Armed, bool)>),
}

impl Armed {
    fn arm(trigger: &Trigger, now: u64, finished: &dyn Fn(TaskId) -> bool) -> Self {
        match trigger {
            Trigger::Edge(sig, kind) => Armed::Edge(*sig, *kind),
            Trigger::Timer(delay) => Armed::Timer { deadline: now.saturating_add(*delay) },
            Trigger::Join(task) => Armed::Join { task: *task, done: finished(*task) },
            Trigger::Combined(children, Policy::Any) => {
                Armed::Any(children.iter().map(|c| Armed::arm(c, now, finished)).collect())
            }
            Trigger::Combined(children, Policy::All) => Armed::All(
                children
                    .iter()
                    .map(|c| (Armed::arm(c, now, finished), false))
                    .collect(),
            ),
        }
    }

    fn poll(&mut self, ev: &Events) -> bool {
        match self {
            Armed::Edge(sig, kind) => ev
                .changes
                .iter()
                .any(|c| c.signal == *sig && kind.matches(c.old, c.new)),
            Armed::Timer { deadline } => ev.time >= *deadline,
            Armed::Join { task, done } => {
                if ev.completed == Some(*task) {
                    *done = true;
                }
                *done
            }
            // every child is polled so nested `All`s latch
            Armed::Any(children) => children
                .iter_mut()
                .map(|c| c.poll(ev))
                .fold(false, |acc, hit| acc | hit),
            Armed::All(children) => {
                for (child, latched) in children.iter_mut() {
                    if !*latched && child.poll(ev) {
                        *latched = true;
                    }
                }
                children.iter().all(|(_, latched)| *latched)
            }
        }
    }

    /// Top-level poll that also reports which children fired.
    fn fire(&mut self, ev: &Events) -> Option<Fired> {
        match self {
            Armed::Any(children) => {
                let hits: Vec<usize> = children
                    .iter_mut()
                    .enumerate()
                    .filter_map(|(i, c)| c.poll(ev).then_some(i))
                    .collect();
                (!hits.is_empty()).then_some(Fired(hits))
            }
            Armed::All(children) => {
                let n = children.len();
                self.poll(ev).then(|| Fired((0..n).collect()))
            }
            _ => self.poll(ev).then(Fired::default),
        }
    }

    fn earliest_deadline(&self) -> Option<u64> {
        match self {
            Armed::Timer { deadline } => Some(*deadline),
            Armed::Edge(..) | Armed::Join { .. } => None,
            Armed::Any(children) => children.iter().filter_map(Armed::earliest_deadline).min(),
            Armed::All(children) => children
                .iter()
                .filter(|(_, latched)| !latched)
                .filter_map(|(c, _)| c.earliest_deadline())
                .min(),
        }
    }

    fn wants_edge(&self) -> bool {
        match self {
            Armed::Edge(..) => true,
            Armed::Timer { .. } | Armed::Join { .. } => false,
            Armed::Any(children) => children.iter().any(Armed::wants_edge),
            Armed::All(children) => children
                .iter()
                .any(|(c, latched)| !latched && c.wants_edge()),
        }
    }
}

#[derive(Debug)]
struct Registration {
    task: TaskId,
    seq: u64,
    armed: Armed,
}

/// A task made runnable by a resolution pass.
#[derive(Debug)]
pub(crate) struct Firing {
    pub task: TaskId,
    pub trigger: Trigger,
    pub fired: Fired,
}

/// Trigger -> waiting tasks, FIFO per trigger. Every registration carries a
/// global sequence number so firings across triggers resume in the order the
/// tasks suspended.
#[derive(Default)]
pub(crate) struct WaitMap {
    waits: HashMap<Trigger, VecDeque<Registration>>,
    next_seq: u64,
}

pub(crate) enum Armament {
    /// Already satisfied; the task carries on without suspending.
    Ready(Fired),
    Parked,
}

impl WaitMap {
    pub fn register(
        &mut self,
        task: TaskId,
        trigger: &Trigger,
        now: u64,
        finished: &dyn Fn(TaskId) -> bool,
    ) -> Armament {
        let mut armed = Armed::arm(trigger, now, finished);
        if let Some(fired) = armed.fire(&Events::at(now)) {
            return Armament::Ready(fired);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waits
            .entry(trigger.clone())
            .or_default()
            .push_back(Registration { task, seq, armed });
        Armament::Parked
    }

    /// Drop `task`'s registration under `trigger`. Returns false if there was none.
    pub fn remove(&mut self, task: TaskId, trigger: &Trigger) -> bool {
        let Some(regs) = self.waits.get_mut(trigger) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| r.task != task);
        let removed = regs.len() != before;
        if regs.is_empty() {
            self.waits.remove(trigger);
        }
        removed
    }

    /// Remove and return every registration satisfied by `ev`, oldest first.
    pub fn resolve(&mut self, ev: &Events) -> Vec<Firing> {
        let mut fired = Vec::new();
        for (trigger, regs) in self.waits.iter_mut() {
            regs.retain_mut(|r| match r.armed.fire(ev) {
                Some(hit) => {
                    fired.push((r.seq, Firing { task: r.task, trigger: trigger.clone(), fired: hit }));
                    false
                }
                None => true,
            });
        }
        self.waits.retain(|_, regs| !regs.is_empty());
        fired.sort_by_key(|(seq, _)| *seq);
        fired.into_iter().map(|(_, f)| f).collect()
    }

    /// What to ask the simulator for next, or `None` if nothing it can do
    /// will ever satisfy a registration.
    pub fn next_advance(&self, now: u64) -> Option<Advance> {
        let regs = self.waits.values().flatten();
        let deadline = regs.clone().filter_map(|r| r.armed.earliest_deadline()).min();
        match deadline {
            Some(d) => Some(Advance::By(d.saturating_sub(now))),
            None if regs.into_iter().any(|r| r.armed.wants_edge()) => Some(Advance::NextChange),
            None => None,
        }
    }

    /// Tasks registered under exactly this trigger, in FIFO order.
    pub fn waiters(&self, trigger: &Trigger) -> Vec<TaskId> {
        self.waits
            .get(trigger)
            .map(|regs| regs.iter().map(|r| r.task).collect())
            .unwrap_or_default()
    }

    /// `(task, trigger)` for every registration, oldest first.
    pub fn registrations(&self) -> Vec<(TaskId, Trigger)> {
        let mut all: Vec<(u64, TaskId, Trigger)> = self
            .waits
            .iter()
            .flat_map(|(t, regs)| regs.iter().map(move |r| (r.seq, r.task, t.clone())))
            .collect();
        all.sort_by_key(|(seq, ..)| *seq);
        all.into_iter().map(|(_, task, t)| (task, t)).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waits.values().map(VecDeque::len).sum()
    }

    pub fn clear(&mut self) {
        self.waits.clear();
    }
}
