//! The event loop driving tasks against a simulator.
//!
//! [`Scheduler`] runs every runnable task until the ready queue is empty
//! (one delta cycle), then asks the [`SimAdapter`] to advance to the next
//! point where a registered trigger can fire, resolves the reported changes
//! and repeats. The loop ends when all root tasks are finished, a root task
//! fails, or nothing can ever wake the tasks that are left.

use futures::{future::FutureExt, task::noop_waker_ref};
use futures_channel::oneshot;
use std::{
    cell::RefCell,
    future::Future,
    rc::Rc,
    task::{Context, Poll},
};
use tracing::{debug, error};

use crate::assertion::AssertionStats;
use crate::config::TbConfig;
use crate::error::TbError;
use crate::executor::{Core, Sim, TaskFuture, TaskId, TaskStatus};
use crate::sim_if::{Progress, SimAdapter};
use crate::trigger::Events;
use crate::TaskResult;

/// A failed task, or a run-level error when `task` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task: Option<TaskId>,
    pub name: String,
    pub error: TbError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success,
    Failure(Vec<TaskFailure>),
    Deadlock { time: u64, waiting: Vec<String> },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failure(_) => 1,
            RunOutcome::Deadlock { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedState {
    Idle,
    Stepping,
    Draining,
    Finished(RunOutcome),
}

impl SchedState {
    fn name(&self) -> &'static str {
        match self {
            SchedState::Idle => "idle",
            SchedState::Stepping => "stepping",
            SchedState::Draining => "draining",
            SchedState::Finished(_) => "finished",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Draining -> Stepping transitions, one per resolved advance.
    pub cycles: u64,
    pub polls: u64,
    pub final_time: u64,
}

struct Root {
    task: TaskId,
    name: String,
    rx: oneshot::Receiver<TaskResult>,
    result: Option<TaskResult>,
}

pub struct Scheduler {
    core: Rc<RefCell<Core>>,
    state: SchedState,
    roots: Vec<Root>,
    stats: RunStats,
    time_limit: Option<u64>,
    max_deltas: u32,
}

impl Scheduler {
    pub fn new(adapter: Box<dyn SimAdapter>) -> Self {
        Self::with_config(adapter, &TbConfig::default())
    }

    pub fn with_config(adapter: Box<dyn SimAdapter>, config: &TbConfig) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core::new(adapter, config.seed))),
            state: SchedState::Idle,
            roots: Vec::new(),
            stats: RunStats::default(),
            time_limit: config.time_limit,
            max_deltas: config.max_deltas,
        }
    }

    pub fn sim(&self) -> Sim {
        Sim::new(self.core.clone())
    }

    /// Register a root task. The run succeeds once every root has finished successfully.
    pub fn spawn<F, Fut>(&mut self, name: &str, test: F) -> TaskId
    where
        F: FnOnce(Sim) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let future = test(self.sim()).boxed_local();
        self.spawn_boxed(name, future)
    }

    pub fn spawn_boxed(&mut self, name: &str, future: TaskFuture) -> TaskId {
        let (task, rx) = self.core.borrow_mut().spawn_root(name, future);
        self.roots.push(Root {
            task,
            name: name.to_string(),
            rx,
            result: None,
        });
        task
    }

    /// Record `(time, task)` for every poll, for replay comparisons.
    pub fn record_trace(&mut self, on: bool) {
        self.core.borrow_mut().trace = on.then(Vec::new);
    }

    pub fn trace(&self) -> Vec<(u64, TaskId)> {
        self.core.borrow().trace.clone().unwrap_or_default()
    }

    pub fn state(&self) -> &SchedState {
        &self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn now(&self) -> u64 {
        self.core.borrow().now
    }

    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.core.borrow().status(id)
    }

    /// How many times `id` was polled: its first run plus one per resumption.
    pub fn polls(&self, id: TaskId) -> u64 {
        self.core.borrow().tasks.get(id.0).map_or(0, |t| t.polls)
    }

    pub fn root_result(&self, id: TaskId) -> Option<&TaskResult> {
        self.roots
            .iter()
            .find(|r| r.task == id)
            .and_then(|r| r.result.as_ref())
    }

    pub fn assertion_stats(&self) -> Vec<AssertionStats> {
        self.core
            .borrow()
            .assertions
            .iter()
            .map(|a| a.get().clone())
            .collect()
    }

    pub fn into_adapter(self) -> Option<Box<dyn SimAdapter>> {
        let adapter = self.core.borrow_mut().take_adapter();
        adapter
    }

    pub fn run(&mut self) -> RunOutcome {
        if let SchedState::Finished(outcome) = &self.state {
            return outcome.clone();
        }
        let outcome = match self.run_loop() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(time = self.now(), error = %e, "run aborted");
                RunOutcome::Failure(vec![TaskFailure {
                    task: None,
                    name: "scheduler".to_string(),
                    error: e,
                }])
            }
        };
        let garbage = self.core.borrow_mut().tear_down();
        drop(garbage);
        self.stats.final_time = self.now();
        self.transition(SchedState::Finished(outcome.clone()));
        outcome
    }

    fn run_loop(&mut self) -> Result<RunOutcome, TbError> {
        self.transition(SchedState::Stepping);
        let mut deltas = 0u32;
        loop {
            if let Some(outcome) = self.settle()? {
                return Ok(outcome);
            }

            self.transition(SchedState::Draining);
            let (now, target) = {
                let core = self.core.borrow();
                (core.now, core.waits.next_advance(core.now))
            };
            let Some(target) = target else {
                return Ok(self.deadlock());
            };
            let progress = self.core.borrow_mut().adapter()?.advance(target)?;
            let report = match progress {
                Progress::Advanced(report) => report,
                Progress::Exhausted => return Ok(self.deadlock()),
            };
            if report.time < now {
                return Err(TbError::Invariant(format!(
                    "simulator moved time backwards: {} -> {}",
                    now, report.time
                )));
            }
            if report.time == now {
                deltas += 1;
                if deltas > self.max_deltas {
                    return Err(TbError::DeltaCycleLimit {
                        time: now,
                        max: self.max_deltas,
                    });
                }
            } else {
                deltas = 0;
            }
            if let Some(limit) = self.time_limit {
                if report.time > limit {
                    return Err(TbError::TimeLimitExceeded { limit });
                }
            }

            let woken = {
                let mut core = self.core.borrow_mut();
                core.now = report.time;
                core.wake(&Events {
                    time: report.time,
                    changes: &report.changes,
                    completed: None,
                })?
            };
            debug!(time = report.time, changes = report.changes.len(), woken, "resolved");
            self.stats.cycles += 1;
            self.transition(SchedState::Stepping);
        }
    }

    /// Run until no task is runnable. Stops early on a failure; success is
    /// only decided once the instant is drained.
    fn settle(&mut self) -> Result<Option<RunOutcome>, TbError> {
        loop {
            if let Some(failure @ RunOutcome::Failure(_)) = self.check_roots() {
                return Ok(Some(failure));
            }
            let next = self.core.borrow_mut().next_ready();
            match next {
                Some(id) => self.poll_task(id)?,
                None => return Ok(self.check_roots()),
            }
        }
    }

    fn poll_task(&mut self, id: TaskId) -> Result<(), TbError> {
        let mut future = {
            let mut core = self.core.borrow_mut();
            let now = core.now;
            let entry = core
                .tasks
                .get_mut(id.0)
                .ok_or_else(|| TbError::Invariant(format!("scheduled unknown {}", id)))?;
            if entry.status != TaskStatus::Runnable {
                // cancelled while queued
                return Ok(());
            }
            let future = entry.future.take().ok_or_else(|| {
                TbError::Invariant(format!("{} scheduled without a continuation", id))
            })?;
            entry.polls += 1;
            core.current = Some(id);
            if let Some(trace) = core.trace.as_mut() {
                trace.push((now, id));
            }
            future
        };

        let poll = future
            .as_mut()
            .poll(&mut Context::from_waker(noop_waker_ref()));
        self.stats.polls += 1;

        let mut core = self.core.borrow_mut();
        core.current = None;
        match (poll, core.status(id)) {
            (_, Some(TaskStatus::Cancelled)) => Ok(()),
            (Poll::Ready(result), _) => core.complete(id, result),
            (Poll::Pending, Some(TaskStatus::Suspended)) => {
                if let Some(entry) = core.tasks.get_mut(id.0) {
                    entry.future = Some(future);
                }
                Ok(())
            }
            (Poll::Pending, Some(TaskStatus::Runnable)) => {
                let error = core.violation.take().unwrap_or_else(|| {
                    TbError::Invariant(format!("{} returned Pending without awaiting a trigger", id))
                });
                core.complete(id, Err(error))
            }
            (Poll::Pending, other) => Err(TbError::Invariant(format!(
                "{} is {:?} after being polled",
                id, other
            ))),
        }
    }

    fn check_roots(&mut self) -> Option<RunOutcome> {
        let mut failures = self.core.borrow().fatal.clone();
        let mut all_done = true;
        for root in self.roots.iter_mut() {
            if root.result.is_none() {
                if let Ok(Some(result)) = root.rx.try_recv() {
                    root.result = Some(result);
                }
            }
            match &root.result {
                None => all_done = false,
                Some(Ok(_)) => {}
                Some(Err(e)) => failures.push(TaskFailure {
                    task: Some(root.task),
                    name: root.name.clone(),
                    error: e.clone(),
                }),
            }
        }
        if !failures.is_empty() {
            Some(RunOutcome::Failure(failures))
        } else if all_done {
            Some(RunOutcome::Success)
        } else {
            None
        }
    }

    fn deadlock(&self) -> RunOutcome {
        let core = self.core.borrow();
        let waiting = core.describe_waiting();
        error!(time = core.now, waiting = ?waiting, "deadlock: no simulator event can wake the remaining tasks");
        RunOutcome::Deadlock {
            time: core.now,
            waiting,
        }
    }

    fn transition(&mut self, next: SchedState) {
        debug!(time = self.now(), from = self.state.name(), to = next.name(), "scheduler state");
        self.state = next;
    }
}
