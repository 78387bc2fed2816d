use futures::future::{FutureExt, LocalBoxFuture};
use futures_channel::oneshot;
use intmap::IntMap;
use queues::{IsQueue, Queue};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};
use tracing::{debug, warn};

use crate::assertion::AssertionStats;
use crate::error::TbError;
use crate::obj::TbObj;
use crate::scheduler::TaskFailure;
use crate::signal::SimObject;
use crate::sim_if::{self, SignalId, SimAdapter};
use crate::trigger::{Armament, Events, Fired, Trigger, WaitMap};
use crate::TaskResult;

pub type TaskFuture = LocalBoxFuture<'static, TaskResult>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Runnable,
    Suspended,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

pub(crate) struct TaskEntry {
    pub(crate) name: String,
    pub(crate) status: TaskStatus,
    // taken out while the task is being polled
    pub(crate) future: Option<TaskFuture>,
    pub(crate) awaiting: Option<Trigger>,
    // last trigger that resumed the task, for failure reports
    pub(crate) last_trigger: Option<Trigger>,
    pub(crate) fired: Option<Fired>,
    pub(crate) children: Vec<TaskId>,
    join_tx: Option<oneshot::Sender<TaskResult>>,
    pub(crate) root: bool,
    // failure delivered to a join handle that hasn't been awaited yet
    unobserved: Option<TbError>,
    pub(crate) polls: u64,
}

/// Scheduler-owned state shared with every [`Sim`] handle.
pub(crate) struct Core {
    pub(crate) tasks: IntMap<TaskEntry>,
    ready: Queue<TaskId>,
    pub(crate) waits: WaitMap,
    next_id: u64,
    pub(crate) current: Option<TaskId>,
    pub(crate) now: u64,
    adapter: Option<Box<dyn SimAdapter>>,
    pub(crate) fatal: Vec<TaskFailure>,
    rng: StdRng,
    pub(crate) assertions: Vec<TbObj<AssertionStats>>,
    pub(crate) trace: Option<Vec<(u64, TaskId)>>,
    pub(crate) violation: Option<TbError>,
}

/// What happened when the current task asked to suspend.
pub(crate) enum Suspension {
    Ready(Fired),
    Parked(TaskId),
}

impl Core {
    pub(crate) fn new(adapter: Box<dyn SimAdapter>, seed: u64) -> Self {
        Self {
            tasks: IntMap::new(),
            ready: Queue::new(),
            waits: WaitMap::default(),
            next_id: 1,
            current: None,
            now: adapter.now(),
            adapter: Some(adapter),
            fatal: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            assertions: Vec::new(),
            trace: None,
            violation: None,
        }
    }

    pub(crate) fn adapter(&mut self) -> Result<&mut dyn SimAdapter, TbError> {
        match self.adapter.as_deref_mut() {
            Some(adapter) => Ok(adapter),
            None => Err(TbError::Invariant("simulator adapter detached".to_string())),
        }
    }

    fn adapter_ref(&self) -> Result<&dyn SimAdapter, TbError> {
        self.adapter
            .as_deref()
            .ok_or_else(|| TbError::Invariant("simulator adapter detached".to_string()))
    }

    pub(crate) fn take_adapter(&mut self) -> Option<Box<dyn SimAdapter>> {
        self.adapter.take()
    }

    pub(crate) fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(id.0).map(|t| t.status)
    }

    fn new_task(
        &mut self,
        name: &str,
        future: TaskFuture,
        root: bool,
    ) -> (TaskId, oneshot::Receiver<TaskResult>) {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let parent = if root { None } else { self.current };
        if let Some(parent) = parent.and_then(|p| self.tasks.get_mut(p.0)) {
            parent.children.push(id);
        }
        self.tasks.insert(
            id.0,
            TaskEntry {
                name: name.to_string(),
                status: TaskStatus::Runnable,
                future: Some(future),
                awaiting: None,
                last_trigger: None,
                fired: None,
                children: Vec::new(),
                join_tx: Some(tx),
                root,
                unobserved: None,
                polls: 0,
            },
        );
        self.schedule(id);
        debug!(time = self.now, task = %id, name, parent = ?parent, "spawned");
        (id, rx)
    }

    pub(crate) fn spawn_root(
        &mut self,
        name: &str,
        future: TaskFuture,
    ) -> (TaskId, oneshot::Receiver<TaskResult>) {
        self.new_task(name, future, true)
    }

    fn schedule(&mut self, id: TaskId) {
        // Queue::add only fails on capacity-bounded queues
        let _ = self.ready.add(id);
    }

    pub(crate) fn next_ready(&mut self) -> Option<TaskId> {
        self.ready.remove().ok()
    }

    /// Register the trigger for the task being polled.
    fn suspend(&mut self, trigger: &Trigger) -> Result<Suspension, TbError> {
        let task = self
            .current
            .ok_or_else(|| TbError::Invariant(format!("{} awaited outside of a task", trigger)))?;
        if self.status(task) == Some(TaskStatus::Cancelled) {
            // cancelled itself mid-poll; park without registering so it is dropped
            return Ok(Suspension::Parked(task));
        }
        if let Some(previous) = self.tasks.get(task.0).and_then(|e| e.awaiting.as_ref()) {
            return Err(TbError::Invariant(format!(
                "{} suspended on {} while already waiting on {}",
                task, trigger, previous
            )));
        }
        let tasks = &self.tasks;
        let finished = |t: TaskId| tasks.get(t.0).map_or(true, |e| e.status.is_terminal());
        match self.waits.register(task, trigger, self.now, &finished) {
            Armament::Ready(fired) => Ok(Suspension::Ready(fired)),
            Armament::Parked => {
                let entry = self
                    .tasks
                    .get_mut(task.0)
                    .ok_or_else(|| TbError::Invariant(format!("{} is not in the task table", task)))?;
                entry.awaiting = Some(trigger.clone());
                entry.status = TaskStatus::Suspended;
                Ok(Suspension::Parked(task))
            }
        }
    }

    fn take_fired(&mut self, task: TaskId) -> Option<Fired> {
        self.tasks.get_mut(task.0).and_then(|t| t.fired.take())
    }

    /// Resolve triggers against `ev` and queue every woken task.
    pub(crate) fn wake(&mut self, ev: &Events) -> Result<usize, TbError> {
        let firings = self.waits.resolve(ev);
        let n = firings.len();
        for firing in firings {
            let entry = self.tasks.get_mut(firing.task.0).ok_or_else(|| {
                TbError::Invariant(format!("{} fired for unknown {}", firing.trigger, firing.task))
            })?;
            if entry.status != TaskStatus::Suspended || entry.awaiting.as_ref() != Some(&firing.trigger) {
                return Err(TbError::Invariant(format!(
                    "{} fired for {} which is {:?} on {:?}",
                    firing.trigger, firing.task, entry.status, entry.awaiting
                )));
            }
            entry.status = TaskStatus::Runnable;
            entry.awaiting = None;
            entry.fired = Some(firing.fired);
            entry.last_trigger = Some(firing.trigger);
            self.schedule(firing.task);
        }
        Ok(n)
    }

    /// Record a task's result, hand it to its joiner and wake whoever waits on it.
    pub(crate) fn complete(&mut self, id: TaskId, result: TaskResult) -> Result<(), TbError> {
        let now = self.now;
        let entry = self
            .tasks
            .get_mut(id.0)
            .ok_or_else(|| TbError::Invariant(format!("completed unknown {}", id)))?;
        entry.future = None;
        entry.status = match result {
            Ok(_) => TaskStatus::Done,
            Err(_) => TaskStatus::Failed,
        };
        if let Err(e) = &result {
            warn!(
                time = now,
                task = %id,
                name = entry.name.as_str(),
                trigger = ?entry.last_trigger.as_ref().map(|t| t.to_string()),
                error = %e,
                "task failed"
            );
        } else {
            debug!(time = now, task = %id, name = entry.name.as_str(), "task done");
        }
        let root = entry.root;
        let failure = result.as_ref().err().cloned();
        if let Some(tx) = entry.join_tx.take() {
            match tx.send(result) {
                Ok(()) if !root => entry.unobserved = failure,
                Ok(()) => {}
                Err(Err(e)) if !root => {
                    // nobody holds the join handle any more
                    let name = entry.name.clone();
                    self.fatal.push(TaskFailure { task: Some(id), name, error: e });
                }
                Err(_) => {}
            }
        }
        let children = entry.children.clone();
        for child in children {
            if let Some(e) = self.tasks.get(child.0).and_then(|c| c.unobserved.as_ref()) {
                warn!(time = now, task = %id, child = %child, error = %e, "child failure never joined");
            }
        }
        self.wake(&Events { time: now, changes: &[], completed: Some(id) })?;
        Ok(())
    }

    fn mark_observed(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get_mut(id.0) {
            entry.unobserved = None;
        }
    }

    /// Cancel `id` and all its descendants. Returns their continuations so they
    /// can be dropped after the core is released, plus the first unobserved
    /// descendant failure.
    pub(crate) fn cancel(&mut self, id: TaskId) -> Result<(Vec<TaskFuture>, Option<(TaskId, TbError)>), TbError> {
        let mut garbage = Vec::new();
        let mut surfaced = None;
        let mut stack = vec![id];
        let mut cancelled = Vec::new();
        while let Some(t) = stack.pop() {
            let entry = self
                .tasks
                .get_mut(t.0)
                .ok_or_else(|| TbError::Invariant(format!("cancelled unknown {}", t)))?;
            stack.extend(entry.children.iter().rev().copied());
            if t != id && surfaced.is_none() {
                if let Some(e) = entry.unobserved.take() {
                    surfaced = Some((t, e));
                }
            }
            if entry.status.is_terminal() {
                continue;
            }
            entry.status = TaskStatus::Cancelled;
            if let Some(fut) = entry.future.take() {
                garbage.push(fut);
            }
            if let Some(tx) = entry.join_tx.take() {
                let _ = tx.send(Err(TbError::Cancelled { task: t }));
            }
            if let Some(trigger) = entry.awaiting.take() {
                if !self.waits.remove(t, &trigger) {
                    return Err(TbError::Invariant(format!(
                        "{} was suspended on {} but not registered",
                        t, trigger
                    )));
                }
            }
            cancelled.push(t);
        }
        let now = self.now;
        debug!(time = now, task = %id, n = cancelled.len(), "cancelled");
        for t in cancelled {
            self.wake(&Events { time: now, changes: &[], completed: Some(t) })?;
        }
        Ok((garbage, surfaced))
    }

    /// Cancel every live task. Used when a run finishes.
    pub(crate) fn tear_down(&mut self) -> Vec<TaskFuture> {
        let mut garbage = Vec::new();
        for entry in self.tasks.values_mut() {
            if !entry.status.is_terminal() {
                entry.status = TaskStatus::Cancelled;
                entry.awaiting = None;
                if let Some(fut) = entry.future.take() {
                    garbage.push(fut);
                }
                entry.join_tx = None;
            }
        }
        self.waits.clear();
        while self.next_ready().is_some() {}
        garbage
    }

    pub(crate) fn describe_waiting(&self) -> Vec<String> {
        self.waits
            .registrations()
            .into_iter()
            .map(|(task, trigger)| {
                let name = self.tasks.get(task.0).map_or("?", |t| t.name.as_str());
                format!("{} ({}) -> {}", task, name, trigger)
            })
            .collect()
    }
}

/// Handle every task receives. Gives access to the simulator, to waiting on
/// triggers and to spawning and cancelling other tasks.
#[derive(Clone)]
pub struct Sim {
    pub(crate) core: Rc<RefCell<Core>>,
}

impl Sim {
    pub(crate) fn new(core: Rc<RefCell<Core>>) -> Self {
        Self { core }
    }

    /// Current simulation time in steps.
    pub fn now(&self) -> u64 {
        self.core.borrow().now
    }

    /// Current simulation time in `unit`.
    pub fn time(&self, unit: &str) -> Result<f64, TbError> {
        let core = self.core.borrow();
        let precision = core.adapter_ref()?.precision();
        sim_if::from_steps(core.now, unit, precision)
    }

    pub fn steps(&self, time: u64, unit: &str) -> Result<u64, TbError> {
        let precision = self.core.borrow().adapter_ref()?.precision();
        sim_if::to_steps(time as f64, unit, precision)
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.core.borrow().current
    }

    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.core.borrow().status(id)
    }

    /// Tasks currently registered under exactly `trigger`, in resumption order.
    pub fn waiters(&self, trigger: &Trigger) -> Vec<TaskId> {
        self.core.borrow().waits.waiters(trigger)
    }

    pub fn signal(&self, name: &str) -> Result<SimObject, TbError> {
        let id = self.core.borrow().adapter_ref()?.signal_by_name(name)?;
        Ok(SimObject::new(id, name, self.clone()))
    }

    pub fn read(&self, signal: SignalId) -> Result<u64, TbError> {
        self.core.borrow().adapter_ref()?.read(signal)
    }

    pub fn write(&self, signal: SignalId, value: u64) -> Result<(), TbError> {
        self.core.borrow_mut().adapter()?.write(signal, value)
    }

    pub fn log(&self, msg: &str) {
        let core = self.core.borrow();
        match core.adapter_ref() {
            Ok(adapter) => adapter.log(core.now, msg),
            Err(_) => tracing::info!(time = core.now, "{}", msg),
        }
    }

    /// Run `future` as a child of the current task.
    pub fn fork(&self, future: impl Future<Output = TaskResult> + 'static) -> JoinHandle {
        self.spawn("forked", future)
    }

    pub fn spawn(&self, name: &str, future: impl Future<Output = TaskResult> + 'static) -> JoinHandle {
        let (task, rx) = self.core.borrow_mut().new_task(name, future.boxed_local(), false);
        JoinHandle {
            task,
            sim: self.clone(),
            join_rx: rx,
            registered: false,
        }
    }

    /// Suspend the current task until `trigger` fires.
    pub fn wait(&self, trigger: Trigger) -> Wait {
        Wait {
            sim: self.clone(),
            trigger,
            parked: None,
        }
    }

    pub fn timer(&self, time: u64, unit: &str) -> Result<Wait, TbError> {
        Ok(self.wait(Trigger::timer(self.steps(time, unit)?)))
    }

    pub fn timer_steps(&self, steps: u64) -> Wait {
        self.wait(Trigger::timer(steps))
    }

    /// Wait for `trigger`, failing with [`TbError::Timeout`] if `steps` pass first.
    pub async fn with_timeout(&self, trigger: Trigger, steps: u64) -> TaskResult<()> {
        let what = trigger.to_string();
        let fired = self.wait(Trigger::any(vec![trigger, Trigger::timer(steps)])).await;
        if fired.contains(0) {
            Ok(())
        } else {
            Err(TbError::Timeout {
                time: self.now(),
                trigger: what,
            })
        }
    }

    /// Cancel `task` and everything it spawned.
    pub fn cancel(&self, task: TaskId) -> TaskResult<()> {
        let (garbage, surfaced) = self.core.borrow_mut().cancel(task)?;
        drop(garbage);
        match surfaced {
            None => Ok(()),
            Some((child, e)) => Err(TbError::CancellationPropagation {
                task,
                child,
                source: Box::new(e),
            }),
        }
    }

    /// Error for giving up on a test explicitly: `return Err(sim.fail("..."))`.
    pub fn fail(&self, message: impl Into<String>) -> TbError {
        TbError::Failed(message.into())
    }

    pub fn assertion_failed(&self, message: impl Into<String>) -> TbError {
        TbError::AssertionFailed {
            time: self.now(),
            message: message.into(),
        }
    }

    /// `Ok(())` if `cond` holds, otherwise an [`TbError::AssertionFailed`] stamped with the current time.
    pub fn check(&self, cond: bool, message: &str) -> TaskResult<()> {
        if cond {
            Ok(())
        } else {
            Err(self.assertion_failed(message))
        }
    }

    pub fn rand(&self) -> f32 {
        self.core.borrow_mut().rng.gen::<f32>()
    }

    pub fn rand_int(&self, ceil: u32) -> u32 {
        self.core.borrow_mut().rng.gen_range(0..ceil.max(1))
    }

    fn suspend(&self, trigger: &Trigger) -> Option<Suspension> {
        let mut core = self.core.borrow_mut();
        match core.suspend(trigger) {
            Ok(s) => Some(s),
            Err(e) => {
                // The task stays Pending without a registration, which the
                // scheduler turns into a failure carrying this error.
                core.violation = Some(e);
                None
            }
        }
    }
}

/// Future returned by [`Sim::wait`].
pub struct Wait {
    sim: Sim,
    trigger: Trigger,
    parked: Option<TaskId>,
}

impl Future for Wait {
    type Output = Fired;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.parked {
            // Second poll: the scheduler only resumes a parked task once its trigger fired.
            Some(task) => match this.sim.core.borrow_mut().take_fired(task) {
                Some(fired) => Poll::Ready(fired),
                None => Poll::Pending,
            },
            None => match this.sim.suspend(&this.trigger) {
                Some(Suspension::Ready(fired)) => Poll::Ready(fired),
                Some(Suspension::Parked(task)) => {
                    this.parked = Some(task);
                    Poll::Pending
                }
                None => Poll::Pending,
            },
        }
    }
}

pub struct JoinHandle {
    task: TaskId,
    sim: Sim,
    join_rx: oneshot::Receiver<TaskResult>,
    registered: bool,
}

impl JoinHandle {
    pub fn task(&self) -> TaskId {
        self.task
    }
    pub fn cancel(self) -> TaskResult<()> {
        self.sim.cancel(self.task)
    }
    pub fn is_finished(&self) -> bool {
        self.sim
            .task_status(self.task)
            .map_or(true, TaskStatus::is_terminal)
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        // A failure delivered to this handle but never awaited fails the run.
        let Ok(mut core) = self.sim.core.try_borrow_mut() else {
            return;
        };
        let core = &mut *core;
        let Some(entry) = core.tasks.get_mut(self.task.0) else {
            return;
        };
        if let Some(error) = entry.unobserved.take() {
            warn!(
                time = core.now,
                task = %self.task,
                name = entry.name.as_str(),
                error = %error,
                "join handle dropped without observing failure"
            );
            core.fatal.push(TaskFailure {
                task: Some(self.task),
                name: entry.name.clone(),
                error,
            });
        }
    }
}

impl Future for JoinHandle {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.join_rx.try_recv() {
            Ok(Some(result)) => {
                let mut core = this.sim.core.borrow_mut();
                core.mark_observed(this.task);
                if let (true, Some(current)) = (this.registered, core.current) {
                    // consume the firing left by the join trigger
                    core.take_fired(current);
                }
                Poll::Ready(result)
            }
            Ok(None) if !this.registered => {
                this.registered = true;
                match this.sim.suspend(&Trigger::join(this.task)) {
                    // terminal but nothing in the channel
                    Some(Suspension::Ready(_)) => Poll::Ready(Err(TbError::Invariant(format!(
                        "{} finished without a result",
                        this.task
                    )))),
                    Some(Suspension::Parked(_)) | None => Poll::Pending,
                }
            }
            Ok(None) => Poll::Pending,
            Err(_) => Poll::Ready(Err(TbError::Invariant(format!(
                "result of {} was already taken",
                this.task
            )))),
        }
    }
}
