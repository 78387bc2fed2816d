use tbsched::prelude::*;

fn sim_with(signals: &[(&str, u64)], stimuli: &[(u64, &str, u64)]) -> Box<MemSim> {
    let mut mem = MemSim::new();
    for (name, init) in signals {
        mem.add_signal(name, *init);
    }
    for (time, name, value) in stimuli {
        let id = mem.add_signal(name, 0);
        mem.drive(*time, id, *value);
    }
    Box::new(mem)
}

async fn answer_later(sim: Sim) -> TaskResult {
    sim.timer_steps(5).await;
    Ok(Val::Int(42))
}

async fn join_child(sim: Sim) -> TaskResult {
    let child = sim.fork(answer_later(sim.clone()));
    let val = child.await?;
    tb_assert!(sim, sim.now() == 5);
    Ok(val)
}

#[test]
fn join_delivers_the_child_result() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    let id = sched.spawn("join_child", join_child);
    assert!(sched.run().is_success());
    assert_eq!(sched.root_result(id), Some(&Ok(Val::Int(42))));
}

async fn immediate(_sim: Sim) -> TaskResult {
    Ok(Val::String("done".to_string()))
}

async fn join_finished_child(sim: Sim) -> TaskResult {
    let child = sim.fork(immediate(sim.clone()));
    sim.timer_steps(3).await;
    tb_assert!(sim, child.is_finished());
    // already satisfied: resolves without suspending
    let val = child.await?;
    tb_assert!(sim, sim.now() == 3);
    Ok(val)
}

#[test]
fn joining_a_finished_task_completes_at_once() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    let id = sched.spawn("join_finished_child", join_finished_child);
    assert!(sched.run().is_success());
    assert_eq!(
        sched.root_result(id),
        Some(&Ok(Val::String("done".to_string())))
    );
}

async fn fail_after(sim: Sim, steps: u64) -> TaskResult {
    sim.timer_steps(steps).await;
    Err(sim.fail("child broke"))
}

async fn observe_child_failure(sim: Sim) -> TaskResult {
    let child = sim.fork(fail_after(sim.clone(), 2));
    match child.await {
        Err(TbError::Failed(msg)) => Ok(Val::String(msg)),
        other => Err(TbError::Failed(format!("unexpected join result {:?}", other))),
    }
}

#[test]
fn observed_child_failure_does_not_fail_the_run() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    let id = sched.spawn("observe_child_failure", observe_child_failure);
    assert_eq!(sched.run(), RunOutcome::Success);
    assert_eq!(
        sched.root_result(id),
        Some(&Ok(Val::String("child broke".to_string())))
    );
}

async fn detach_failing_child(sim: Sim) -> TaskResult {
    drop(sim.spawn("detached", fail_after(sim.clone(), 2)));
    sim.timer_steps(10).await;
    Ok(Val::None)
}

#[test]
fn detached_failure_fails_the_run() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    sched.spawn("detach_failing_child", detach_failing_child);
    match sched.run() {
        RunOutcome::Failure(f) => {
            assert_eq!(f.len(), 1);
            assert_eq!(f[0].name, "detached");
            assert_eq!(f[0].error, TbError::Failed("child broke".to_string()));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sched.now(), 2);
}

async fn wait_for_edge(sim: Sim, resumed: TbObj<bool>) -> TaskResult {
    sim.signal("never")?.rising_edge().await;
    resumed.with_mut(|r| *r = true);
    Ok(Val::None)
}

async fn cancel_waiting_child(sim: Sim, resumed: TbObj<bool>) -> TaskResult {
    let never = sim.signal("never")?;
    let child = sim.fork(wait_for_edge(sim.clone(), resumed));
    let task = child.task();
    sim.timer_steps(3).await;
    tb_assert!(sim, sim.waiters(&Trigger::rising_edge(never.id())) == vec![task]);

    sim.cancel(task)?;
    tb_assert!(sim, sim.task_status(task) == Some(TaskStatus::Cancelled));
    tb_assert!(sim, sim.waiters(&Trigger::rising_edge(never.id())).is_empty());
    match child.await {
        Err(TbError::Cancelled { task: t }) if t == task => {}
        other => return Err(TbError::Failed(format!("unexpected join result {:?}", other))),
    }
    // the edge arrives after cancellation; the child must not run again
    sim.timer_steps(10).await;
    Ok(Val::None)
}

#[test]
fn cancelled_task_never_resumes() {
    let resumed = TbObj::new(false);
    let flag = resumed.clone();
    let mut sched = Scheduler::new(sim_with(&[], &[(5, "never", 1)]));
    sched.spawn("cancel_waiting_child", move |sim| cancel_waiting_child(sim, flag));
    assert_eq!(sched.run(), RunOutcome::Success);
    assert!(!*resumed.get());
    assert_eq!(sched.now(), 13);
}

async fn hold_failing_grandchild(sim: Sim) -> TaskResult {
    let _grandchild = sim.spawn("grandchild", fail_after(sim.clone(), 1));
    sim.timer_steps(100).await;
    Ok(Val::None)
}

async fn cancel_tree(sim: Sim) -> TaskResult {
    let child = sim.spawn("child", hold_failing_grandchild(sim.clone()));
    let task = child.task();
    sim.timer_steps(5).await;
    match child.cancel() {
        Err(TbError::CancellationPropagation { task: t, source, .. }) if t == task => {
            tb_assert!(sim, *source == TbError::Failed("child broke".to_string()));
            Ok(Val::None)
        }
        other => Err(TbError::Failed(format!("unexpected cancel result {:?}", other))),
    }
}

#[test]
fn cancellation_surfaces_unobserved_descendant_failure() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    sched.spawn("cancel_tree", cancel_tree);
    assert_eq!(sched.run(), RunOutcome::Success);
    assert_eq!(sched.now(), 5);
}

async fn wait_for_parent(sim: Sim, parent: TaskId) -> TaskResult {
    sim.wait(Trigger::join(parent)).await;
    Ok(Val::None)
}

async fn circular_join(sim: Sim) -> TaskResult {
    let me = sim
        .current_task()
        .ok_or_else(|| TbError::Failed("not in a task".to_string()))?;
    let child = sim.fork(wait_for_parent(sim.clone(), me));
    child.await
}

#[test]
fn circular_joins_deadlock() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    sched.spawn("circular_join", circular_join);
    match sched.run() {
        RunOutcome::Deadlock { time, waiting } => {
            assert_eq!(time, 0);
            assert_eq!(waiting.len(), 2);
            assert!(waiting[0].contains("circular_join"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

async fn edge_that_never_comes(sim: Sim) -> TaskResult {
    sim.signal("quiet")?.falling_edge().await;
    Ok(Val::None)
}

#[test]
fn exhausted_simulator_deadlocks() {
    let mut sched = Scheduler::new(sim_with(&[("quiet", 1)], &[]));
    sched.spawn("edge_that_never_comes", edge_that_never_comes);
    let outcome = sched.run();
    assert!(matches!(outcome, RunOutcome::Deadlock { time: 0, .. }));
    assert_eq!(outcome.exit_code(), 2);
}

async fn first_of(sim: Sim) -> TaskResult {
    let a = sim.signal("a")?;
    let fired = sim
        .wait(Trigger::any(vec![Trigger::rising_edge(a.id()), Trigger::timer(100)]))
        .await;
    tb_assert!(sim, fired == Fired(vec![0]), "fired {:?}", fired);
    Ok(Val::Int(sim.now() as i64))
}

#[test]
fn any_resumes_on_the_first_child() {
    let mut sched = Scheduler::new(sim_with(&[], &[(20, "a", 1)]));
    let id = sched.spawn("first_of", first_of);
    assert!(sched.run().is_success());
    assert_eq!(sched.root_result(id), Some(&Ok(Val::Int(20))));
}

async fn both_of(sim: Sim) -> TaskResult {
    let a = sim.signal("a")?;
    let b = sim.signal("b")?;
    let fired = sim
        .wait(Trigger::all(vec![
            Trigger::rising_edge(a.id()),
            Trigger::falling_edge(b.id()),
        ]))
        .await;
    tb_assert!(sim, fired == Fired(vec![0, 1]));
    Ok(Val::Int(sim.now() as i64))
}

#[test]
fn all_waits_for_every_child() {
    let mut sched = Scheduler::new(sim_with(
        &[("b", 1)],
        &[(20, "a", 1), (25, "a", 0), (30, "b", 0)],
    ));
    let id = sched.spawn("both_of", both_of);
    assert!(sched.run().is_success());
    assert_eq!(sched.root_result(id), Some(&Ok(Val::Int(30))));
}

async fn timeout_hit(sim: Sim) -> TaskResult {
    let a = sim.signal("a")?;
    sim.with_timeout(Trigger::rising_edge(a.id()), 10).await?;
    Ok(Val::None)
}

async fn timeout_met(sim: Sim) -> TaskResult {
    let a = sim.signal("a")?;
    sim.with_timeout(Trigger::rising_edge(a.id()), 100).await?;
    Ok(Val::Int(sim.now() as i64))
}

#[test]
fn timeouts() {
    let mut sched = Scheduler::new(sim_with(&[], &[(20, "a", 1)]));
    let id = sched.spawn("timeout_hit", timeout_hit);
    match sched.run() {
        RunOutcome::Failure(f) => {
            assert_eq!(f[0].task, Some(id));
            assert!(matches!(f[0].error, TbError::Timeout { time: 10, .. }));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let mut sched = Scheduler::new(sim_with(&[], &[(20, "a", 1)]));
    let id = sched.spawn("timeout_met", timeout_met);
    assert!(sched.run().is_success());
    assert_eq!(sched.root_result(id), Some(&Ok(Val::Int(20))));
}

async fn zero_timer(sim: Sim) -> TaskResult {
    sim.timer_steps(0).await;
    Ok(Val::None)
}

#[test]
fn zero_delay_timer_does_not_suspend() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    let id = sched.spawn("zero_timer", zero_timer);
    assert!(sched.run().is_success());
    assert_eq!(sched.polls(id), 1);
    assert_eq!(sched.stats().cycles, 0);
}

async fn background_clock(sim: Sim) -> TaskResult {
    let clk = sim.signal("clk")?;
    let handle = clock(clk.clone(), 4, "ns")?;
    clock_cycles(&clk, 2).await?;
    tb_assert!(sim, !handle.is_finished());
    Ok(Val::None)
}

#[test]
fn background_tasks_are_cancelled_when_roots_finish() {
    let mut sched = Scheduler::new(sim_with(&[("clk", 0)], &[]));
    sched.spawn("background_clock", background_clock);
    assert!(sched.run().is_success());
    // rising edges at 2 and 6
    assert_eq!(sched.now(), 6);
    assert!(sched.sim().waiters(&Trigger::timer(2)).is_empty());
}

async fn root_fails(sim: Sim) -> TaskResult {
    sim.timer_steps(2).await;
    Err(sim.assertion_failed("root gave up"))
}

async fn root_waits(sim: Sim) -> TaskResult {
    sim.timer_steps(50).await;
    Ok(Val::None)
}

#[test]
fn failing_root_stops_the_run() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    let waits = sched.spawn("root_waits", root_waits);
    sched.spawn("root_fails", root_fails);
    match sched.run() {
        RunOutcome::Failure(f) => assert_eq!(
            f[0].error,
            TbError::AssertionFailed {
                time: 2,
                message: "root gave up".to_string()
            }
        ),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sched.now(), 2);
    assert_eq!(sched.task_status(waits), Some(TaskStatus::Cancelled));
}

async fn mark_on_edge(sim: Sim, ran: TbObj<Option<u64>>) -> TaskResult {
    sim.signal("a")?.rising_edge().await;
    ran.with_mut(|r| *r = Some(sim.now()));
    Ok(Val::None)
}

async fn return_on_shared_edge(sim: Sim, ran: TbObj<Option<u64>>) -> TaskResult {
    let a = sim.signal("a")?;
    let _child = sim.fork(mark_on_edge(sim.clone(), ran));
    // registered ahead of the child, so resumed first
    a.rising_edge().await;
    Ok(Val::None)
}

#[test]
fn tasks_woken_with_the_last_root_still_run() {
    let ran = TbObj::new(None);
    let flag = ran.clone();
    let mut sched = Scheduler::new(sim_with(&[], &[(5, "a", 1)]));
    sched.spawn("return_on_shared_edge", move |sim| return_on_shared_edge(sim, flag));
    assert_eq!(sched.run(), RunOutcome::Success);
    assert_eq!(*ran.get(), Some(5));
    assert_eq!(sched.now(), 5);
}

async fn hold_failed_child(sim: Sim) -> TaskResult {
    let _held = sim.fork(fail_after(sim.clone(), 2));
    sim.timer_steps(10).await;
    Ok(Val::None)
}

#[test]
fn dropping_a_handle_to_a_failed_task_fails_the_run() {
    let mut sched = Scheduler::new(sim_with(&[], &[]));
    sched.spawn("hold_failed_child", hold_failed_child);
    match sched.run() {
        RunOutcome::Failure(f) => {
            assert_eq!(f.len(), 1);
            assert_eq!(f[0].name, "forked");
            assert_eq!(f[0].error, TbError::Failed("child broke".to_string()));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sched.now(), 10);
}
