use std::collections::VecDeque;

use tracing::warn;

use crate::error::TbError;
use crate::executor::JoinHandle;
use crate::obj::TbObj;
use crate::signal::SimObject;
use crate::value::Val;
use crate::TaskResult;

/// In-order comparison of expected against received transactions.
pub struct Scoreboard<T: PartialEq>(TbObj<ScoreboardInner<T>>);

impl<T: PartialEq> Clone for Scoreboard<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: PartialEq> Default for Scoreboard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> Scoreboard<T> {
    pub fn new() -> Self {
        Self(TbObj::new(ScoreboardInner {
            exp_q: VecDeque::new(),
            recv_q: VecDeque::new(),
            errors: 0,
            expected: 0,
            received: 0,
            matched: 0,
        }))
    }
    pub fn add_exp(&self, data: T) {
        self.0.with_mut(|s| {
            s.exp_q.push_back(data);
            s.expected += 1;
        });
        self.compare();
    }
    pub fn add_recv(&self, data: T) {
        self.0.with_mut(|s| {
            s.recv_q.push_back(data);
            s.received += 1;
        });
        self.compare();
    }
    fn compare(&self) {
        self.0.with_mut(|s| {
            while let (Some(exp), Some(recv)) = (s.exp_q.front(), s.recv_q.front()) {
                if exp == recv {
                    s.matched += 1;
                } else {
                    s.errors += 1;
                }
                s.exp_q.pop_front();
                s.recv_q.pop_front();
            }
        });
    }
    /// `Ok` with the summary if everything matched, otherwise a failure carrying it.
    pub fn result(&self) -> TaskResult {
        if self.passed() {
            Ok(Val::String(self.result_str()))
        } else {
            Err(TbError::Failed(format!("scoreboard mismatch: {}", self.result_str())))
        }
    }
    pub fn passed(&self) -> bool {
        let inner = self.0.get();
        inner.expected > 0
            && inner.received == inner.expected
            && inner.matched == inner.received
            && inner.errors == 0
            && inner.exp_q.is_empty()
            && inner.recv_q.is_empty()
    }
    pub fn result_str(&self) -> String {
        let inner = self.0.get();
        format!(
            "expected={}, received={}, matched={}, errors={}, expQ: {}, recvQ: {}",
            inner.expected,
            inner.received,
            inner.matched,
            inner.errors,
            inner.exp_q.len(),
            inner.recv_q.len()
        )
    }
}

struct ScoreboardInner<T: PartialEq> {
    exp_q: VecDeque<T>,
    recv_q: VecDeque<T>,
    errors: u32,
    expected: u32,
    received: u32,
    matched: u32,
}

/*
 * MONITOR
 */
pub struct Monitor<T: PartialEq>(TbObj<MonitorInner<T>>);

impl<T: PartialEq> Clone for Monitor<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: PartialEq> Default for Monitor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> Monitor<T> {
    pub fn new() -> Self {
        Self(TbObj::new(MonitorInner {
            enable: true,
            exp_not_recv: true,
            scoreboard: None,
        }))
    }
    /// Forward observed data to `sb`, as expected data if `exp_not_recv` is set.
    pub fn set_scoreboard(&self, sb: Scoreboard<T>, exp_not_recv: bool) {
        self.0.with_mut(|m| {
            m.exp_not_recv = exp_not_recv;
            m.scoreboard = Some(sb);
        })
    }
    pub fn set_enable(&self, enable: bool) {
        self.0.with_mut(|m| m.enable = enable);
    }
    pub fn to_scoreboard(&self, data: T) -> TaskResult<()> {
        let m = self.0.get();
        if !m.enable {
            return Ok(());
        }
        match &m.scoreboard {
            Some(sb) if m.exp_not_recv => sb.add_exp(data),
            Some(sb) => sb.add_recv(data),
            None => {
                return Err(TbError::Failed(
                    "can't forward data to scoreboard: no scoreboard set".to_string(),
                ))
            }
        }
        Ok(())
    }
}

struct MonitorInner<T: PartialEq> {
    enable: bool,
    exp_not_recv: bool,
    scoreboard: Option<Scoreboard<T>>,
}

/*
 * CLOCK
 */

/// Drive `clk` as a free-running clock from a child task of the caller.
/// The signal is set low first, so the first rising edge comes after the low phase.
pub fn clock(clk: SimObject, period: u64, unit: &str) -> TaskResult<JoinHandle> {
    let sim = clk.sim().clone();
    let period = sim.steps(period, unit)?;
    if period < 2 {
        return Err(TbError::Failed(format!(
            "clock period on {} must be at least 2 simulation steps",
            clk.name()
        )));
    }
    let high = period / 2;
    let low = period - high;
    if period % 2 != 0 {
        warn!(
            signal = clk.name(),
            period, high, low, "clock period not divisible by 2"
        );
    }
    Ok(sim.spawn(&format!("clock {}", clk.name()), drive_clock(clk, high, low)))
}

async fn drive_clock(clk: SimObject, high: u64, low: u64) -> TaskResult {
    loop {
        clk.set(0)?;
        clk.sim().timer_steps(low).await;
        clk.set(1)?;
        clk.sim().timer_steps(high).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Sim;
    use crate::mem_sim::MemSim;
    use crate::scheduler::Scheduler;

    #[test]
    fn scoreboard_matches_in_order() {
        let sb = Scoreboard::new();
        sb.add_exp(1u32);
        sb.add_exp(2);
        sb.add_recv(1);
        assert!(!sb.passed());
        sb.add_recv(2);
        assert!(sb.passed());
        assert_eq!(
            sb.result(),
            Ok(Val::String(
                "expected=2, received=2, matched=2, errors=0, expQ: 0, recvQ: 0".to_string()
            ))
        );
    }

    #[test]
    fn scoreboard_mismatch_fails() {
        let sb = Scoreboard::new();
        sb.add_exp("a");
        sb.add_recv("b");
        assert!(!sb.passed());
        assert!(matches!(sb.result(), Err(TbError::Failed(_))));
    }

    #[test]
    fn empty_scoreboard_does_not_pass() {
        assert!(!Scoreboard::<u8>::new().passed());
    }

    #[test]
    fn monitor_forwards_when_enabled() {
        let sb = Scoreboard::new();
        let exp = Monitor::new();
        let recv = Monitor::new();
        exp.set_scoreboard(sb.clone(), true);
        recv.set_scoreboard(sb.clone(), false);
        exp.to_scoreboard(7u8).unwrap();
        recv.set_enable(false);
        recv.to_scoreboard(9).unwrap();
        recv.set_enable(true);
        recv.to_scoreboard(7).unwrap();
        assert!(sb.passed());
    }

    #[test]
    fn monitor_without_scoreboard_errors() {
        let m = Monitor::<u8>::new();
        assert!(m.to_scoreboard(1).is_err());
    }

    async fn three_edges(sim: Sim) -> TaskResult {
        let clk = sim.signal("clk")?;
        clock(clk.clone(), 10, "ns")?;
        for _ in 0..3 {
            clk.rising_edge().await;
        }
        Ok(Val::Int(sim.now() as i64))
    }

    #[test]
    fn clock_drives_rising_edges() {
        let mut mem = MemSim::new();
        mem.add_signal("clk", 0);
        let mut sched = Scheduler::new(Box::new(mem));
        let id = sched.spawn("three_edges", three_edges);
        assert!(sched.run().is_success());
        assert_eq!(sched.root_result(id), Some(&Ok(Val::Int(25))));
    }

    async fn odd_period(sim: Sim) -> TaskResult {
        clock(sim.signal("clk")?, 1, "ps")?;
        Ok(Val::None)
    }

    #[test]
    fn clock_period_below_one_step_fails() {
        let mut mem = MemSim::new();
        mem.add_signal("clk", 0);
        let mut sched = Scheduler::new(Box::new(mem));
        sched.spawn("odd_period", odd_period);
        assert!(!sched.run().is_success());
    }
}
