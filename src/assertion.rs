use tracing::warn;

use crate::executor::{JoinHandle, Sim};
use crate::obj::TbObj;
use crate::trigger::Trigger;
use crate::TaskResult;

/// Check a condition inside a task, failing it with
/// [`TbError::AssertionFailed`](crate::TbError::AssertionFailed) if the
/// condition does not hold.
#[macro_export]
macro_rules! tb_assert {
    ($sim:expr, $cond:expr) => {
        $sim.check($cond, stringify!($cond))?
    };
    ($sim:expr, $cond:expr, $($arg:tt)+) => {
        $sim.check($cond, &format!($($arg)+))?
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionStats {
    pub name: String,
    pub triggered: u32,
    pub passed: u32,
    pub failed: u32,
}

impl AssertionStats {
    pub fn result_str(&self) -> String {
        format!(
            "Assertion {}: Triggered: {}, Passed: {}, Failed: {}.",
            self.name, self.triggered, self.passed, self.failed
        )
    }
}

impl Sim {
    /// Fork a concurrent assertion: `check` runs every time `trigger` fires
    /// until the run ends. Outcomes are counted, not raised, so one bad cycle
    /// doesn't stop the test; an error returned by `check` fails the
    /// assertion task.
    pub fn assertion<F>(&self, name: &str, trigger: Trigger, check: F) -> JoinHandle
    where
        F: FnMut(&Sim) -> TaskResult<bool> + 'static,
    {
        let stats = TbObj::new(AssertionStats {
            name: name.to_string(),
            ..AssertionStats::default()
        });
        self.core.borrow_mut().assertions.push(stats.clone());
        self.spawn(
            &format!("assertion {}", name),
            run_assertion(self.clone(), trigger, check, stats),
        )
    }
}

async fn run_assertion<F>(sim: Sim, trigger: Trigger, mut check: F, stats: TbObj<AssertionStats>) -> TaskResult
where
    F: FnMut(&Sim) -> TaskResult<bool>,
{
    loop {
        sim.wait(trigger.clone()).await;
        let passed = check(&sim)?;
        stats.with_mut(|s| {
            s.triggered += 1;
            if passed {
                s.passed += 1;
            } else {
                s.failed += 1;
            }
        });
        if !passed {
            warn!(time = sim.now(), assertion = stats.get().name.as_str(), trigger = %trigger, "assertion failed");
        }
    }
}
