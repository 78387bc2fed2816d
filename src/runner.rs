//! Runs registered tests one after another against a single simulator.
//!
//! Every test gets a fresh [`Scheduler`] over the same [`SimAdapter`], so a
//! failing test can't leave tasks behind for the next one while simulation
//! time keeps running across tests.

use num_format::{Locale, ToFormattedString};
use prettytable::{format, Cell, Row, Table};
use std::future::Future;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::assertion::AssertionStats;
use crate::config::TbConfig;
use crate::error::TbError;
use crate::executor::Sim;
use crate::junit;
use crate::scheduler::{RunOutcome, Scheduler, TaskFailure};
use crate::sim_if::SimAdapter;
use crate::test::{Test, TestOutcome, TestReport, Tests};
use crate::value::Val;
use crate::TaskResult;

/// Generate a `main` that runs the given async test functions against
/// `$adapter` and exits with the run's exit code.
///
/// ```ignore
/// tbsched::run_tests!(my_adapter(); test_reset, test_counter);
/// ```
#[macro_export]
macro_rules! run_tests {
    ($adapter:expr; $( $test:ident ),+ $(,)?) => {
        fn main() {
            let code = $crate::runner::run_main(Box::new($adapter), |runner| {
                $( runner.register(stringify!($test), $test); )+
            });
            ::std::process::exit(code);
        }
    };
}

/// Install a `tracing` fmt subscriber unless one is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Entry point used by [`run_tests!`]: sets up logging, loads `tbsched.toml`,
/// runs everything registered by `register` and returns the exit code.
pub fn run_main(adapter: Box<dyn SimAdapter>, register: impl FnOnce(&mut Runner)) -> i32 {
    init_logging();
    let config = match TbConfig::discover() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "can't load configuration");
            return 1;
        }
    };
    let mut runner = Runner::new(adapter, config);
    register(&mut runner);
    runner.run().exit_code()
}

pub struct Runner {
    adapter: Option<Box<dyn SimAdapter>>,
    config: TbConfig,
    tests: Tests,
    reports: Vec<TestReport>,
    assertions: Vec<AssertionStats>,
}

impl Runner {
    pub fn new(adapter: Box<dyn SimAdapter>, config: TbConfig) -> Self {
        Self {
            adapter: Some(adapter),
            config,
            tests: Tests::new(),
            reports: Vec::new(),
            assertions: Vec::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, name: &str, test: F) -> &mut Self
    where
        F: FnOnce(Sim) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.tests.push(Test::new(name, test));
        self
    }

    pub fn reports(&self) -> &[TestReport] {
        &self.reports
    }

    pub fn assertion_stats(&self) -> &[AssertionStats] {
        &self.assertions
    }

    pub fn config(&self) -> &TbConfig {
        &self.config
    }

    /// Give the simulator back, e.g. to inspect it after the run.
    pub fn into_adapter(self) -> Option<Box<dyn SimAdapter>> {
        self.adapter
    }

    /// Run every registered test that hasn't run yet. Failures win over
    /// deadlocks in the combined outcome.
    pub fn run(&mut self) -> RunOutcome {
        let start = Instant::now();
        let sim_start = self.adapter.as_ref().map_or(0, |a| a.now());
        let mut stop = false;
        let mut tests = std::mem::take(&mut self.tests);
        for test in tests.iter_mut() {
            let Some(generator) = test.take_generator() else {
                continue;
            };
            let report = if stop {
                info!(test = test.name.as_str(), "skipping test");
                TestReport {
                    name: test.name.clone(),
                    outcome: TestOutcome::Skipped,
                    wall_secs: 0.0,
                    sim_time: 0,
                }
            } else {
                self.run_one(&test.name, generator)
            };
            if !report.passed() && !self.config.isolate_tests {
                stop = true;
            }
            self.reports.push(report);
        }
        self.tests = tests;

        let outcome = self.outcome();
        let sim_end = self.adapter.as_ref().map_or(sim_start, |a| a.now());
        self.log_summary(start.elapsed().as_secs_f64(), sim_end.saturating_sub(sim_start));
        if let Some(path) = &self.config.junit {
            match junit::write_junit(path, &self.config.suite, &self.reports) {
                Ok(()) => info!(path = %path.display(), "wrote JUnit report"),
                Err(e) => error!(path = %path.display(), error = %e, "can't write JUnit report"),
            }
        }
        outcome
    }

    fn run_one(&mut self, name: &str, generator: crate::test::TestFn) -> TestReport {
        let Some(adapter) = self.adapter.take() else {
            return TestReport {
                name: name.to_string(),
                outcome: TestOutcome::Failed(vec![TaskFailure {
                    task: None,
                    name: "runner".to_string(),
                    error: TbError::Invariant("simulator adapter lost by an earlier test".to_string()),
                }]),
                wall_secs: 0.0,
                sim_time: 0,
            };
        };
        let sim_start = adapter.now();
        info!(time = sim_start, test = name, "running test");

        let start = Instant::now();
        let mut sched = Scheduler::with_config(adapter, &self.config);
        let future = generator(sched.sim());
        let id = sched.spawn_boxed(name, future);
        let run = sched.run();
        let wall_secs = start.elapsed().as_secs_f64();
        let sim_time = sched.now().saturating_sub(sim_start);

        let stats = sched.assertion_stats();
        let failed_assertions: u32 = stats.iter().map(|a| a.failed).sum();
        let value = match sched.root_result(id) {
            Some(Ok(val)) => val.clone(),
            _ => Val::None,
        };
        let end = sched.now();
        self.assertions.extend(stats);
        self.adapter = sched.into_adapter();

        let outcome = match run {
            RunOutcome::Success if failed_assertions > 0 => TestOutcome::Failed(vec![TaskFailure {
                task: Some(id),
                name: name.to_string(),
                error: TbError::AssertionFailed {
                    time: end,
                    message: format!("{} concurrent assertion check(s) failed", failed_assertions),
                },
            }]),
            RunOutcome::Success => TestOutcome::Passed(value),
            RunOutcome::Failure(failures) => TestOutcome::Failed(failures),
            RunOutcome::Deadlock { time, waiting } => TestOutcome::Deadlock { time, waiting },
        };
        let report = TestReport {
            name: name.to_string(),
            outcome,
            wall_secs,
            sim_time,
        };
        if report.passed() {
            info!(time = end, test = name, "test passed");
        } else {
            warn!(time = end, test = name, result = report.status_str(), message = %report.message(), "test did not pass");
        }
        report
    }

    fn outcome(&self) -> RunOutcome {
        let mut failures = Vec::new();
        let mut deadlock = None;
        for report in &self.reports {
            match &report.outcome {
                TestOutcome::Failed(f) => failures.extend(f.iter().cloned()),
                TestOutcome::Deadlock { time, waiting } if deadlock.is_none() => {
                    deadlock = Some(RunOutcome::Deadlock {
                        time: *time,
                        waiting: waiting.clone(),
                    })
                }
                _ => {}
            }
        }
        if !failures.is_empty() {
            RunOutcome::Failure(failures)
        } else {
            deadlock.unwrap_or(RunOutcome::Success)
        }
    }

    fn log_summary(&self, wall_secs: f64, sim_time: u64) {
        for line in self.summary_table(wall_secs, sim_time).to_string().lines() {
            info!("{}", line);
        }
        for stats in &self.assertions {
            info!("{}", stats.result_str());
        }
    }

    fn summary_table(&self, wall_secs: f64, sim_time: u64) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.set_titles(Row::new(vec![
            Cell::new("TEST"),
            Cell::new("RESULT"),
            Cell::new("REAL TIME (s)"),
            Cell::new("SIM TIME (steps)"),
            Cell::new("SIM SPEED (steps/s)"),
        ]));
        for r in &self.reports {
            table.add_row(Row::new(vec![
                Cell::new(&r.name),
                Cell::new(r.status_str()),
                Cell::new(&format!("{:.3}", r.wall_secs)),
                Cell::new(&r.sim_time.to_formatted_string(&Locale::en)),
                Cell::new(&sim_speed(r.sim_time, r.wall_secs)),
            ]));
        }
        table.add_row(Row::new(vec![
            Cell::new("TOTAL"),
            Cell::new(&format!(
                "{}/{} passed",
                self.reports.iter().filter(|r| r.passed()).count(),
                self.reports.len()
            )),
            Cell::new(&format!("{:.3}", wall_secs)),
            Cell::new(&sim_time.to_formatted_string(&Locale::en)),
            Cell::new(&sim_speed(sim_time, wall_secs)),
        ]));
        table
    }
}

fn sim_speed(sim_time: u64, wall_secs: f64) -> String {
    if wall_secs <= 0.0 {
        return "-".to_string();
    }
    ((sim_time as f64 / wall_secs) as u64).to_formatted_string(&Locale::en)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_sim::MemSim;
    use crate::trigger::Trigger;

    fn clocked_sim() -> Box<MemSim> {
        let mut mem = MemSim::new();
        let clk = mem.add_signal("clk", 0);
        mem.add_signal("idle", 0);
        mem.add_clock(clk, 10);
        Box::new(mem.with_horizon(10_000))
    }

    async fn wait_two_edges(sim: Sim) -> TaskResult {
        let clk = sim.signal("clk")?;
        clk.rising_edge().await;
        clk.rising_edge().await;
        Ok(Val::Int(sim.now() as i64))
    }

    async fn fail_after_edge(sim: Sim) -> TaskResult {
        sim.signal("clk")?.rising_edge().await;
        Err(sim.assertion_failed("bad"))
    }

    async fn wait_forever(sim: Sim) -> TaskResult {
        sim.signal("idle")?.edge().await;
        Ok(Val::None)
    }

    async fn failing_assertion(sim: Sim) -> TaskResult {
        let clk = sim.signal("clk")?;
        sim.assertion("never", Trigger::rising_edge(clk.id()), |_| Ok(false));
        clk.rising_edge().await;
        clk.rising_edge().await;
        Ok(Val::None)
    }

    #[test]
    fn tests_share_the_simulator_in_order() {
        let mut runner = Runner::new(clocked_sim(), TbConfig::default());
        runner
            .register("first", wait_two_edges)
            .register("second", wait_two_edges);
        assert_eq!(runner.run(), RunOutcome::Success);
        let reports = runner.reports();
        assert_eq!(reports[0].outcome, TestOutcome::Passed(Val::Int(15)));
        assert_eq!(reports[1].outcome, TestOutcome::Passed(Val::Int(35)));
        assert_eq!(reports[1].sim_time, 20);
    }

    #[test]
    fn isolated_failure_does_not_stop_later_tests() {
        let mut runner = Runner::new(clocked_sim(), TbConfig::default());
        runner
            .register("fails", fail_after_edge)
            .register("passes", wait_two_edges);
        let outcome = runner.run();
        assert_eq!(outcome.exit_code(), 1);
        assert!(!runner.reports()[0].passed());
        assert!(runner.reports()[1].passed());
    }

    #[test]
    fn failure_skips_the_rest_without_isolation() {
        let config = TbConfig {
            isolate_tests: false,
            ..TbConfig::default()
        };
        let mut runner = Runner::new(clocked_sim(), config);
        runner
            .register("fails", fail_after_edge)
            .register("skipped", wait_two_edges);
        runner.run();
        assert_eq!(runner.reports()[1].outcome, TestOutcome::Skipped);
    }

    #[test]
    fn deadlock_gives_exit_code_two() {
        let mut runner = Runner::new(clocked_sim(), TbConfig::default());
        runner.register("stuck", wait_forever);
        let outcome = runner.run();
        assert!(matches!(outcome, RunOutcome::Deadlock { .. }));
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn failure_wins_over_deadlock() {
        let mut runner = Runner::new(clocked_sim(), TbConfig::default());
        runner
            .register("fails", fail_after_edge)
            .register("stuck", wait_forever);
        assert_eq!(runner.run().exit_code(), 1);
    }

    #[test]
    fn failed_concurrent_assertion_fails_the_test() {
        let mut runner = Runner::new(clocked_sim(), TbConfig::default());
        runner.register("assert", failing_assertion);
        assert_eq!(runner.run().exit_code(), 1);
        // the check on the last edge still runs after the test returned
        assert_eq!(runner.assertion_stats()[0].triggered, 2);
        assert_eq!(runner.assertion_stats()[0].failed, 2);
    }

    #[test]
    fn writes_junit_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.xml");
        let config = TbConfig {
            junit: Some(path.clone()),
            suite: "runner_suite".to_string(),
            ..TbConfig::default()
        };
        let mut runner = Runner::new(clocked_sim(), config);
        runner.register("first", wait_two_edges);
        runner.run();
        let xml = std::fs::read_to_string(path).unwrap();
        assert!(xml.contains("runner_suite"));
        assert!(xml.contains("first"));
    }

    #[test]
    fn summary_table_lists_every_test() {
        let mut runner = Runner::new(clocked_sim(), TbConfig::default());
        runner
            .register("first", wait_two_edges)
            .register("fails", fail_after_edge);
        runner.run();
        let text = runner.summary_table(1.5, 40).to_string();
        assert!(text.contains("SIM SPEED"));
        assert!(text.contains("first"));
        assert!(text.contains("failed"));
        assert!(text.contains("1/2 passed"));
    }

    #[test]
    fn speed_without_wall_time() {
        assert_eq!(sim_speed(10, 0.0), "-");
        assert_eq!(sim_speed(2_000_000, 2.0), "1,000,000");
    }
}
