use junit_report::{Duration, ReportBuilder, TestCase, TestCaseBuilder, TestSuiteBuilder};
use std::path::Path;

use crate::error::ReportError;
use crate::test::{TestOutcome, TestReport};

fn test_case(report: &TestReport) -> TestCase {
    let duration = Duration::seconds_f64(report.wall_secs);
    match &report.outcome {
        TestOutcome::Passed(_) => TestCaseBuilder::success(&report.name, duration),
        TestOutcome::Failed(_) => {
            TestCaseBuilder::failure(&report.name, duration, "failure", &report.message())
        }
        TestOutcome::Deadlock { .. } => {
            TestCaseBuilder::error(&report.name, duration, "deadlock", &report.message())
        }
        TestOutcome::Skipped => TestCaseBuilder::skipped(&report.name),
    }
    .build()
}

/// Write `reports` as a single JUnit test suite to `path`.
pub fn write_junit(path: &Path, suite: &str, reports: &[TestReport]) -> Result<(), ReportError> {
    let test_suite = TestSuiteBuilder::new(suite)
        .add_testcases(reports.iter().map(test_case))
        .build();
    let report = ReportBuilder::new().add_testsuite(test_suite).build();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::File::create(path)?;
    report
        .write_xml(file)
        .map_err(|e| ReportError::Xml(e.to_string()))
}
