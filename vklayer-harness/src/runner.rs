//! Runs selected tests one after another and summarizes the outcomes.

use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::registry::{Registry, TestFilter};
use crate::testcase::{Outcome, TestCase, TestEnvironment};

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
/// Every selected test was skipped.
pub const EXIT_ALL_SKIPPED: i32 = 77;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub filter: TestFilter,
    /// Stop after the first failure.
    pub fail_fast: bool,
    /// Print the monitor trace of failed tests.
    pub print_traces: bool,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: &'static str,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<TestResult>,
    /// A fatal failure happened; later results may reflect a broken driver.
    pub tainted: bool,
    /// Selected tests not run because of `fail_fast`.
    pub not_run: usize,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_passed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed() - self.skipped()
    }

    pub fn failed_names(&self) -> Vec<&'static str> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
            .map(|r| r.name)
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            EXIT_FAILED
        } else if !self.results.is_empty() && self.skipped() == self.results.len() {
            EXIT_ALL_SKIPPED
        } else {
            EXIT_PASSED
        }
    }

    /// The closing tally, one item per line.
    pub fn render(&self) -> String {
        let mut out = format!(
            "[==========] {} test(s) ran: {} passed, {} failed, {} skipped",
            self.results.len(),
            self.passed(),
            self.failed(),
            self.skipped()
        );
        if self.not_run > 0 {
            out.push_str(&format!("\n[ NOT RUN  ] {} test(s) after the first failure", self.not_run));
        }
        for name in self.failed_names() {
            out.push_str(&format!("\n[  FAILED  ] {name}"));
        }
        if self.tainted {
            out.push_str("\n[ TAINTED  ] a fatal failure occurred; rerun the remaining tests in a fresh process");
        }
        out
    }
}

/// The status line printed after a test finishes.
pub fn outcome_line(result: &TestResult, print_traces: bool) -> String {
    let ms = result.elapsed.as_millis();
    match &result.outcome {
        Outcome::Passed => format!("[  PASSED  ] {} ({ms} ms)", result.name),
        Outcome::Skipped(reason) => format!("[ SKIPPED  ] {}: {reason}", result.name),
        Outcome::Failed(report) => {
            format!("[  FAILED  ] {} ({ms} ms)\n{}", result.name, report.render(print_traces))
        }
    }
}

/// Runs `tests` through `execute`, writing one status line per test to `out`.
pub fn run_with<'a, W, F>(
    tests: impl IntoIterator<Item = &'a TestCase>,
    options: &RunOptions,
    out: &mut W,
    mut execute: F,
) -> std::io::Result<RunSummary>
where
    W: Write,
    F: FnMut(&TestCase) -> Outcome,
{
    let mut summary = RunSummary::default();
    let mut tests = tests.into_iter();
    while let Some(test) = tests.next() {
        writeln!(out, "[ RUN      ] {}", test.name())?;
        let started = Instant::now();
        let outcome = execute(test);
        let result = TestResult {
            name: test.name(),
            outcome,
            elapsed: started.elapsed(),
        };
        writeln!(out, "{}", outcome_line(&result, options.print_traces))?;

        let failed = matches!(result.outcome, Outcome::Failed(_));
        if result.outcome.is_fatal() {
            error!(test = result.name, "Fatal failure; marking the run tainted");
            summary.tainted = true;
        }
        summary.results.push(result);
        if failed && options.fail_fast {
            summary.not_run = tests.count();
            break;
        }
    }
    writeln!(out, "{}", summary.render())?;
    Ok(summary)
}

/// Runs every registered test the filter selects.
pub fn run(registry: &Registry, env: &TestEnvironment, options: &RunOptions) -> std::io::Result<RunSummary> {
    let selected: Vec<&TestCase> = registry.select(&options.filter).collect();
    if selected.is_empty() {
        warn!("No test matched the filter");
    } else {
        info!("Running {} of {} test(s)", selected.len(), registry.len());
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with(selected, options, &mut out, |test| test.run(env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::testcase::{FailureKind, FailureReport, TestContext};
    use pretty_assertions::assert_eq;

    fn noop(_: &mut TestContext) -> Result<()> {
        Ok(())
    }

    fn failure(name: &str, kind: FailureKind) -> Outcome {
        Outcome::Failed(FailureReport {
            test_name: name.to_string(),
            kind,
            message: "boom".to_string(),
            monitor_trace: vec!["[ERROR] boom (unmatched)".to_string()],
            offending_call_site: None,
        })
    }

    fn cases(names: &[&'static str]) -> Vec<TestCase> {
        names.iter().map(|&n| TestCase::new(n, noop)).collect()
    }

    fn run_scripted(names: &[&'static str], options: &RunOptions, script: impl Fn(&str) -> Outcome) -> (RunSummary, String) {
        let tests = cases(names);
        let mut out = Vec::new();
        let summary = run_with(&tests, options, &mut out, |t| script(t.name())).unwrap();
        (summary, String::from_utf8(out).unwrap())
    }

    #[test]
    fn all_passing_exits_zero() {
        let (summary, text) = run_scripted(&["A", "B"], &RunOptions::default(), |_| Outcome::Passed);
        assert_eq!(summary.exit_code(), EXIT_PASSED);
        assert_eq!(summary.passed(), 2);
        assert!(text.contains("[ RUN      ] A\n[  PASSED  ] A"));
    }

    #[test]
    fn any_failure_exits_one() {
        let (summary, text) = run_scripted(&["A", "B", "C"], &RunOptions::default(), |name| match name {
            "B" => failure(name, FailureKind::ExpectationMiss),
            "C" => Outcome::Skipped("missing VK_NV_ray_tracing".into()),
            _ => Outcome::Passed,
        });
        assert_eq!(summary.exit_code(), EXIT_FAILED);
        assert_eq!((summary.passed(), summary.failed(), summary.skipped()), (1, 1, 1));
        assert_eq!(summary.failed_names(), vec!["B"]);
        assert!(text.contains("[ SKIPPED  ] C: missing VK_NV_ray_tracing"));
        assert!(!summary.tainted);
    }

    #[test]
    fn all_skipped_exits_77() {
        let (summary, _) = run_scripted(&["A", "B"], &RunOptions::default(), |_| {
            Outcome::Skipped("no device".into())
        });
        assert_eq!(summary.exit_code(), EXIT_ALL_SKIPPED);
    }

    #[test]
    fn nothing_selected_exits_zero() {
        let (summary, text) = run_scripted(&[], &RunOptions::default(), |_| Outcome::Passed);
        assert_eq!(summary.exit_code(), EXIT_PASSED);
        assert!(text.starts_with("[==========] 0 test(s) ran"));
    }

    #[test]
    fn fail_fast_stops_and_counts_the_rest() {
        let options = RunOptions {
            fail_fast: true,
            ..RunOptions::default()
        };
        let (summary, text) = run_scripted(&["A", "B", "C", "D"], &options, |name| match name {
            "B" => failure(name, FailureKind::DriverError),
            _ => Outcome::Passed,
        });
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.not_run, 2);
        assert!(!text.contains("[ RUN      ] C"));
    }

    #[test]
    fn fatal_failures_taint_the_run() {
        let (summary, text) = run_scripted(&["A", "B"], &RunOptions::default(), |name| match name {
            "A" => failure(name, FailureKind::Fatal),
            _ => Outcome::Passed,
        });
        assert!(summary.tainted);
        assert_eq!(summary.results.len(), 2);
        assert!(text.contains("[ TAINTED  ]"));
    }

    #[test]
    fn traces_are_printed_only_on_request() {
        let result = TestResult {
            name: "A",
            outcome: failure("A", FailureKind::UnexpectedDiagnostic),
            elapsed: Duration::from_millis(3),
        };
        assert!(!outcome_line(&result, false).contains("monitor trace"));
        assert!(outcome_line(&result, true).contains("[ERROR] boom (unmatched)"));
    }
}
