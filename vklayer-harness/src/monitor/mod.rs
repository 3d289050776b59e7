//! The diagnostic monitor.
//!
//! A [`Monitor`] receives every record the validation sink emits, matches it
//! against the expectations armed by the running test and remembers the
//! outcome until the test asks for verification. One monitor is shared by the
//! whole process ([`Monitor::global`]); the debug callback reaches it through
//! the user-data pointer registered with the instance.

pub mod callback;
pub mod record;

use ash::vk;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MonitorConfig;

pub use record::{extract_message_id, DiagnosticRecord, Severity};

/// Every debug-report severity bit.
pub const ALL_SEVERITIES: vk::DebugReportFlagsEXT = vk::DebugReportFlagsEXT::from_raw(
    vk::DebugReportFlagsEXT::INFORMATION.as_raw()
        | vk::DebugReportFlagsEXT::WARNING.as_raw()
        | vk::DebugReportFlagsEXT::PERFORMANCE_WARNING.as_raw()
        | vk::DebugReportFlagsEXT::ERROR.as_raw()
        | vk::DebugReportFlagsEXT::DEBUG.as_raw(),
);

static GLOBAL_MONITOR: Lazy<Arc<Monitor>> =
    Lazy::new(|| Arc::new(Monitor::new(&MonitorConfig::default())));

/// What an armed expectation does with the records it absorbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectationKind {
    /// Must absorb at least one record before verification.
    Desired,
    /// Must absorb nothing; a match is recorded as a failure.
    Unexpected,
    /// Absorbs matching records silently.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct Expectation {
    pub needle: String,
    pub mask: vk::DebugReportFlagsEXT,
    pub matched_count: usize,
    pub kind: ExpectationKind,
    pub armed_at: &'static Location<'static>,
}

impl Expectation {
    fn matches(&self, record: &DiagnosticRecord) -> bool {
        self.mask.intersects(record.severity.flag()) && record.contains(&self.needle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ExpectSuccess,
    ExpectFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Absorbed by the expectation at this index (arming order).
    Absorbed(usize),
    Unmatched,
    /// Dropped because the bailout signal was already raised.
    Discarded,
}

/// Result of classifying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub disposition: Disposition,
    /// Whether the validation layer should skip the call down the chain.
    pub abort_call: bool,
}

/// One line of the per-test diagnostic trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub severity: Severity,
    pub message_id: String,
    pub message: String,
    pub disposition: Disposition,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.severity)?;
        if !self.message_id.is_empty() && !self.message.contains(&self.message_id) {
            write!(f, "{}: ", self.message_id)?;
        }
        write!(f, "{}", self.message)?;
        match self.disposition {
            Disposition::Absorbed(index) => write!(f, " (absorbed by expectation {index})"),
            Disposition::Unmatched => write!(f, " (unmatched)"),
            Disposition::Discarded => write!(f, " (discarded after bailout)"),
        }
    }
}

/// A problem found while verifying, kept until the test scaffolding takes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorFailure {
    ExpectationMiss {
        needle: String,
        armed_at: &'static Location<'static>,
    },
    UnexpectedNeedle {
        needle: String,
        matched_count: usize,
        armed_at: &'static Location<'static>,
    },
    UnexpectedDiagnostic {
        severity: Severity,
        message: String,
        verified_at: &'static Location<'static>,
    },
}

impl MonitorFailure {
    /// The call site most closely tied to this failure.
    pub fn location(&self) -> &'static Location<'static> {
        match self {
            MonitorFailure::ExpectationMiss { armed_at, .. }
            | MonitorFailure::UnexpectedNeedle { armed_at, .. } => armed_at,
            MonitorFailure::UnexpectedDiagnostic { verified_at, .. } => verified_at,
        }
    }
}

impl fmt::Display for MonitorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorFailure::ExpectationMiss { needle, armed_at } => {
                write!(f, "Did not receive expected error '{needle}' (armed at {armed_at})")
            }
            MonitorFailure::UnexpectedNeedle {
                needle,
                matched_count,
                armed_at,
            } => write!(
                f,
                "Unexpected message '{needle}' was reported {matched_count} time(s) (armed at {armed_at})"
            ),
            MonitorFailure::UnexpectedDiagnostic { severity, message, .. } => {
                write!(f, "Expected to succeed but got {severity}: {message}")
            }
        }
    }
}

/// Anything that can be armed as one or more expectation needles.
pub trait Needles {
    fn needles(&self) -> Vec<&str>;
}

impl Needles for str {
    fn needles(&self) -> Vec<&str> {
        vec![self]
    }
}

impl Needles for String {
    fn needles(&self) -> Vec<&str> {
        vec![self.as_str()]
    }
}

impl<T: AsRef<str>> Needles for [T] {
    fn needles(&self) -> Vec<&str> {
        self.iter().map(AsRef::as_ref).collect()
    }
}

impl<T: AsRef<str>, const N: usize> Needles for [T; N] {
    fn needles(&self) -> Vec<&str> {
        self.iter().map(AsRef::as_ref).collect()
    }
}

impl<T: AsRef<str>> Needles for Vec<T> {
    fn needles(&self) -> Vec<&str> {
        self.iter().map(AsRef::as_ref).collect()
    }
}

impl<T: Needles + ?Sized> Needles for &T {
    fn needles(&self) -> Vec<&str> {
        (**self).needles()
    }
}

#[derive(Debug)]
struct UnmatchedRecord {
    severity: Severity,
    message: String,
    /// Counted against an `expect_success` window.
    violation: bool,
}

#[derive(Debug)]
struct MonitorState {
    expectations: Vec<Expectation>,
    mode: Mode,
    success_mask: vk::DebugReportFlagsEXT,
    default_success_mask: vk::DebugReportFlagsEXT,
    other_messages_seen: usize,
    unmatched: Vec<UnmatchedRecord>,
    /// Unmatched records past `trace_capacity`, as (violations, other errors).
    unmatched_dropped: (usize, usize),
    bailout: Option<Arc<AtomicBool>>,
    trace: Vec<TraceEntry>,
    trace_capacity: usize,
    trace_dropped: usize,
    failures: Vec<MonitorFailure>,
    last_armed_at: Option<&'static Location<'static>>,
}

fn default_success_mask(config: &MonitorConfig) -> vk::DebugReportFlagsEXT {
    if config.warnings_fail_success {
        vk::DebugReportFlagsEXT::ERROR | vk::DebugReportFlagsEXT::WARNING
    } else {
        vk::DebugReportFlagsEXT::ERROR
    }
}

impl MonitorState {
    fn new(config: &MonitorConfig) -> Self {
        let mask = default_success_mask(config);
        Self {
            expectations: Vec::new(),
            mode: Mode::ExpectSuccess,
            success_mask: mask,
            default_success_mask: mask,
            other_messages_seen: 0,
            unmatched: Vec::new(),
            unmatched_dropped: (0, 0),
            bailout: None,
            trace: Vec::new(),
            trace_capacity: config.trace_capacity,
            trace_dropped: 0,
            failures: Vec::new(),
            last_armed_at: None,
        }
    }

    fn arm(
        &mut self,
        kind: ExpectationKind,
        mask: vk::DebugReportFlagsEXT,
        needle: &str,
        armed_at: &'static Location<'static>,
    ) {
        if needle.is_empty() {
            warn!("Ignoring empty {:?} needle armed at {}", kind, armed_at);
            return;
        }
        if let Some(other) = self.expectations.iter().find(|e| {
            e.kind != kind && (e.needle.contains(needle) || needle.contains(e.needle.as_str()))
        }) {
            warn!(
                "{:?} needle '{}' (armed at {}) overlaps {:?} needle '{}' (armed at {}); first-armed wins, review this test",
                kind, needle, armed_at, other.kind, other.needle, other.armed_at
            );
        }
        self.expectations.push(Expectation {
            needle: needle.to_string(),
            mask,
            matched_count: 0,
            kind,
            armed_at,
        });
        self.last_armed_at = Some(armed_at);
    }

    fn push_trace(&mut self, record: &DiagnosticRecord, disposition: Disposition) {
        if self.trace.len() < self.trace_capacity {
            self.trace.push(TraceEntry {
                severity: record.severity,
                message_id: record.message_id.clone(),
                message: record.message.clone(),
                disposition,
            });
        } else {
            self.trace_dropped += 1;
        }
    }

    fn push_unmatched(&mut self, record: &DiagnosticRecord, violation: bool) {
        if self.unmatched.len() < self.trace_capacity {
            self.unmatched.push(UnmatchedRecord {
                severity: record.severity,
                message: record.message.clone(),
                violation,
            });
        } else if violation {
            self.unmatched_dropped.0 += 1;
        } else {
            self.unmatched_dropped.1 += 1;
        }
    }

    /// Failures for records that were counted but not kept.
    fn dropped_unmatched_failure(
        &self,
        include_errors: bool,
        verified_at: &'static Location<'static>,
    ) -> Option<MonitorFailure> {
        let (violations, errors) = self.unmatched_dropped;
        let count = if include_errors { violations + errors } else { violations };
        (count > 0).then(|| MonitorFailure::UnexpectedDiagnostic {
            severity: Severity::Error,
            message: format!("{count} more unmatched record(s) not kept"),
            verified_at,
        })
    }

    fn classify(&mut self, record: &DiagnosticRecord) -> Classification {
        if let Some(flag) = &self.bailout {
            if flag.swap(true, Ordering::SeqCst) {
                self.push_trace(record, Disposition::Discarded);
                return Classification {
                    disposition: Disposition::Discarded,
                    abort_call: false,
                };
            }
        }

        let absorbed = self
            .expectations
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.matches(record));

        let classification = match absorbed {
            Some((index, expectation)) => {
                expectation.matched_count += 1;
                Classification {
                    disposition: Disposition::Absorbed(index),
                    abort_call: expectation.kind == ExpectationKind::Desired,
                }
            }
            None => {
                self.other_messages_seen += 1;
                let violation = self.mode == Mode::ExpectSuccess
                    && self.success_mask.intersects(record.severity.flag());
                if violation || record.severity.is_error() {
                    self.push_unmatched(record, violation);
                }
                Classification {
                    disposition: Disposition::Unmatched,
                    abort_call: violation,
                }
            }
        };
        self.push_trace(record, classification.disposition);
        classification
    }

    fn unexpected_needle_failures(&self) -> impl Iterator<Item = MonitorFailure> + '_ {
        self.expectations
            .iter()
            .filter(|e| e.kind == ExpectationKind::Unexpected && e.matched_count > 0)
            .map(|e| MonitorFailure::UnexpectedNeedle {
                needle: e.needle.clone(),
                matched_count: e.matched_count,
                armed_at: e.armed_at,
            })
    }

    /// Ends the armed window: expectations are dropped, mode returns to
    /// `expect_success`. Failures and the trace survive until `reset`.
    fn disarm(&mut self) {
        self.expectations.clear();
        self.unmatched.clear();
        self.unmatched_dropped = (0, 0);
        self.other_messages_seen = 0;
        self.mode = Mode::ExpectSuccess;
        self.success_mask = self.default_success_mask;
        self.bailout = None;
    }
}

/// Process-wide sink for validation diagnostics.
#[derive(Debug)]
pub struct Monitor {
    state: Mutex<MonitorState>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(&MonitorConfig::default())
    }
}

impl Monitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            state: Mutex::new(MonitorState::new(config)),
        }
    }

    /// The monitor shared by every instance the harness creates.
    pub fn global() -> Arc<Monitor> {
        Arc::clone(&GLOBAL_MONITOR)
    }

    /// Applies configuration; takes effect from the next armed window.
    pub fn configure(&self, config: &MonitorConfig) {
        let mut state = self.state.lock();
        state.default_success_mask = default_success_mask(config);
        state.trace_capacity = config.trace_capacity;
        if state.expectations.is_empty() {
            state.success_mask = state.default_success_mask;
        }
    }

    /// Arms a desired expectation and enters `expect_failure` mode.
    #[track_caller]
    pub fn set_desired_failure(&self, mask: vk::DebugReportFlagsEXT, needle: &str) {
        let armed_at = Location::caller();
        let mut state = self.state.lock();
        state.mode = Mode::ExpectFailure;
        state.arm(ExpectationKind::Desired, mask, needle, armed_at);
    }

    /// Arms one desired expectation per needle; all of them must match.
    #[track_caller]
    pub fn set_desired_failures<N: Needles>(&self, mask: vk::DebugReportFlagsEXT, needles: N) {
        let armed_at = Location::caller();
        let mut state = self.state.lock();
        state.mode = Mode::ExpectFailure;
        for needle in needles.needles() {
            state.arm(ExpectationKind::Desired, mask, needle, armed_at);
        }
    }

    /// Arms a needle that must not be reported before verification.
    #[track_caller]
    pub fn set_unexpected(&self, needle: &str) {
        let armed_at = Location::caller();
        self.state
            .lock()
            .arm(ExpectationKind::Unexpected, ALL_SEVERITIES, needle, armed_at);
    }

    /// Arms a needle whose records are absorbed silently, at any severity.
    #[track_caller]
    pub fn set_suppressed(&self, needle: &str) {
        let armed_at = Location::caller();
        self.state
            .lock()
            .arm(ExpectationKind::Suppressed, ALL_SEVERITIES, needle, armed_at);
    }

    /// Enters `expect_success` mode with the configured severity mask.
    #[track_caller]
    pub fn expect_success(&self) {
        let mask = self.state.lock().default_success_mask;
        self.expect_success_with(mask);
    }

    /// Enters `expect_success` mode; unmatched records within `mask` fail.
    ///
    /// Desired expectations cannot coexist with this mode and are dropped.
    #[track_caller]
    pub fn expect_success_with(&self, mask: vk::DebugReportFlagsEXT) {
        let caller = Location::caller();
        let mut state = self.state.lock();
        let before = state.expectations.len();
        state
            .expectations
            .retain(|e| e.kind != ExpectationKind::Desired);
        if state.expectations.len() != before {
            warn!(
                "expect_success at {} dropped {} desired expectation(s)",
                caller,
                before - state.expectations.len()
            );
        }
        state.mode = Mode::ExpectSuccess;
        state.success_mask = mask;
        state.last_armed_at = Some(caller);
    }

    pub fn expect_failure(&self) {
        self.state.lock().mode = Mode::ExpectFailure;
    }

    /// Registers a flag raised by the first record that arrives. Records
    /// arriving after it is raised are discarded.
    pub fn set_bailout(&self, flag: Arc<AtomicBool>) {
        self.state.lock().bailout = Some(flag);
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Classifies one record. Called from the debug callback.
    pub fn classify(&self, record: &DiagnosticRecord) -> Classification {
        self.state.lock().classify(record)
    }

    /// Checks that every desired expectation matched at least once since it
    /// was armed, then disarms.
    ///
    /// Returns whether all desired expectations were satisfied. Unexpected
    /// needles that matched and `expect_success` violations are recorded as
    /// failures as well; see [`Monitor::take_failures`].
    #[track_caller]
    pub fn verify_found(&self) -> bool {
        let verified_at = Location::caller();
        let mut state = self.state.lock();

        let misses: Vec<MonitorFailure> = state
            .expectations
            .iter()
            .filter(|e| e.kind == ExpectationKind::Desired && e.matched_count == 0)
            .map(|e| MonitorFailure::ExpectationMiss {
                needle: e.needle.clone(),
                armed_at: e.armed_at,
            })
            .collect();
        let satisfied = misses.is_empty();
        if !satisfied && state.other_messages_seen > 0 {
            debug!(
                "{} other message(s) were seen while expectations were missed",
                state.other_messages_seen
            );
        }

        let unexpected: Vec<MonitorFailure> = state.unexpected_needle_failures().collect();
        let mut violations: Vec<MonitorFailure> = state
            .unmatched
            .iter()
            .filter(|r| r.violation)
            .map(|r| MonitorFailure::UnexpectedDiagnostic {
                severity: r.severity,
                message: r.message.clone(),
                verified_at,
            })
            .collect();
        violations.extend(state.dropped_unmatched_failure(false, verified_at));

        state.failures.extend(misses);
        state.failures.extend(unexpected);
        state.failures.extend(violations);
        state.disarm();
        satisfied
    }

    /// Checks that no error was reported since the window was armed, then
    /// disarms. Returns `true` when nothing was recorded as a failure.
    #[track_caller]
    pub fn verify_not_found(&self) -> bool {
        let verified_at = Location::caller();
        let mut state = self.state.lock();
        let mut found: Vec<MonitorFailure> = state
            .unmatched
            .iter()
            .filter(|r| r.violation || r.severity.is_error())
            .map(|r| MonitorFailure::UnexpectedDiagnostic {
                severity: r.severity,
                message: r.message.clone(),
                verified_at,
            })
            .collect();
        found.extend(state.dropped_unmatched_failure(true, verified_at));
        found.extend(state.unexpected_needle_failures());
        found.extend(
            state
                .expectations
                .iter()
                .filter(|e| e.kind == ExpectationKind::Desired && e.matched_count > 0)
                .map(|e| MonitorFailure::UnexpectedDiagnostic {
                    severity: Severity::Error,
                    message: format!("'{}' matched {} time(s)", e.needle, e.matched_count),
                    verified_at,
                }),
        );
        let clean = found.is_empty();
        state.failures.extend(found);
        state.disarm();
        clean
    }

    /// Drops every expectation, failure and trace line.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.disarm();
        state.failures.clear();
        state.trace.clear();
        state.trace_dropped = 0;
        state.last_armed_at = None;
    }

    /// True when expectations are armed or an unverified violation is pending.
    pub fn pending_verification(&self) -> bool {
        let state = self.state.lock();
        !state.expectations.is_empty()
            || state.unmatched_dropped.0 > 0
            || state.unmatched.iter().any(|r| r.violation)
    }

    pub fn take_failures(&self) -> Vec<MonitorFailure> {
        std::mem::take(&mut self.state.lock().failures)
    }

    pub fn has_failures(&self) -> bool {
        !self.state.lock().failures.is_empty()
    }

    pub fn expectations(&self) -> Vec<Expectation> {
        self.state.lock().expectations.clone()
    }

    pub fn other_messages_seen(&self) -> usize {
        self.state.lock().other_messages_seen
    }

    pub fn last_armed_at(&self) -> Option<&'static Location<'static>> {
        self.state.lock().last_armed_at
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.state.lock().trace.clone()
    }

    /// The trace rendered one record per line.
    pub fn trace_lines(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut lines: Vec<String> = state.trace.iter().map(ToString::to_string).collect();
        if state.trace_dropped > 0 {
            lines.push(format!("... {} more record(s) not kept", state.trace_dropped));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const ERROR: vk::DebugReportFlagsEXT = vk::DebugReportFlagsEXT::ERROR;

    fn error(body: &str) -> DiagnosticRecord {
        DiagnosticRecord::new(Severity::Error, body)
    }

    fn failure_kinds(failures: &[MonitorFailure]) -> Vec<&'static str> {
        failures
            .iter()
            .map(|f| match f {
                MonitorFailure::ExpectationMiss { .. } => "miss",
                MonitorFailure::UnexpectedNeedle { .. } => "needle",
                MonitorFailure::UnexpectedDiagnostic { .. } => "diagnostic",
            })
            .collect()
    }

    #[test]
    fn first_armed_expectation_wins() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "viewport");
        monitor.set_desired_failure(ERROR, "Dynamic viewport(s) 0");

        let c = monitor.classify(&error("Dynamic viewport(s) 0 are used by pipeline state object"));
        assert_eq!(c.disposition, Disposition::Absorbed(0));
        assert!(c.abort_call);
        let counts: Vec<usize> = monitor.expectations().iter().map(|e| e.matched_count).collect();
        assert_eq!(counts, vec![1, 0]);

        // The second needle never matched, so verification fails on it alone.
        assert!(!monitor.verify_found());
        let failures = monitor.take_failures();
        assert_eq!(failure_kinds(&failures), vec!["miss"]);
    }

    #[test]
    fn expectations_absorb_repeatedly() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "VUID-vkCmdDrawIndexed");
        for _ in 0..3 {
            monitor.classify(&error("[ VUID-vkCmdDrawIndexed-indexSize-00463 ] index size"));
        }
        assert_eq!(monitor.expectations()[0].matched_count, 3);
        assert!(monitor.verify_found());
        assert!(monitor.take_failures().is_empty());
    }

    #[test]
    fn severity_mask_must_intersect() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(vk::DebugReportFlagsEXT::WARNING, "sharing");
        let c = monitor.classify(&error("sharing mode mismatch"));
        assert_eq!(c.disposition, Disposition::Unmatched);
        assert!(!c.abort_call);
        assert!(!monitor.verify_found());
    }

    #[test]
    fn needle_matches_structured_id() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "VUID-vkFreeCommandBuffers-pCommandBuffers-parent");
        let record = error("command buffer was allocated from another pool")
            .with_message_id("VUID-vkFreeCommandBuffers-pCommandBuffers-parent");
        assert_eq!(monitor.classify(&record).disposition, Disposition::Absorbed(0));
        assert!(monitor.verify_found());
    }

    #[test]
    fn success_mode_flags_unmatched_errors_only() {
        let monitor = Monitor::default();
        monitor.expect_success();
        let warn = DiagnosticRecord::new(Severity::Warning, "harmless warning");
        assert!(!monitor.classify(&warn).abort_call);
        assert!(monitor.verify_not_found());

        monitor.expect_success();
        let c = monitor.classify(&error("Something went wrong"));
        assert!(c.abort_call);
        assert!(!monitor.verify_not_found());
        assert_eq!(failure_kinds(&monitor.take_failures()), vec!["diagnostic"]);
    }

    #[test]
    fn warnings_fail_success_when_configured() {
        let monitor = Monitor::new(&MonitorConfig {
            warnings_fail_success: true,
            ..MonitorConfig::default()
        });
        monitor.expect_success();
        monitor.classify(&DiagnosticRecord::new(Severity::Warning, "layout mismatch"));
        assert!(!monitor.verify_not_found());
    }

    #[test]
    fn suppressed_needles_cover_cascades_in_success_mode() {
        let monitor = Monitor::default();
        monitor.expect_success();
        monitor.set_suppressed("All elements of pCommandBuffers must not be in the pending state");
        let c = monitor.classify(&error(
            "All elements of pCommandBuffers must not be in the pending state",
        ));
        assert_eq!(c.disposition, Disposition::Absorbed(0));
        assert!(!c.abort_call);
        assert!(monitor.verify_not_found());
    }

    #[test]
    fn failure_mode_tolerates_unrelated_errors() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "Duplicate stage flags found in ranges 0 and 1");
        monitor.classify(&error("some cascading error"));
        monitor.classify(&error(
            "vkCreatePipelineLayout() Duplicate stage flags found in ranges 0 and 1.",
        ));
        assert_eq!(monitor.other_messages_seen(), 1);
        assert!(monitor.verify_found());
        assert!(monitor.take_failures().is_empty());
        assert_eq!(monitor.mode(), Mode::ExpectSuccess);
    }

    #[test]
    fn unexpected_needle_is_recorded_not_raised() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "VUID-vkQueueSubmit-pCommandBuffers-00072");
        monitor.set_unexpected("pending state");
        monitor.classify(&error("[ VUID-vkQueueSubmit-pCommandBuffers-00072 ]"));
        let c = monitor.classify(&error("buffer is in the pending state"));
        assert!(!c.abort_call);
        assert!(monitor.verify_found());
        assert_eq!(failure_kinds(&monitor.take_failures()), vec!["needle"]);
    }

    #[test]
    fn desired_match_fails_positive_verification() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "index size");
        monitor.classify(&error("vkCmdDrawIndexed() index size 2 * 513"));
        assert!(!monitor.verify_not_found());
    }

    #[test]
    fn expect_success_drops_desired() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "never");
        monitor.set_suppressed("cascade");
        monitor.expect_success();
        let kinds: Vec<ExpectationKind> = monitor.expectations().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ExpectationKind::Suppressed]);
        assert_eq!(monitor.mode(), Mode::ExpectSuccess);
    }

    #[test]
    fn bailout_discards_after_first_record() {
        let monitor = Monitor::default();
        let flag = Arc::new(AtomicBool::new(false));
        monitor.set_desired_failure(ERROR, "THREADING");
        monitor.set_bailout(Arc::clone(&flag));

        let first = monitor.classify(&error("THREADING ERROR : object in use"));
        assert_eq!(first.disposition, Disposition::Absorbed(0));
        assert!(flag.load(Ordering::SeqCst));
        let second = monitor.classify(&error("THREADING ERROR : object in use"));
        assert_eq!(second.disposition, Disposition::Discarded);
        assert_eq!(monitor.expectations()[0].matched_count, 1);
    }

    #[test]
    fn trace_tags_dispositions_and_respects_capacity() {
        let monitor = Monitor::new(&MonitorConfig {
            trace_capacity: 2,
            ..MonitorConfig::default()
        });
        monitor.set_desired_failure(ERROR, "needle");
        monitor.classify(&error("has needle"));
        monitor.classify(&error("other"));
        monitor.classify(&error("dropped"));
        let lines = monitor.trace_lines();
        assert_eq!(
            lines,
            vec![
                "[error] has needle (absorbed by expectation 0)".to_string(),
                "[error] other (unmatched)".to_string(),
                "... 1 more record(s) not kept".to_string(),
            ]
        );
        monitor.reset();
        assert!(monitor.trace().is_empty());
    }

    #[test]
    fn last_armed_location_points_at_caller() {
        let monitor = Monitor::default();
        assert!(monitor.last_armed_at().is_none());
        monitor.set_desired_failure(ERROR, "x");
        let location = monitor.last_armed_at().unwrap();
        assert!(location.file().ends_with("mod.rs"));
        assert!(monitor.pending_verification());
        monitor.reset();
        assert!(!monitor.pending_verification());
    }

    #[test]
    fn needles_accept_single_and_many() {
        assert_eq!("a".needles(), vec!["a"]);
        assert_eq!(["a", "b"].needles(), vec!["a", "b"]);
        assert_eq!(vec![String::from("c")].needles(), vec!["c"]);

        let monitor = Monitor::default();
        monitor.set_desired_failures(ERROR, ["VUID-a", "VUID-b"]);
        assert_eq!(monitor.expectations().len(), 2);
    }

    #[test]
    fn empty_needles_are_ignored() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(ERROR, "");
        assert!(monitor.expectations().is_empty());
    }

    /// Classification equals "first expectation whose mask and needle match"
    /// over a small exhaustive set of streams.
    #[test]
    fn classifier_is_first_match_over_streams() {
        let needles = ["alpha", "beta", "alphabet"];
        let masks = [ERROR, vk::DebugReportFlagsEXT::WARNING, ERROR | vk::DebugReportFlagsEXT::WARNING];
        let bodies = ["alphabet soup", "beta test", "gamma", "alpha"];
        let severities = [Severity::Error, Severity::Warning];

        for mask_pick in 0..masks.len() {
            let monitor = Monitor::default();
            for (i, needle) in needles.iter().enumerate() {
                monitor.set_desired_failure(masks[(i + mask_pick) % masks.len()], needle);
            }
            let armed = monitor.expectations();
            for body in bodies {
                for severity in severities {
                    let record = DiagnosticRecord::new(severity, body);
                    let expected = armed
                        .iter()
                        .position(|e| e.mask.intersects(severity.flag()) && body.contains(&e.needle))
                        .map_or(Disposition::Unmatched, Disposition::Absorbed);
                    assert_eq!(monitor.classify(&record).disposition, expected);
                }
            }
            monitor.reset();
        }
    }

    #[rstest]
    #[case(Severity::Info)]
    #[case(Severity::PerformanceWarning)]
    #[case(Severity::Debug)]
    fn unexpected_and_suppressed_needles_see_every_severity(#[case] severity: Severity) {
        let monitor = Monitor::default();
        monitor.expect_failure();
        monitor.set_unexpected("stale descriptor");
        monitor.set_suppressed("best practice");
        let hit = monitor.classify(&DiagnosticRecord::new(severity, "stale descriptor"));
        assert_eq!(hit.disposition, Disposition::Absorbed(0));
        let quiet = monitor.classify(&DiagnosticRecord::new(severity, "best practice hint"));
        assert_eq!(quiet.disposition, Disposition::Absorbed(1));
        assert!(ALL_SEVERITIES.contains(severity.flag()));
    }

    #[test]
    fn unmatched_records_are_capped_but_still_counted() {
        let monitor = Monitor::new(&MonitorConfig {
            trace_capacity: 2,
            ..MonitorConfig::default()
        });
        monitor.expect_success();
        for n in 0..5 {
            monitor.classify(&error(&format!("stray error {n}")));
        }
        assert_eq!(monitor.state.lock().unmatched.len(), 2);
        assert!(monitor.pending_verification());
        assert!(!monitor.verify_not_found());
        let messages: Vec<String> = monitor.take_failures().iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            vec![
                "Expected to succeed but got error: stray error 0".to_string(),
                "Expected to succeed but got error: stray error 1".to_string(),
                "Expected to succeed but got error: 3 more unmatched record(s) not kept".to_string(),
            ]
        );
        assert_eq!(monitor.state.lock().unmatched_dropped, (0, 0));
    }
}
