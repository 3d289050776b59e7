//! One registered test: its prerequisites, the body and how its outcome is
//! judged.
//!
//! [`TestCase::run`] resets the monitor, brings up an instance and device
//! for the test, skips it when a prerequisite is absent, runs the body under
//! `catch_unwind`, verifies whatever the body left armed and finally tears
//! the device down, failing on unarmed diagnostics raised by the teardown
//! and on handles left in the ledger.

use ash::vk;
use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{format_api_version, HarnessConfig};
use crate::device::{
    DeviceContext, DeviceOptions, FeatureRequest, HarnessInstance, PhysicalDeviceInfo, RenderTargetSpec,
    TeardownReport,
};
use crate::error::{HarnessError, Result};
use crate::monitor::{Mode, Monitor, MonitorFailure, Needles};
use crate::shader::{default_compiler, ShaderCompiler};

/// The function a test runs once its context is up.
pub type TestBody = fn(&mut TestContext) -> Result<()>;

/// What a test needs from the environment. Anything missing makes the test
/// skip instead of fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub api_version: Option<u32>,
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
    /// Core features to enable; every supported one by default.
    pub features: FeatureRequest,
    /// Render target created before the body runs; `None` for no target.
    pub render_target: Option<RenderTargetSpec>,
}

#[derive(Clone)]
pub struct TestCase {
    name: &'static str,
    requirements: Requirements,
    body: TestBody,
}

impl TestCase {
    /// A test with no prerequisites beyond the default render target.
    pub fn new(name: &'static str, body: TestBody) -> Self {
        Self {
            name,
            requirements: Requirements {
                render_target: Some(RenderTargetSpec::default()),
                ..Requirements::default()
            },
            body,
        }
    }

    pub fn api_version(mut self, version: u32) -> Self {
        self.requirements.api_version = Some(version);
        self
    }

    pub fn instance_extension(mut self, name: &str) -> Self {
        self.requirements.instance_extensions.push(name.to_string());
        self
    }

    pub fn device_extension(mut self, name: &str) -> Self {
        self.requirements.device_extensions.push(name.to_string());
        self
    }

    /// Enables only the named features from here on; an unsupported one
    /// skips the test.
    pub fn feature(mut self, name: &str) -> Self {
        match &mut self.requirements.features {
            FeatureRequest::Named(names) => names.push(name.to_string()),
            request => *request = FeatureRequest::named([name]),
        }
        self
    }

    /// Runs on a device with every optional feature disabled.
    pub fn no_features(mut self) -> Self {
        self.requirements.features = FeatureRequest::none();
        self
    }

    pub fn render_target(mut self, spec: Option<RenderTargetSpec>) -> Self {
        self.requirements.render_target = spec;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    /// Runs the test to an outcome. Never panics because of the body.
    pub fn run(&self, env: &TestEnvironment) -> Outcome {
        info!(test = self.name, "Running");
        env.monitor.reset();

        let mut ctx = match self.prepare(env) {
            Ok(ctx) => ctx,
            Err(e) => return self.early_outcome(env, e),
        };

        let body = self.body;
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut ctx)));
        let outcome = match result {
            Ok(Ok(())) => {
                if env.monitor.pending_verification() {
                    debug!(test = self.name, "Verifying the window left armed by the body");
                    match env.monitor.mode() {
                        Mode::ExpectFailure => env.monitor.verify_found(),
                        Mode::ExpectSuccess => env.monitor.verify_not_found(),
                    };
                }
                self.judge_monitor(env)
            }
            Ok(Err(e)) if e.is_missing_prerequisite() => Outcome::Skipped(e.to_string()),
            Ok(Err(e)) => {
                let kind = if e.is_fatal() {
                    FailureKind::Fatal
                } else {
                    FailureKind::DriverError
                };
                Outcome::Failed(self.report(env, kind, e.to_string(), e.location()))
            }
            Err(payload) => Outcome::Failed(self.report(
                env,
                FailureKind::Crashed,
                format!("test body panicked: {}", panic_message(payload.as_ref())),
                None,
            )),
        };

        let TestContext { device, .. } = ctx;
        let teardown = device.teardown();
        let outcome = self.judge_teardown(env, outcome, &teardown);
        env.monitor.reset();
        outcome
    }

    /// A passing test still fails on diagnostics nobody armed for during
    /// teardown, then on handles the ledger still holds.
    fn judge_teardown(&self, env: &TestEnvironment, outcome: Outcome, teardown: &TeardownReport) -> Outcome {
        if !outcome.is_passed() {
            return outcome;
        }
        if env.monitor.pending_verification() {
            debug!(test = self.name, "Diagnostics reported during teardown");
            env.monitor.verify_not_found();
            let judged = self.judge_monitor(env);
            if !judged.is_passed() {
                return judged;
            }
        }
        if !teardown.is_clean() {
            let mut lines: Vec<String> = teardown.outstanding.iter().map(ToString::to_string).collect();
            lines.extend(teardown.violations.iter().map(ToString::to_string));
            return Outcome::Failed(self.report(
                env,
                FailureKind::HandleLeak,
                format!("handles not released at teardown:\n  {}", lines.join("\n  ")),
                None,
            ));
        }
        outcome
    }

    fn prepare(&self, env: &TestEnvironment) -> Result<TestContext> {
        let req = &self.requirements;
        let instance = HarnessInstance::new(
            &env.config.vulkan,
            &req.instance_extensions,
            Arc::clone(&env.monitor),
        )?;
        let physical = PhysicalDeviceInfo::select(&instance, vk::QueueFlags::GRAPHICS)?;

        if let Some(required) = req.api_version {
            let available = instance.api_version().min(physical.properties.api_version);
            if available < required {
                return Err(HarnessError::MissingPrerequisite(format!(
                    "API version {} (have {})",
                    format_api_version(required),
                    format_api_version(available)
                )));
            }
        }
        if let Some(missing) = req
            .device_extensions
            .iter()
            .find(|ext| !physical.supports_extension(ext))
        {
            return Err(HarnessError::MissingPrerequisite(format!(
                "device extension {missing}"
            )));
        }

        let options = DeviceOptions {
            device_extensions: req.device_extensions.clone(),
            features: req.features.clone(),
            render_target_extent: env.config.vulkan.render_target_extent(),
            compiler: Some(Arc::clone(&env.compiler)),
            ..DeviceOptions::default()
        };
        let mut device = DeviceContext::new(instance, physical, &options)?;
        if let Some(spec) = req.render_target {
            device.init_render_target(spec)?;
        }
        Ok(TestContext {
            device,
            monitor: Arc::clone(&env.monitor),
            name: self.name,
        })
    }

    fn early_outcome(&self, env: &TestEnvironment, error: HarnessError) -> Outcome {
        match error {
            e if e.is_missing_prerequisite() => Outcome::Skipped(e.to_string()),
            HarnessError::NoSuitableDevice(flags) => {
                Outcome::Skipped(format!("no physical device with a {flags:?} queue"))
            }
            HarnessError::Loading(e) => Outcome::Skipped(format!("no Vulkan loader: {e}")),
            e => {
                let kind = if e.is_fatal() {
                    FailureKind::Fatal
                } else {
                    FailureKind::DriverError
                };
                Outcome::Failed(self.report(env, kind, format!("setup failed: {e}"), e.location()))
            }
        }
    }

    fn judge_monitor(&self, env: &TestEnvironment) -> Outcome {
        let failures = env.monitor.take_failures();
        let Some(first) = failures.first() else {
            return Outcome::Passed;
        };
        let kind = FailureKind::from(first);
        let site = Some(first.location());
        let message = failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        Outcome::Failed(self.report(env, kind, message, site))
    }

    fn report(
        &self,
        env: &TestEnvironment,
        kind: FailureKind,
        message: String,
        site: Option<&'static Location<'static>>,
    ) -> FailureReport {
        FailureReport {
            test_name: self.name.to_string(),
            kind,
            message,
            monitor_trace: env.monitor.trace_lines(),
            offending_call_site: site.or_else(|| env.monitor.last_armed_at()).map(ToString::to_string),
        }
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("requirements", &self.requirements)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Process-wide pieces every test shares.
#[derive(Debug)]
pub struct TestEnvironment {
    pub config: HarnessConfig,
    pub monitor: Arc<Monitor>,
    pub compiler: Arc<dyn ShaderCompiler>,
}

impl TestEnvironment {
    /// Uses the global monitor, reconfigured from `config`.
    pub fn new(config: HarnessConfig) -> Self {
        let monitor = Monitor::global();
        monitor.configure(&config.monitor);
        let compiler = default_compiler(&config.shaders);
        info!("Shader compiler: {}", compiler.name());
        Self {
            config,
            monitor,
            compiler,
        }
    }
}

/// What a test body works with: the device context (through `Deref`) and
/// the monitor.
pub struct TestContext {
    device: DeviceContext,
    monitor: Arc<Monitor>,
    name: &'static str,
}

impl TestContext {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    #[track_caller]
    pub fn set_desired_failure(&self, mask: vk::DebugReportFlagsEXT, needle: &str) {
        self.monitor.set_desired_failure(mask, needle);
    }

    #[track_caller]
    pub fn set_desired_failures<N: Needles>(&self, mask: vk::DebugReportFlagsEXT, needles: N) {
        self.monitor.set_desired_failures(mask, needles);
    }

    /// Shorthand for an error-severity desired failure.
    #[track_caller]
    pub fn expect_error(&self, needle: &str) {
        self.monitor.set_desired_failure(vk::DebugReportFlagsEXT::ERROR, needle);
    }

    #[track_caller]
    pub fn set_unexpected(&self, needle: &str) {
        self.monitor.set_unexpected(needle);
    }

    #[track_caller]
    pub fn set_suppressed(&self, needle: &str) {
        self.monitor.set_suppressed(needle);
    }

    #[track_caller]
    pub fn expect_success(&self) {
        self.monitor.expect_success();
    }

    #[track_caller]
    pub fn verify_found(&self) -> bool {
        self.monitor.verify_found()
    }

    #[track_caller]
    pub fn verify_not_found(&self) -> bool {
        self.monitor.verify_not_found()
    }
}

impl Deref for TestContext {
    type Target = DeviceContext;

    fn deref(&self) -> &DeviceContext {
        &self.device
    }
}

impl DerefMut for TestContext {
    fn deref_mut(&mut self) -> &mut DeviceContext {
        &mut self.device
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("name", &self.name)
            .field("device", &self.device)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ExpectationMiss,
    UnexpectedDiagnostic,
    UnexpectedNeedle,
    DriverError,
    Fatal,
    Crashed,
    HandleLeak,
}

impl From<&MonitorFailure> for FailureKind {
    fn from(failure: &MonitorFailure) -> Self {
        match failure {
            MonitorFailure::ExpectationMiss { .. } => FailureKind::ExpectationMiss,
            MonitorFailure::UnexpectedNeedle { .. } => FailureKind::UnexpectedNeedle,
            MonitorFailure::UnexpectedDiagnostic { .. } => FailureKind::UnexpectedDiagnostic,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ExpectationMiss => "expectation miss",
            FailureKind::UnexpectedDiagnostic => "unexpected diagnostic",
            FailureKind::UnexpectedNeedle => "unexpected needle",
            FailureKind::DriverError => "driver error",
            FailureKind::Fatal => "fatal",
            FailureKind::Crashed => "crashed",
            FailureKind::HandleLeak => "handle leak",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub test_name: String,
    pub kind: FailureKind,
    pub message: String,
    /// Diagnostics seen during the test, one per line.
    pub monitor_trace: Vec<String>,
    pub offending_call_site: Option<String>,
}

impl FailureReport {
    /// Renders the report; the trace is included only when asked for.
    pub fn render(&self, with_trace: bool) -> String {
        let mut out = format!("{} failed ({})", self.test_name, self.kind);
        if let Some(site) = &self.offending_call_site {
            out.push_str(&format!(" at {site}"));
        }
        for line in self.message.lines() {
            out.push_str("\n    ");
            out.push_str(line);
        }
        if with_trace && !self.monitor_trace.is_empty() {
            out.push_str("\n  monitor trace:");
            for line in &self.monitor_trace {
                out.push_str("\n    ");
                out.push_str(line);
            }
        }
        out
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(FailureReport),
    Skipped(String),
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    /// True for failures after which later tests may see a broken driver.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Failed(report) if report.kind == FailureKind::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShaderError;
    use pretty_assertions::assert_eq;

    fn noop(_: &mut TestContext) -> Result<()> {
        Ok(())
    }

    #[test]
    fn builder_collects_requirements() {
        let case = TestCase::new("RayTracing", noop)
            .api_version(vk::API_VERSION_1_1)
            .instance_extension("VK_KHR_get_physical_device_properties2")
            .device_extension("VK_NV_ray_tracing")
            .feature("depthBounds");
        let req = case.requirements();
        assert_eq!(req.api_version, Some(vk::API_VERSION_1_1));
        assert_eq!(req.device_extensions, vec!["VK_NV_ray_tracing".to_string()]);
        assert_eq!(req.features, FeatureRequest::named(["depthBounds"]));
        assert_eq!(
            TestCase::new("NoFeatures", noop).no_features().requirements().features,
            FeatureRequest::none()
        );
        assert_eq!(TestCase::new("All", noop).requirements().features, FeatureRequest::AllSupported);
        assert_eq!(req.render_target, Some(RenderTargetSpec::default()));
    }

    fn environment() -> TestEnvironment {
        TestEnvironment {
            config: HarnessConfig::default(),
            monitor: Arc::new(Monitor::default()),
            compiler: default_compiler(&Default::default()),
        }
    }

    #[test]
    fn missing_prerequisites_become_skips() {
        let env = environment();
        let case = TestCase::new("FakeExtension", noop);
        let outcome = case.early_outcome(
            &env,
            HarnessError::MissingPrerequisite("device extension VK_EXT_fake_missing".into()),
        );
        assert!(outcome.is_skipped());
        let outcome = case.early_outcome(
            &env,
            HarnessError::Shader(ShaderError::CompilerUnavailable {
                language: "GLSL",
                reason: "glslangValidator not found on PATH".into(),
            }),
        );
        assert!(outcome.is_skipped());
        let outcome = case.early_outcome(&env, HarnessError::NoSuitableDevice(vk::QueueFlags::GRAPHICS));
        assert!(outcome.is_skipped());
    }

    #[test]
    fn fatal_errors_taint_the_outcome() {
        let env = environment();
        let case = TestCase::new("Setup", noop);
        let outcome = case.early_outcome(&env, HarnessError::Fatal("vkCreateDevice returned ERROR_INITIALIZATION_FAILED".into()));
        assert!(outcome.is_fatal());
        let outcome = case.early_outcome(
            &env,
            HarnessError::vulkan("vkAllocateCommandBuffers", vk::Result::ERROR_OUT_OF_HOST_MEMORY),
        );
        match outcome {
            Outcome::Failed(report) => {
                assert_eq!(report.kind, FailureKind::DriverError);
                assert_eq!(report.test_name, "Setup");
                assert!(report.offending_call_site.is_some());
            }
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn monitor_failures_map_to_kinds() {
        let monitor = Monitor::default();
        monitor.set_desired_failure(vk::DebugReportFlagsEXT::ERROR, "VUID-never");
        monitor.verify_found();
        let failures = monitor.take_failures();
        assert_eq!(FailureKind::from(&failures[0]), FailureKind::ExpectationMiss);
    }

    #[test]
    fn report_renders_site_and_optional_trace() {
        let report = FailureReport {
            test_name: "PushConstantRangeOverlap".into(),
            kind: FailureKind::ExpectationMiss,
            message: "Did not receive expected error 'Duplicate stage flags'".into(),
            monitor_trace: vec!["[ERROR] something else (unmatched)".into()],
            offending_call_site: Some("src/suites/objects.rs:42:9".into()),
        };
        let short = report.render(false);
        assert_eq!(
            short,
            "PushConstantRangeOverlap failed (expectation miss) at src/suites/objects.rs:42:9\n    \
             Did not receive expected error 'Duplicate stage flags'"
        );
        let long = report.render(true);
        assert!(long.ends_with("monitor trace:\n    [ERROR] something else (unmatched)"));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn unarmed_teardown_error_fails_a_passing_test() {
        let env = environment();
        let case = TestCase::new("DestroyInUse", noop);
        env.monitor.classify(&crate::monitor::DiagnosticRecord::new(
            crate::monitor::Severity::Error,
            "[ VUID-vkDestroyDevice-device-00378 ] VkFence 0x5 has not been destroyed",
        ));
        let outcome = case.judge_teardown(&env, Outcome::Passed, &TeardownReport::default());
        match outcome {
            Outcome::Failed(report) => {
                assert_eq!(report.kind, FailureKind::UnexpectedDiagnostic);
                assert!(report.message.contains("VUID-vkDestroyDevice-device-00378"));
            }
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn quiet_teardown_keeps_the_outcome() {
        let env = environment();
        let case = TestCase::new("Quiet", noop);
        env.monitor.classify(&crate::monitor::DiagnosticRecord::new(
            crate::monitor::Severity::Info,
            "loader message",
        ));
        assert!(case
            .judge_teardown(&env, Outcome::Passed, &TeardownReport::default())
            .is_passed());
        let skipped = Outcome::Skipped("no device".into());
        assert_eq!(
            case.judge_teardown(&env, skipped.clone(), &TeardownReport::default()),
            skipped
        );
    }

    #[test]
    fn ledger_leftovers_fail_after_a_quiet_teardown() {
        let env = environment();
        let case = TestCase::new("Leaky", noop);
        let teardown = TeardownReport {
            outstanding: vec![crate::device::LedgerEntry {
                object_type: vk::ObjectType::FENCE,
                raw: 0x5,
                label: "fence",
            }],
            violations: Vec::new(),
        };
        match case.judge_teardown(&env, Outcome::Passed, &teardown) {
            Outcome::Failed(report) => assert_eq!(report.kind, FailureKind::HandleLeak),
            other => panic!("expected a failure, got {other:?}"),
        }
    }
}
