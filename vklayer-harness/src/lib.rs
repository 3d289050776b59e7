//! # Vulkan validation-layer negative tests (`vklayer-harness`)
//!
//! Drives a Vulkan implementation through deliberately invalid call
//! sequences with the validation layer loaded, and checks that the layer
//! reports exactly the diagnostics each test expects.
//!
//! ## Structure
//!
//! - **Diagnostic monitor** ([`monitor`]): receives every layer record through
//!   the debug callback, matches it against the needles a test armed, and
//!   turns misses and surprises into failures.
//! - **Device harness** ([`device`], [`objects`]): instance, physical device,
//!   logical device, default command pool/buffer, render target and owning
//!   wrappers for the objects tests create, each tracked in a handle ledger.
//! - **Pipeline builders** ([`pipeline`]): graphics, compute and
//!   `VK_NV_ray_tracing` pipelines with valid defaults that a test edits
//!   before creation.
//! - **Tests** ([`testcase`], [`registry`], [`runner`], [`suites`]): test
//!   prerequisites and outcome judgement, name filtering and the run summary.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vklayer_harness::{config::HarnessConfig, runner, suites, testcase::TestEnvironment};
//!
//! let config = HarnessConfig::load(None)?;
//! vklayer_harness::logging::init_logging(&config.logging)?;
//! let env = TestEnvironment::new(config);
//! let summary = runner::run(&suites::registry(), &env, &Default::default())?;
//! std::process::exit(summary.exit_code());
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod objects;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod shader;
pub mod suites;
pub mod testcase;

pub use config::HarnessConfig;
pub use device::{DeviceContext, HarnessDevice, HarnessInstance};
pub use error::{HarnessError, Result};
pub use monitor::{Mode, Monitor};
pub use registry::{Registry, TestFilter};
pub use runner::{RunOptions, RunSummary};
pub use testcase::{Outcome, TestCase, TestContext, TestEnvironment};
