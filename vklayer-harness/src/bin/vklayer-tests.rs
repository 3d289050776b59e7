use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use vklayer_harness::config::{HarnessConfig, CONFIG_ENV_VAR};
use vklayer_harness::logging::{init_logging, log_loader_environment};
use vklayer_harness::registry::TestFilter;
use vklayer_harness::runner::{self, RunOptions};
use vklayer_harness::suites;
use vklayer_harness::testcase::TestEnvironment;

/// Runs Vulkan validation-layer negative tests.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Tests to run: `POS1:POS2-NEG1:NEG2`, with `*` and `?` wildcards
    #[arg(long, default_value = "*")]
    filter: String,
    /// Stop after the first failing test
    #[arg(long)]
    fail_fast: bool,
    /// Print the diagnostic trace of failing tests
    #[arg(long)]
    print_traces: bool,
    /// List the registered tests and exit
    #[arg(long)]
    list: bool,
    /// TOML configuration file
    #[arg(long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,
    /// Log level, overriding the configuration (`RUST_LOG` still wins)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = HarnessConfig::load(args.config.as_deref()).context("Failed to load the configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    let registry = suites::registry();
    let filter = TestFilter::parse(&args.filter);
    if args.list {
        for name in registry.names().filter(|name| filter.matches(name)) {
            println!("{name}");
        }
        return Ok(());
    }
    for name in registry.case_collisions() {
        warn!("Test name {} differs from another only by case", name);
    }

    log_loader_environment();
    info!(
        "Validation layer {} via {:?}",
        config.vulkan.validation_layer, config.vulkan.callback
    );
    let env = TestEnvironment::new(config);
    let options = RunOptions {
        filter,
        fail_fast: args.fail_fast,
        print_traces: args.print_traces,
    };
    let summary = runner::run(&registry, &env, &options).context("Failed to write the run report")?;
    std::process::exit(summary.exit_code());
}
