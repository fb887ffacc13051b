//! faultline CLI — run error-injection commands against the driver.

use clap::Parser;
use faultline_gateway::device::DeviceGateway;
use faultline_gateway::sim::SimGateway;
use faultline_gateway::{host_online_cpus, CpuFamily, DriverGateway};
use faultline_harness::config::DEFAULT_CONFIG_PATH;
use faultline_harness::orchestrator::{
    CommandPlan, HarnessError, HarnessOptions, QuiesceMode, TestOrchestrator,
};
use faultline_harness::topology::BindingCriterion;
use snafu::Snafu;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// CLI errors for the faultline binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Harness error"), context(false))]
    Harness { source: HarnessError },
    #[snafu(display("Driver error"), context(false))]
    Driver { source: faultline_gateway::DriverError },
    #[snafu(display("{message}"))]
    Other { message: String },
}

#[derive(Parser)]
#[command(name = "faultline")]
#[command(about = "Inject hardware errors through the faultline driver")]
#[command(version)]
struct Cli {
    /// Commands to run, in order (e.g. `udce`, `pdce=0x40001000`)
    #[arg(required = true)]
    commands: Vec<String>,

    /// Driver node path
    #[arg(long, default_value = faultline_gateway::DRIVER_NODE)]
    device: PathBuf,

    /// Run against the in-memory simulated driver
    #[arg(long)]
    dry_run: bool,

    /// Driver debug level
    #[arg(long, default_value_t = 0)]
    debug_level: u32,

    /// Explicit xor corruption pattern (hex or decimal)
    #[arg(short = 'x', long)]
    xor: Option<String>,

    /// Choose random corruption bits within the command's mask
    #[arg(short = 'r', long)]
    random: bool,

    /// Corrupt check bits instead of data bits
    #[arg(long)]
    check_bits: bool,

    /// Corruption byte offset override
    #[arg(long)]
    corrupt_offset: Option<u32>,

    /// Access byte offset override
    #[arg(long)]
    access_offset: Option<u32>,

    /// Per-thread binding criterion, repeatable
    /// (default|cpuid=N|cputype=NAME|local|remote)
    #[arg(short = 'b', long = "bind")]
    bindings: Vec<String>,

    /// Inject only; skip the invocation access
    #[arg(short = 'n', long)]
    no_invoke: bool,

    /// Quiesce sibling CPUs during injection (pause|offline)
    #[arg(short = 'Q', long)]
    quiesce: Option<String>,

    /// Seed for random pattern selection
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Seconds to settle after each command
    #[arg(long, default_value_t = 0)]
    post_sleep: u64,

    /// Config record path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn parse_binding(spec: &str) -> Result<BindingCriterion, CliError> {
    let spec = spec.trim();
    if let Some(id) = spec.strip_prefix("cpuid=") {
        let id = id.parse().map_err(|_| CliError::Other {
            message: format!("invalid cpu id in binding {spec:?}"),
        })?;
        return Ok(BindingCriterion::ByCpuId(id));
    }
    if let Some(name) = spec.strip_prefix("cputype=") {
        let family = match name {
            "kestrel" => CpuFamily::Kestrel,
            "heron" => CpuFamily::Heron,
            other => {
                return Err(CliError::Other {
                    message: format!("unknown cpu type {other:?}"),
                })
            }
        };
        return Ok(BindingCriterion::ByCpuType(family));
    }
    match spec {
        "default" => Ok(BindingCriterion::Default),
        "local" => Ok(BindingCriterion::LocalMemory),
        "remote" => Ok(BindingCriterion::RemoteMemory),
        other => Err(CliError::Other {
            message: format!("unknown binding criterion {other:?}"),
        }),
    }
}

fn parse_quiesce(spec: &str) -> Result<QuiesceMode, CliError> {
    match spec {
        "pause" => Ok(QuiesceMode::Pause),
        "offline" => Ok(QuiesceMode::Offline),
        other => Err(CliError::Other {
            message: format!("unknown quiesce mode {other:?}"),
        }),
    }
}

fn run(cli: Cli) -> Result<u32, CliError> {
    let xor_pattern = match &cli.xor {
        Some(raw) => Some(
            faultline_harness::catalog::parse_numeric(raw).ok_or_else(|| CliError::Other {
                message: format!("invalid xor pattern {raw:?}"),
            })?,
        ),
        None => None,
    };
    let bindings = cli
        .bindings
        .iter()
        .map(|s| parse_binding(s))
        .collect::<Result<Vec<_>, _>>()?;
    let quiesce = match &cli.quiesce {
        Some(spec) => parse_quiesce(spec)?,
        None => QuiesceMode::None,
    };

    let (gateway, expected_online): (Arc<dyn DriverGateway>, Option<u32>) = if cli.dry_run {
        let n = host_online_cpus().max(1);
        (
            Arc::new(SimGateway::uniform(n as usize, CpuFamily::Heron)),
            Some(n),
        )
    } else {
        (Arc::new(DeviceGateway::open(&cli.device)?), None)
    };

    let opts = HarnessOptions {
        debug_level: cli.debug_level,
        config_path: cli.config.clone(),
        post_test_sleep: Duration::from_secs(cli.post_sleep),
        seed: cli.seed,
        bind_os_threads: !cli.dry_run,
        expected_online,
        ..HarnessOptions::default()
    };

    let plans: Vec<CommandPlan> = cli
        .commands
        .iter()
        .map(|input| {
            let mut plan = CommandPlan::new(input);
            plan.xor_pattern = xor_pattern;
            plan.random_pattern = cli.random;
            plan.check_bits = cli.check_bits;
            plan.corrupt_offset = cli.corrupt_offset;
            plan.access_offset = cli.access_offset;
            plan.bindings = bindings.clone();
            plan.no_invoke = cli.no_invoke;
            plan.quiesce = quiesce;
            plan
        })
        .collect();

    let mut orchestrator = TestOrchestrator::new(gateway, opts)?;
    let errors = orchestrator.run_batch(&plans);
    orchestrator.shutdown()?;
    Ok(errors)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(0) => {}
        Ok(errors) => {
            log::error!("{errors} command(s) failed");
            std::process::exit(errors.min(125) as i32);
        }
        Err(e) => {
            log::error!("fatal: {e}");
            std::process::exit(126);
        }
    }
}
