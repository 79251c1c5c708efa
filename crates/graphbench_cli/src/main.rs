//! `graphbench [EPOCHS] [STREAMS] [KERNELS_PER_STREAM] [ARRAY_EXP] [BLOCK] [MULTITHREADED]`
//!
//! Runs one benchmark configuration, validates the device result against the
//! host reference and prints a single result line to stdout.

use std::{ffi::OsString, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::{Parser, ValueEnum, error::ErrorKind};
use graphbench::prelude::*;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "graphbench", version, about, long_about = None)]
#[command(allow_negative_numbers = true)]
struct Cli {
    /// Number of epochs; negative values use the default
    #[arg(default_value_t = 10)]
    epochs: i64,
    /// Independent streams (graph slots)
    #[arg(default_value_t = 1)]
    streams: i64,
    /// Sequential kernels per stream (graph layers)
    #[arg(default_value_t = 4)]
    kernels_per_stream: i64,
    /// Array size exponent p; the buffer holds 2 << p elements
    #[arg(default_value_t = 20)]
    array_exp: i64,
    /// Threads per block
    #[arg(default_value_t = 128)]
    block: i64,
    /// Dispatch streams from a worker pool when nonzero
    #[arg(default_value_t = 0)]
    multithreaded: i64,

    #[arg(long, value_enum, default_value_t = StrategyArg::Streams)]
    strategy: StrategyArg,
    #[arg(long, value_enum, default_value_t = KernelName::Newton)]
    kernel: KernelName,
    /// Timed repetitions of the whole run
    #[arg(long, default_value_t = 1)]
    repetitions: usize,
    #[arg(long, value_enum, default_value_t = UpdateModeArg::Diff)]
    update_mode: UpdateModeArg,
    #[arg(long, value_enum, default_value_t = Backend::Native)]
    backend: Backend,
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,
    /// Skip the host-side check of the result
    #[arg(long)]
    no_validate: bool,
    /// Tracing filter directives, e.g. `graphbench=debug`. Overrides RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,
    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Streams,
    Graph,
    GraphUpdate,
    Split,
    SplitUpdate,
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Streams => Strategy::Streams,
            StrategyArg::Graph => Strategy::Graph,
            StrategyArg::GraphUpdate => Strategy::GraphUpdate,
            StrategyArg::Split => Strategy::Split,
            StrategyArg::SplitUpdate => Strategy::SplitUpdate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KernelName {
    Newton,
    Update,
}

impl From<KernelName> for KernelOp {
    fn from(k: KernelName) -> Self {
        match k {
            KernelName::Newton => KernelOp::Newton,
            KernelName::Update => KernelOp::Update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum UpdateModeArg {
    Diff,
    Replace,
}

impl From<UpdateModeArg> for UpdateMode {
    fn from(m: UpdateModeArg) -> Self {
        match m {
            UpdateModeArg::Diff => UpdateMode::Diff,
            UpdateModeArg::Replace => UpdateMode::Replace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Native,
    /// Requires the `cuda` feature
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Csv,
    Json,
}

/// Fully resolved run settings.
#[derive(Debug)]
struct Settings {
    config: RunConfig,
    backend: Backend,
    format: Format,
    validate: bool,
}

/// Negative positional values select the default.
fn or_default(value: i64, default: usize) -> usize {
    usize::try_from(value).unwrap_or(default)
}

impl Settings {
    fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let exp = or_default(cli.array_exp, 20);
        let array_size = u32::try_from(exp)
            .ok()
            .and_then(|p| 2usize.checked_shl(p))
            .filter(|&n| n != 0)
            .with_context(|| format!("array size exponent {exp} is too large"))?;
        let block = u32::try_from(or_default(cli.block, 128))
            .context("block size does not fit in 32 bits")?;
        let params = Params::new(
            or_default(cli.epochs, 10),
            or_default(cli.streams, 1),
            or_default(cli.kernels_per_stream, 4),
            cli.repetitions,
            array_size,
            block,
        )?;
        let mut config = RunConfig::new(params, cli.strategy.into());
        config.op = cli.kernel.into();
        config.update_mode = cli.update_mode.into();
        config.multithreaded = or_default(cli.multithreaded, 0) != 0;
        Ok(Self {
            config,
            backend: cli.backend,
            format: cli.format,
            validate: !cli.no_validate,
        })
    }
}

/// Whether the run's result matched the host reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Passed,
    Mismatch,
}

/// Compare a run's output with the host reference, printing the outcome.
fn check(outcome: &RunOutcome) -> Verdict {
    match validate(
        &outcome.kernel,
        &outcome.input,
        outcome.applications,
        &outcome.output,
    ) {
        Ok(()) => {
            eprintln!("Validation passed");
            Verdict::Passed
        }
        Err(e) => {
            println!("Validation failed: {e}");
            Verdict::Mismatch
        }
    }
}

/// Graph strategies issue every launch from one thread.
fn ignores_multithreaded(config: &RunConfig) -> bool {
    config.multithreaded && config.strategy.uses_graph()
}

fn bench<R: Runtime>(runtime: &R, settings: &Settings) -> anyhow::Result<Verdict> {
    let config = &settings.config;
    info!(
        backend = runtime.name(),
        strategy = ?config.strategy,
        epochs = config.params.epochs(),
        streams = config.params.slots(),
        kernels_per_stream = config.params.kernels_per_slot(),
        array_size = config.params.total_elements(),
        "starting run"
    );
    if ignores_multithreaded(config) {
        warn!(
            strategy = ?config.strategy,
            "multithreaded dispatch only applies to the streams strategy"
        );
    }
    let outcome = execute(runtime, config)?;

    if settings.validate && check(&outcome) == Verdict::Mismatch {
        return Ok(Verdict::Mismatch);
    }

    let report = BenchReport::new(
        &config.params,
        config.strategy,
        config.multithreaded,
        runtime.name(),
        &outcome.timings,
    );
    match settings.format {
        Format::Csv => println!("{}", report.csv_line()),
        Format::Json => println!("{}", report.to_json().context("failed to encode report")?),
    }
    Ok(Verdict::Passed)
}

fn run(settings: &Settings) -> anyhow::Result<Verdict> {
    match settings.backend {
        Backend::Native => bench(&NativeRuntime::new(), settings),
        #[cfg(feature = "cuda")]
        Backend::Cuda => bench(
            &graphbench_cuda::CudaRuntime::new(0).context("failed to open CUDA device 0")?,
            settings,
        ),
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => anyhow::bail!("this binary was built without the `cuda` feature"),
    }
}

/// Parse the command line. On failure clap's message is printed and the
/// process status is returned instead: 0 for help and version, 1 otherwise.
fn parse<I, T>(args: I) -> Result<Cli, u8>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::try_parse_from(args).map_err(|e| {
        if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
            let _ = e.print();
            0
        } else {
            println!("{e}");
            1
        }
    })
}

/// Run a parsed command line and map the result to a process status.
fn status(cli: &Cli) -> u8 {
    let settings = match Settings::from_cli(cli) {
        Ok(settings) => settings,
        Err(e) => {
            println!("{e:#}");
            return 1;
        }
    };
    match run(&settings) {
        Ok(Verdict::Passed) => 0,
        Ok(Verdict::Mismatch) => 1,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

fn main() -> ExitCode {
    let cli = match parse(std::env::args_os()) {
        Ok(cli) => cli,
        Err(code) => return ExitCode::from(code),
    };

    let mut trace = graphbench_tracing::subscriber();
    if let Some(filter) = &cli.log_filter {
        trace = trace.env_filter(filter);
    }
    if let Some(path) = &cli.log_file {
        trace = trace.log_file(path);
    }
    let _session = match trace.init() {
        Ok(session) => session,
        Err(e) => {
            println!("{e}");
            return ExitCode::from(1);
        }
    };

    ExitCode::from(status(&cli))
}
