use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use boardmedic::config::{EngineConfig, LoggingConfig};
use boardmedic::engine::memory::FaultInjection;
use boardmedic::engine::ProgressCallback;
use boardmedic::{report, Backend, CancellationToken, LoadEngine, RunRequest, RunStatus, Sample};

#[derive(Parser)]
#[command(
    name = "boardmedic",
    about = "CPU and RAM load diagnostics for single-board computers",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $BOARDMEDIC_CONFIG, then /etc/boardmedic/boardmedic.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every core and sample utilization and temperature
    Cpu(CpuArgs),

    /// Write and verify a pattern across a block of memory
    Ram(RamArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct CpuArgs {
    /// Test duration in seconds
    #[arg(long, conflicts_with = "quick")]
    duration: Option<u64>,

    /// Number of load workers (default: logical core count)
    #[arg(long)]
    workers: Option<usize>,

    /// Sampling interval in seconds
    #[arg(long)]
    interval: Option<f64>,

    /// Load generator
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Short 3-second check
    #[arg(long)]
    quick: bool,

    /// JSON output for machine parsing
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RamArgs {
    /// Total memory to test, in MB
    #[arg(long, conflicts_with = "quick")]
    total_mb: Option<u64>,

    /// Chunk size, in MB
    #[arg(long, conflicts_with = "quick")]
    chunk_mb: Option<u64>,

    /// Number of write/verify passes
    #[arg(long, conflicts_with = "quick")]
    passes: Option<u32>,

    /// Short 64 MB check
    #[arg(long)]
    quick: bool,

    /// JSON output for machine parsing
    #[arg(long)]
    json: bool,

    /// Corrupt the byte at this offset during the first pass
    #[arg(long, hide = true)]
    inject_fault: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Builtin,
    StressNg,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Builtin => Backend::Builtin,
            BackendArg::StressNg => Backend::StressNg,
        }
    }
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cpu_request(config: &EngineConfig, args: &CpuArgs) -> RunRequest {
    let mut req = config.cpu_request();
    if args.quick {
        req.target = RunRequest::cpu_quick().target;
    } else if let Some(secs) = args.duration {
        req.target = RunRequest::cpu(Duration::from_secs(secs)).target;
    }
    if let Some(workers) = args.workers {
        req = req.with_workers(workers);
    }
    if let Some(secs) = args.interval {
        req = req.with_sample_interval(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO));
    }
    if let Some(backend) = args.backend {
        req = req.with_backend(backend.into());
    }
    req
}

fn ram_request(config: &EngineConfig, args: &RamArgs) -> RunRequest {
    if args.quick {
        return RunRequest::ram_quick();
    }
    let mut config = config.clone();
    if let Some(total_mb) = args.total_mb {
        config.ram.total_mb = total_mb;
    }
    if let Some(chunk_mb) = args.chunk_mb {
        config.ram.chunk_mb = chunk_mb;
    }
    if let Some(passes) = args.passes {
        config.ram.passes = passes;
    }
    config.ram_request()
}

async fn run(engine: LoadEngine, request: RunRequest, json: bool) -> Result<ExitCode> {
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping load test");
            on_interrupt.cancel();
        }
    });

    let progress: Option<ProgressCallback> = if json {
        None
    } else {
        Some(Box::new(|sample: &Sample| -> Result<()> {
            println!("{}", report::format_sample_line(sample));
            Ok(())
        }))
    };

    let result =
        boardmedic::run_load_test_async(Arc::new(engine), request, progress, Some(token)).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\n{}", report::format_summary(&result));
    }

    Ok(match result.status {
        RunStatus::Ok => ExitCode::SUCCESS,
        RunStatus::Fail => ExitCode::from(1),
        RunStatus::Unsupported => ExitCode::from(2),
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = EngineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.log_json);

    match cli.command {
        Commands::Cpu(args) => {
            let request = cpu_request(&config, &args);
            tracing::info!(?request, "Running CPU load test");
            run(LoadEngine::from_config(&config), request, args.json).await
        }
        Commands::Ram(args) => {
            let request = ram_request(&config, &args);
            tracing::info!(?request, "Running RAM load test");
            let mut engine = LoadEngine::from_config(&config);
            if let Some(offset) = args.inject_fault {
                engine = engine.with_buffers(Arc::new(FaultInjection::at_offset(offset)));
            }
            run(engine, request, args.json).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
