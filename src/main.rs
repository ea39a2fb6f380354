mod batch;
mod config;
mod driver;
mod ledger;
mod logging;
mod monitor;
mod probe;
mod reaper;
mod retry;
mod signals;
mod status;
mod videos;
mod workflow;

use clap::{Parser, Subcommand};
use config::RenderwatchConfig;
use monitor::{RenderMonitor, WatchSettings};
use probe::{CommandProbe, DurationProbe};
use reaper::{Reaper, Termination};
use signals::ShutdownSignal;
use std::path::PathBuf;
use std::process::ExitCode;

/// Batch-drives a telemetry overlay application's video exports and decides
/// when each render is finished by watching the output file.
#[derive(Parser, Debug)]
#[command(name = "renderwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "renderwatch.toml", global = true)]
    config: PathBuf,

    /// Debug logging (every check, phase changes, retry decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings, errors and the summary
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every unprocessed video in the input folder
    Run {
        /// Input folder (overrides config)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output folder (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Max in-run retries per video (overrides config)
        #[arg(long)]
        retries: Option<u32>,

        /// Validate config and list pending videos, don't run
        #[arg(long)]
        dry_run: bool,
    },
    /// Monitor a single output file until its render completes
    Watch {
        /// File being rendered
        path: PathBuf,
    },
    /// Print the playable duration of a media file
    Probe {
        path: PathBuf,
    },
    /// Kill the overlay application
    Reap,
}

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match RenderwatchConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            logging::init(cli.verbose, cli.quiet, None);
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if let Command::Run {
        input,
        output,
        retries,
        ..
    } = &cli.command
    {
        if let Some(dir) = input {
            cfg.batch.input_dir = dir.clone();
        }
        if let Some(dir) = output {
            cfg.batch.output_dir = dir.clone();
        }
        if let Some(n) = retries {
            cfg.batch.max_retries = *n;
        }
    }
    let cfg = cfg;

    logging::init(cli.verbose, cli.quiet, cfg.logging.file.as_deref());
    tracing::debug!(?cli, "parsed CLI arguments");

    match cfg.validate() {
        Ok(warnings) => {
            for w in warnings {
                tracing::warn!("{w}");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    }

    let shutdown = match ShutdownSignal::install() {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handlers");
            ShutdownSignal::channel().1
        }
    };

    match &cli.command {
        Command::Run { dry_run: true, .. } => dry_run(&cfg),
        Command::Run { .. } => run_batch(&cfg, &shutdown).await,
        Command::Watch { path } => watch_one(&cfg, path, &shutdown).await,
        Command::Probe { path } => {
            match CommandProbe::new(&cfg.probe).probe(path).await {
                Some(secs) => {
                    println!("{secs:.3} ({})", probe::format_duration(secs));
                    ExitCode::SUCCESS
                }
                None => {
                    println!("unknown");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Reap => {
            let reaper = Reaper::new(
                reaper::platform_terminator(),
                cfg.app.process_name.as_str(),
                cfg.app.reap_settle(),
            );
            match reaper.reap().await {
                Termination::Killed(n) => println!("killed {n} {} process(es)", reaper.process_name()),
                Termination::NotRunning => println!("{} is not running", reaper.process_name()),
            }
            ExitCode::SUCCESS
        }
    }
}

fn dry_run(cfg: &RenderwatchConfig) -> ExitCode {
    let b = &cfg.batch;
    let m = &cfg.monitor;
    println!("Dry run: config validated, not running.");
    println!("  input folder:     {}", b.input_dir.display());
    println!("  output folder:    {}", b.output_dir.display());
    println!("  extension:        {}", b.extension);
    println!("  ledger:           {}", b.ledger_path().display());
    println!("  max file size:    {} GB", b.max_file_size_gb);
    println!(
        "  duration match:   {} (tolerance {}s)",
        b.match_source_duration, b.duration_tolerance_secs
    );
    println!("  retries:          {}", b.max_retries);
    println!("  application:      {}", cfg.app.process_name);
    println!("  driver:           {} {}", cfg.driver.command, cfg.driver.args.join(" "));
    println!("  probe:            {} {}", cfg.probe.command, cfg.probe.args.join(" "));
    println!(
        "  monitor:          timeout {}, check every {}, stable for {}, post-render wait {}, stuck after {} checks",
        monitor::format_elapsed(m.timeout()),
        monitor::format_elapsed(m.check_interval()),
        monitor::format_elapsed(m.stability_duration()),
        monitor::format_elapsed(m.post_render_wait()),
        m.max_stuck_checks
    );

    if !b.input_dir.is_dir() {
        println!("Input folder does not exist.");
        return ExitCode::FAILURE;
    }
    let ledger = ledger::ProcessedLedger::load(b.ledger_path());
    match batch::pending_videos(b, &ledger) {
        Ok(pending) => {
            println!(
                "{} pending, {} already processed:",
                pending.len(),
                ledger.len()
            );
            for job in pending {
                println!("  {} -> {}", job.source_name, job.output.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to list videos");
            ExitCode::FAILURE
        }
    }
}

async fn run_batch(cfg: &RenderwatchConfig, shutdown: &ShutdownSignal) -> ExitCode {
    let monitor = RenderMonitor::new(
        WatchSettings::from(&cfg.monitor),
        CommandProbe::new(&cfg.probe),
    )
    .with_status(status::StatusFile::new(cfg.batch.status_path()));
    let reaper = Reaper::new(
        reaper::platform_terminator(),
        cfg.app.process_name.as_str(),
        cfg.app.reap_settle(),
    );
    let workflow = workflow::Workflow::new(
        workflow::VerifySettings::from(cfg),
        cfg.app.cache_dir.clone(),
        driver::CommandDriver::new(&cfg.driver),
        monitor,
        reaper,
    );

    match batch::run(&cfg.batch, &workflow, shutdown).await {
        Ok(summary) => {
            println!();
            println!("Processed:          {}", summary.processed.len());
            println!("Failed:             {}", summary.failed.len());
            println!("Already processed:  {}", summary.already_processed);
            for name in &summary.failed {
                println!("  failed: {name}");
            }
            if summary.interrupted {
                println!("Interrupted.");
                ExitCode::from(EXIT_INTERRUPTED)
            } else if summary.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "batch aborted");
            ExitCode::FAILURE
        }
    }
}

async fn watch_one(
    cfg: &RenderwatchConfig,
    path: &std::path::Path,
    shutdown: &ShutdownSignal,
) -> ExitCode {
    let monitor = RenderMonitor::new(
        WatchSettings::from(&cfg.monitor),
        CommandProbe::new(&cfg.probe),
    );
    match monitor.watch(path, shutdown).await {
        Ok(outcome) => {
            let size = monitor::format_size(outcome.final_size());
            match outcome.duration() {
                Some(secs) => println!("verified: {} ({size})", probe::format_duration(secs)),
                None if outcome.success() => println!("settled ({size})"),
                None => println!("settled but unverified ({size})"),
            }
            if outcome.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(monitor::MonitorError::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            println!("{e}");
            ExitCode::FAILURE
        }
    }
}
