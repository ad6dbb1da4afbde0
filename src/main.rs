use latcannon::bench::{Benchmark, BenchmarkConfig};
use latcannon::config::Config;
use latcannon::http::{self, HttpRequesterFactory};
use latcannon::{distribution, timer};

use chrono::{SecondsFormat, TimeDelta, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[command(name = "latcannon")]
#[command(about = "Closed-loop latency benchmarking harness for request/response services")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "latcannon.toml")]
    config: PathBuf,

    /// Path for the latency distribution file (overrides config)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Emit the summary as JSON in addition to the table
    #[arg(long)]
    json: bool,

    /// Force the spin-polling ticker regardless of timer resolution
    #[arg(long)]
    tight_ticker: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::load(&cli.config)?;
    if let Some(out) = cli.out {
        config.output.file = out;
    }
    if cli.json {
        config.bench.output_json = true;
    }
    if cli.tight_ticker {
        config.bench.tight_ticker = true;
    }
    config.validate()?;

    timer::init_high_resolution();

    // Set up signal handler for graceful early shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::Relaxed);
    })?;

    let client = http::build_client(
        config.request.protocol,
        config.bench.reuse_connections,
        config.bench.request_timeout,
    )?;
    let factory = HttpRequesterFactory::new(&config.request, client)?;

    let bench_config = BenchmarkConfig::new(
        config.bench.request_rate,
        config.bench.effective_connections(),
        config.bench.duration,
        config.bench.base_latency,
        config.bench.tight_ticker,
    )?;
    tracing::info!(
        connections = bench_config.connections,
        rate = bench_config.request_rate,
        duration = ?bench_config.duration,
        protocol = ?config.request.protocol,
        "starting benchmark"
    );

    // Stamps pad the run window by 5s on each side for plot alignment.
    println!(
        "time start = {}",
        (Utc::now() - TimeDelta::seconds(5)).to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    let benchmark = Benchmark::new(bench_config, Box::new(factory));
    let summary = benchmark.run(config.bench.output_json, running)?;

    println!(
        "time end   = {}",
        (Utc::now() + TimeDelta::seconds(5)).to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    println!("{summary}");

    if let Some(parent) = config.output.file.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    distribution::write_distribution(
        &summary.histogram,
        None,
        distribution::LOGARITHMIC,
        &config.output.file,
    )?;
    tracing::info!(file = %config.output.file.display(), "latency distribution written");

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}
