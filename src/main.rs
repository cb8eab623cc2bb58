use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use spectro_daq::logging::{init_logging, parse_level};
use spectro_daq::mock::MockDevice;
use spectro_daq::{
    DaqConfig, Engine, Link, Mode, ReadStrategy, Sample, SeriesCursor, StopReason, ValueDecoder,
};

/// How often new stream samples are printed, like a plot refresh.
const POLL_INTERVAL: Duration = Duration::from_millis(90);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Stream,
    OnDemand,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Quantity {
    Voltage,
    Absorbance,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    Count,
    Drain,
}

#[derive(Parser, Debug)]
#[command(name = "spectro-daq", about = "Acquire samples from an Arduino DAQ sketch")]
struct Args {
    /// Serial port (e.g. /dev/ttyACM0, COM3). Overrides the config file.
    port: Option<String>,
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Acquisition mode
    #[arg(short, long, value_enum, default_value = "stream")]
    mode: CliMode,
    /// Stop after this many samples
    #[arg(short = 'n', long, default_value_t = 100)]
    samples: usize,
    #[arg(long)]
    baud: Option<u32>,
    /// Sample delay in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long, value_enum)]
    quantity: Option<Quantity>,
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,
    /// Talk to a simulated device instead of a serial port
    #[arg(long)]
    simulate: bool,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let level: Option<LevelFilter> = match args.log_level.as_deref() {
        Some(s) => Some(parse_level(s).with_context(|| format!("invalid log level {s:?}"))?),
        None => None,
    };
    init_logging(level);

    let config = build_config(&args)?;
    let runtime = tokio::runtime::Runtime::new().context("tokio runtime init failed")?;
    runtime.block_on(acquire(args, config))
}

fn build_config(args: &Args) -> Result<DaqConfig> {
    let mut config = match &args.config {
        Some(path) => DaqConfig::load(path)?,
        None => DaqConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(delay) = args.delay_ms {
        config.sample_delay_ms = delay;
    }
    if let Some(quantity) = args.quantity {
        config.decoder = match quantity {
            Quantity::Voltage => ValueDecoder::Voltage,
            Quantity::Absorbance => ValueDecoder::Absorbance,
        };
    }
    if let Some(strategy) = args.strategy {
        config.strategy = match strategy {
            Strategy::Count => ReadStrategy::Count,
            Strategy::Drain => ReadStrategy::Drain,
        };
    }
    config.validate()?;
    Ok(config)
}

async fn acquire(args: Args, config: DaqConfig) -> Result<()> {
    let unit = config.decoder.unit();

    let mut engine = if args.simulate {
        println!("--- Using simulated device ---");
        let link = Link::from_channel(Box::new(MockDevice::new()));
        Engine::start(link, DaqConfig { settle_delay_ms: 0, ..config }).await?
    } else {
        if config.port.is_none() {
            bail!("no serial port given (pass PORT, set `port` in --config, or use --simulate)");
        }
        println!("--- Connecting to {} ---", config.port.as_deref().unwrap_or_default());
        Engine::connect(config).await.context("could not start acquisition")?
    };

    let result = match args.mode {
        CliMode::Stream => stream(&engine, args.samples, unit).await,
        CliMode::OnDemand => on_demand(&engine, args.samples, unit).await,
    };

    println!("Stopping...");
    let stopped = engine.shutdown().await;
    result?;
    stopped?;
    println!("Done.");
    Ok(())
}

fn print_sample(sample: &Sample, unit: &str) {
    println!("{:>10} ms  {:>9.4} {}", sample.timestamp_ms, sample.value, unit);
}

async fn stream(engine: &Engine, n_samples: usize, unit: &str) -> Result<()> {
    engine.set_mode(Mode::Streaming).await?;
    println!("Streaming {} samples (Ctrl+C to stop)...", n_samples);

    let mut cursor = SeriesCursor::start();
    let mut printed = 0usize;
    while printed < n_samples {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            reason = engine.wait_stopped() => {
                if let StopReason::LinkClosed(reason) = reason {
                    bail!("device disconnected: {reason}");
                }
                break;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        for sample in cursor.next_batch(engine.series()) {
            if printed == n_samples {
                break;
            }
            print_sample(&sample, unit);
            printed += 1;
        }
    }

    engine.set_mode(Mode::OnDemand).await?;
    Ok(())
}

async fn on_demand(engine: &Engine, n_samples: usize, unit: &str) -> Result<()> {
    let interval = Duration::from_millis(engine.config().sample_delay_ms);
    for _ in 0..n_samples {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            sample = engine.request_single_sample() => print_sample(&sample?, unit),
        }
        tokio::time::sleep(interval).await;
    }
    Ok(())
}
