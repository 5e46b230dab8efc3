//! mic-lock command line.
//!
//! Lists endpoints or holds one capture device at a volume until Enter is
//! pressed on stdin.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mic_lock::audio::{platform_backend, ThreadScope};
use mic_lock::{Direction, Endpoint, LockConfig, LockEvent, LockSession};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keep a microphone's hardware volume pinned at a chosen level
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "MIC_LOCK_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Volume deviation tolerated before correcting
    #[arg(long, env = "MIC_LOCK_EPSILON", default_value_t = LockConfig::DEFAULT_EPSILON, global = true)]
    epsilon: f32,

    /// Corrective writes per drift before waiting for a new reading
    #[arg(long, env = "MIC_LOCK_MAX_CORRECTIONS", default_value_t = LockConfig::DEFAULT_MAX_CORRECTIONS, global = true)]
    max_corrections: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List active endpoints
    List {
        /// List output devices instead of microphones
        #[arg(long)]
        render: bool,
    },

    /// Hold a microphone at a volume until Enter is pressed
    Lock {
        /// Device ID, or its index in `list` output
        device: String,

        /// Target volume in percent
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = LockConfig {
        epsilon: args.epsilon,
        max_corrections_per_drift: args.max_corrections,
    }
    .validated()?;

    let _scope = ThreadScope::enter();
    let backend = platform_backend().context("Audio subsystem unavailable")?;

    let (events_tx, events_rx) = mpsc::channel();
    let session = LockSession::new(backend, config, move |event| {
        let _ = events_tx.send(event);
    })?;

    match args.command {
        Command::List { render } => {
            let direction = if render {
                Direction::Render
            } else {
                Direction::Capture
            };
            print_endpoints(&session.list_endpoints(direction)?);
        }
        Command::Lock { device, percent } => {
            let endpoints = session.list_endpoints(Direction::Capture)?;
            let endpoint = resolve_device(&endpoints, &device)?;

            let printer = thread::spawn(move || {
                for event in events_rx {
                    match event {
                        LockEvent::StatusChanged(status) => println!("{}", status),
                        LockEvent::DeviceLost { endpoint_id } => {
                            println!("Device lost: {} (press Enter to exit)", endpoint_id)
                        }
                        LockEvent::DeviceListChanged => debug!("device list changed"),
                    }
                }
            });

            session
                .start_lock(&endpoint.id, percent)
                .with_context(|| format!("Could not lock '{}'", endpoint.name))?;
            println!("Press Enter to stop.");

            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("Failed to read stdin")?;

            info!("Shutting down...");
            drop(session);
            let _ = printer.join();
        }
    }

    Ok(())
}

/// Accept either an endpoint ID or an index into `endpoints`.
fn resolve_device<'a>(endpoints: &'a [Endpoint], device: &str) -> Result<&'a Endpoint> {
    if let Some(endpoint) = endpoints.iter().find(|e| e.id == device) {
        return Ok(endpoint);
    }
    match device.parse::<usize>() {
        Ok(index) if index < endpoints.len() => Ok(&endpoints[index]),
        _ => bail!("No active microphone matches '{}'", device),
    }
}

fn print_endpoints(endpoints: &[Endpoint]) {
    if endpoints.is_empty() {
        println!("No active devices");
        return;
    }
    for (index, endpoint) in endpoints.iter().enumerate() {
        let marker = if endpoint.is_default { "*" } else { " " };
        println!("{:>2} {} {}  [{}]", index, marker, endpoint.name, endpoint.id);
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(())
}
