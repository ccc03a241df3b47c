//! CLI Entry Point for gpib-bridge
//!
//! Drives a GPIB delay generator through a Prologix USB-GPIB adapter:
//! - list serial ports
//! - send one-off commands (`++...` to the adapter, anything else to the instrument)
//! - run the delay-generator test sequence
//! - an interactive console
//!
//! # Usage
//!
//! ```bash
//! gpib-bridge list-ports
//! gpib-bridge --port /dev/ttyUSB0 send "DT 2"
//! gpib-bridge --port /dev/ttyUSB0 sequence --steps 4
//! gpib-bridge --port /dev/ttyUSB0 console
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gpib_bridge::status::{deliver_status, StatusLine};
use gpib_bridge::{Bridge, BridgeConfig, ChannelSink, SequenceEvent};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpib-bridge")]
#[command(about = "Prologix USB-GPIB bridge for delay-generator control", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the adapter (overrides config)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Read/write timeout in milliseconds (overrides config)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// GPIB address of the instrument, 0-30 (overrides config)
    #[arg(long, global = true)]
    gpib_address: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports reported by the OS
    ListPorts,

    /// Print the effective configuration as TOML
    ShowConfig,

    /// Open the port, send each command in order, then close
    Send {
        /// Commands to send
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Run the delay-generator test sequence
    Sequence {
        /// Number of steps (overrides config)
        #[arg(long)]
        steps: Option<usize>,
    },

    /// Interactive console: each line is sent; `:seq` runs the sequence, `:quit` exits
    Console,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::ListPorts => {
            let ports = Bridge::list_ports();
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Send { commands } => run_send(config, commands).await,
        Commands::Sequence { steps } => {
            let mut config = config;
            if let Some(steps) = steps {
                config.sequence.steps = steps;
                config.validate()?;
            }
            run_sequence(config).await
        }
        Commands::Console => run_console(config).await,
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load_from(path),
        None => BridgeConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(port) = &cli.port {
        config.connection.port_name = Some(port.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.connection.timeout_ms = timeout_ms;
    }
    if let Some(address) = cli.gpib_address {
        config.adapter.gpib_address = Some(address);
    }
    config.validate()?;
    Ok(config)
}

fn print_status(line: &StatusLine) {
    let text = line.text();
    let mut stdout = std::io::stdout().lock();
    let _ = if text.ends_with('\n') {
        write!(stdout, "{}", text)
    } else {
        writeln!(stdout, "{}", text)
    };
    let _ = stdout.flush();
}

/// Bridge wired to a status printer on its own task.
fn start_bridge(config: BridgeConfig) -> (Bridge, tokio::task::JoinHandle<()>) {
    let (sink, rx) = ChannelSink::new();
    let settle = config.adapter.status_settle();
    let printer = tokio::spawn(deliver_status(rx, settle, print_status));
    (Bridge::with_serial(config, Arc::new(sink)), printer)
}

fn port_of(config: &BridgeConfig) -> Result<String> {
    match &config.connection.port_name {
        Some(port) => Ok(port.clone()),
        None => bail!("No serial port selected; pass --port or set connection.port_name"),
    }
}

async fn finish(bridge: Bridge, printer: tokio::task::JoinHandle<()>) -> Result<()> {
    let result = bridge.shutdown().await;
    // The printer ends once the last sink clone (held by the bridge) is gone.
    let _ = printer.await;
    result.map_err(Into::into)
}

async fn run_send(config: BridgeConfig, commands: Vec<String>) -> Result<()> {
    let port = port_of(&config)?;
    let wait = config.connection.timeout();
    let (mut bridge, printer) = start_bridge(config);

    if let Err(e) = bridge.open_port(&port).await {
        finish(bridge, printer).await?;
        bail!("Could not open {}: {}", port, e);
    }

    for command in &commands {
        if let Err(e) = bridge.send_raw(command).await {
            error!("Send failed: {}", e);
        }
    }

    // Give the adapter one timeout interval to answer before closing.
    tokio::time::sleep(wait).await;
    finish(bridge, printer).await
}

async fn drain_sequence(mut events: mpsc::UnboundedReceiver<SequenceEvent>) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            SequenceEvent::Progress(progress) => {
                info!(step = progress.step, delay = progress.delay, "Sequence step");
            }
            SequenceEvent::Completed(summary) => {
                println!(
                    "Sequence finished: {}/{} steps{}",
                    summary.steps_completed,
                    summary.steps_planned,
                    summary
                        .error
                        .as_deref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
                return summary.is_complete();
            }
        }
    }
    false
}

async fn run_sequence(config: BridgeConfig) -> Result<()> {
    let port = port_of(&config)?;
    let (mut bridge, printer) = start_bridge(config);

    if let Err(e) = bridge.open_port(&port).await {
        finish(bridge, printer).await?;
        bail!("Could not open {}: {}", port, e);
    }

    let events = bridge.run_test_sequence()?;
    let complete = tokio::select! {
        complete = drain_sequence(events) => complete,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling sequence");
            bridge.cancel_sequence();
            false
        }
    };

    finish(bridge, printer).await?;
    if !complete {
        bail!("Test sequence did not complete");
    }
    Ok(())
}

async fn run_console(config: BridgeConfig) -> Result<()> {
    let port = port_of(&config)?;
    let (mut bridge, printer) = start_bridge(config);

    if let Err(e) = bridge.open_port(&port).await {
        finish(bridge, printer).await?;
        bail!("Could not open {}: {}", port, e);
    }
    println!("Connected to {}. Type commands, `:seq` for the test sequence, `:quit` to exit.", port);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sequence: Option<mpsc::UnboundedReceiver<SequenceEvent>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Console input failed: {}", e);
                        break;
                    }
                };
                let line = line.trim_end_matches(['\r', '\n']);
                match line {
                    "" => continue,
                    ":quit" => break,
                    _ if sequence.is_some() => {
                        println!("Busy: test sequence running");
                    }
                    ":seq" => match bridge.run_test_sequence() {
                        Ok(events) => sequence = Some(events),
                        Err(e) => println!("{}", e),
                    },
                    command => {
                        if let Err(e) = bridge.send_raw(command).await {
                            error!("Send failed: {}", e);
                        }
                    }
                }
            }
            event = next_event(&mut sequence) => {
                if let Some(SequenceEvent::Completed(summary)) = event {
                    println!(
                        "Sequence finished: {}/{} steps",
                        summary.steps_completed, summary.steps_planned
                    );
                    sequence = None;
                } else if event.is_none() {
                    sequence = None;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    finish(bridge, printer).await
}

async fn next_event(
    sequence: &mut Option<mpsc::UnboundedReceiver<SequenceEvent>>,
) -> Option<SequenceEvent> {
    match sequence {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
