// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

mod demo;

use anyhow::Context;
use chambersim_config::BoardDescriptor;
use chambersim_core::metrics::PerformanceMetrics;
use chambersim_core::peripherals::adc::Adc;
use chambersim_core::peripherals::can::{CanFrame, CanTrace};
use chambersim_core::Simulator;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

const EXIT_PASS: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

const DEFAULT_BOARD: &str = include_str!("../../../configs/boards/growth-chamber.yaml");

/// Parse a host frame in `ID#HEXDATA` form, e.g. `100#00FA`.
fn parse_can_frame(s: &str) -> Result<CanFrame, String> {
    let (id, data) = s
        .split_once('#')
        .ok_or_else(|| format!("Invalid frame '{}': expected ID#DATA", s))?;
    let id = u32::from_str_radix(id.trim_start_matches("0x"), 16)
        .map_err(|e| format!("Invalid CAN id in '{}': {}", s, e))?;
    if !data.is_ascii() || data.len() % 2 != 0 || data.len() > 16 {
        return Err(format!("Invalid payload in '{}': need 0-8 hex bytes", s));
    }
    let bytes = (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid payload in '{}': {}", s, e))?;
    Ok(if id > 0x7FF {
        CanFrame::extended(id, &bytes)
    } else {
        CanFrame::new(id, &bytes)
    })
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed.strip_prefix("0x") {
        u16::from_str_radix(hex, 16).map_err(|e| format!("Invalid value '{}': {}", s, e))
    } else {
        u16::from_str(trimmed).map_err(|e| format!("Invalid value '{}': {}", s, e))
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "chambersim",
    version,
    about = "Growth-chamber MCU peripheral simulator"
)]
struct Cli {
    /// Board descriptor (YAML or JSON). Defaults to the built-in growth-chamber board.
    #[arg(short, long)]
    board: Option<PathBuf>,

    /// Number of ticks to run before shutting down.
    #[arg(short = 'n', long, default_value = "1000")]
    ticks: u64,

    /// Enable debug-level logging.
    #[arg(short, long)]
    trace: bool,

    /// Print every frame seen by the CAN controllers.
    #[arg(long)]
    can_trace: bool,

    /// Frame to put on CAN bus 0 after start-up, `ID#HEXDATA`. Repeatable.
    #[arg(long = "inject", value_parser = parse_can_frame)]
    inject: Vec<CanFrame>,

    /// Raw 12-bit reading of the temperature probe on ADC channel 0.
    #[arg(long, default_value = "0x6A4", value_parser = parse_u16)]
    probe: u16,

    /// Write a JSON snapshot of the final device state to this path.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize, Debug)]
struct RunSummary {
    status: &'static str,
    ticks: u64,
    sim_time_us: u64,
    irqs_total: u64,
    irqs_by_line: Vec<(u32, u64)>,
    ticks_per_sec: f64,
    adc_samples: u64,
    last_sample: u32,
    setpoint: u32,
    can_tx_frames: usize,
    uart_bytes: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    run(cli)
}

fn load_board(path: Option<&Path>) -> anyhow::Result<BoardDescriptor> {
    match path {
        Some(path) => BoardDescriptor::from_file(path),
        None => BoardDescriptor::from_yaml(DEFAULT_BOARD).context("Built-in board descriptor"),
    }
}

fn run(cli: Cli) -> ExitCode {
    info!("Starting ChamberSim");

    let board = match load_board(cli.board.as_deref()) {
        Ok(board) => board,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    info!("Board: {} ({} devices)", board.name, board.devices.len());

    let mut sim = match Simulator::from_config(&board) {
        Ok(sim) => sim,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let layout = match demo::DemoLayout::resolve(&sim, &board) {
        Ok(layout) => layout,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let metrics = Arc::new(PerformanceMetrics::new());
    sim.add_observer(metrics.clone());

    let trace: CanTrace = Arc::new(Mutex::new(Vec::new()));
    if cli.can_trace {
        let attached = sim.attach_can_trace(trace.clone());
        info!("CAN trace attached to {} controller(s)", attached);
    }
    sim.with_device::<Adc, _>("adc1", |adc| adc.set_channel(0, cli.probe));
    let console = Arc::new(Mutex::new(Vec::new()));
    sim.attach_uart_tx_sink("usart1", console.clone(), !cli.json);
    let can0 = sim.can_port(0);

    let stats = Arc::new(demo::DemoStats::default());
    let fw_stats = stats.clone();
    if let Err(e) = sim.start(move |fw| demo::run(fw, layout, fw_stats)) {
        error!("{}", e);
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    }

    // Pacing bounds the wall time a run can take.
    let per_tick = sim.config().pacing.max(sim.config().tick);
    let budget = per_tick
        .saturating_mul(u32::try_from(cli.ticks).unwrap_or(u32::MAX))
        .saturating_mul(4)
        .saturating_add(Duration::from_secs(5));

    if !cli.inject.is_empty() {
        // A controller still in reset drops traffic.
        if !stats.wait_ready(budget) {
            tracing::warn!("Firmware never finished start-up; injecting anyway");
        }
        match &can0 {
            Some(port) => {
                for frame in &cli.inject {
                    port.inject(*frame);
                }
            }
            None => tracing::warn!("No controller on CAN bus 0; injected frames discarded"),
        }
    }

    let finished = sim.wait_until_tick(cli.ticks, budget);

    let stop = sim.stop();
    if !finished {
        error!(
            "Simulation stalled at tick {} of {}",
            sim.tick_count(),
            cli.ticks
        );
    }
    if let Err(e) = &stop {
        error!("{}", e);
    }

    if cli.can_trace {
        if let Ok(events) = trace.lock() {
            for event in events.iter() {
                println!(
                    "can{} {:?} {:#05x} [{}] {:02X?}{}",
                    event.bus,
                    event.direction,
                    event.frame.id,
                    event.frame.dlc,
                    event.frame.payload(),
                    event
                        .buffer
                        .map(|mb| format!(" mb{}", mb))
                        .unwrap_or_default()
                );
            }
        }
    }

    let tx_frames = can0.map(|port| port.drain().len()).unwrap_or(0);
    let mut irqs_by_line: Vec<(u32, u64)> = board
        .devices
        .iter()
        .filter_map(|d| d.irq)
        .map(|line| (line, metrics.get_irqs(line)))
        .filter(|(_, count)| *count > 0)
        .collect();
    irqs_by_line.sort_unstable();
    irqs_by_line.dedup();

    let summary = RunSummary {
        status: if finished && stop.is_ok() {
            "finished"
        } else {
            "failed"
        },
        ticks: sim.tick_count(),
        sim_time_us: sim.sim_time().as_micros() as u64,
        irqs_total: metrics.get_irqs_total(),
        irqs_by_line,
        ticks_per_sec: metrics.get_tps(),
        adc_samples: stats.samples.load(Ordering::Relaxed),
        last_sample: stats.last_sample.load(Ordering::Relaxed),
        setpoint: stats.setpoint.load(Ordering::Relaxed),
        can_tx_frames: tx_frames,
        uart_bytes: console.lock().map(|c| c.len()).unwrap_or(0),
    };
    print_summary(&summary, cli.json);

    if let Some(path) = &cli.snapshot {
        if let Err(e) = write_snapshot(&sim, path) {
            error!("{:#}", e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
        info!("Snapshot written to {:?}", path);
    }

    if finished && stop.is_ok() {
        ExitCode::from(EXIT_PASS)
    } else {
        ExitCode::from(EXIT_RUNTIME_ERROR)
    }
}

fn print_summary(summary: &RunSummary, json: bool) {
    if json {
        match serde_json::to_string(summary) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
        return;
    }

    println!();
    println!("=== ChamberSim run ===");
    println!("Ticks:        {}", summary.ticks);
    println!("Sim time:     {} us", summary.sim_time_us);
    println!("Interrupts:   {}", summary.irqs_total);
    for (line, count) in &summary.irqs_by_line {
        println!("  line {:>3}:   {}", line, count);
    }
    println!("Ticks/sec:    {:.0}", summary.ticks_per_sec);
    println!(
        "ADC samples:  {} (last {:#05x})",
        summary.adc_samples, summary.last_sample
    );
    println!("Setpoint:     {}", summary.setpoint);
    println!("CAN0 tx:      {} frame(s)", summary.can_tx_frames);
    println!("USART1 tx:    {} byte(s)", summary.uart_bytes);
}

fn write_snapshot(sim: &Simulator, path: &Path) -> anyhow::Result<()> {
    let snapshot = sim.snapshot();
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create snapshot {:?}", path))?;
    serde_json::to_writer_pretty(file, &snapshot).context("Failed to write snapshot")?;
    Ok(())
}
