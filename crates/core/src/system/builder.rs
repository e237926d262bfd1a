// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::peripherals::adc::{Adc, DEFAULT_ADC_CLOCK_HZ};
use crate::peripherals::can::FlexCan;
use crate::peripherals::nvic::Nvic;
use crate::peripherals::rtc::{Rtc, LSE_HZ};
use crate::peripherals::spi::Spi;
use crate::peripherals::systick::{Systick, DEFAULT_CORE_CLOCK_HZ};
use crate::peripherals::timer::{Timer, DEFAULT_TIMER_CLOCK_HZ};
use crate::peripherals::uart::Uart;
use crate::{Device, SimConfig, Simulator};
use anyhow::Context;
use chambersim_config::{BoardDescriptor, DeviceConfig};
use std::path::Path;
use tracing::info;

/// SysTick is exception 15 unless the board says otherwise.
const SYSTICK_DEFAULT_IRQ: u32 = 15;

/// Builds a Simulator from a board descriptor path.
/// If no path is provided, returns a simulator with default settings and no devices.
pub fn build_simulator(board_path: Option<&Path>) -> anyhow::Result<Simulator> {
    let sim = if let Some(path) = board_path {
        info!("Loading board descriptor: {:?}", path);
        let board = BoardDescriptor::from_file(path)?;
        Simulator::from_config(&board)?
    } else {
        info!("Using default simulator configuration");
        Simulator::default()
    };

    Ok(sim)
}

/// Construct the model for one board entry.
pub fn build_device(sim: &Simulator, cfg: &DeviceConfig) -> anyhow::Result<Box<dyn Device>> {
    let clock = |default: u64| -> anyhow::Result<u64> {
        Ok(cfg.extra_u64("clock_hz")?.unwrap_or(default))
    };

    let dev: Box<dyn Device> = match cfg.r#type.as_str() {
        "uart" => Box::new(Uart::new()),
        "timer" => Box::new(Timer::with_clock(clock(DEFAULT_TIMER_CLOCK_HZ)?)),
        "adc" => Box::new(Adc::with_clock(clock(DEFAULT_ADC_CLOCK_HZ)?)),
        "rtc" => Box::new(Rtc::with_clock(clock(LSE_HZ)?)),
        "spi" => Box::new(Spi::new()),
        "systick" => Box::new(Systick::with_clock(clock(DEFAULT_CORE_CLOCK_HZ)?)),
        "can" => {
            let bus = cfg.extra_u64("bus")?.unwrap_or(0);
            let bus = u8::try_from(bus).map_err(|_| {
                anyhow::anyhow!("CAN bus index {} for '{}' does not fit in u8", bus, cfg.id)
            })?;
            Box::new(FlexCan::new(bus))
        }
        "nvic" => Box::new(Nvic::new(sim.interrupt_state())),
        other => anyhow::bail!("Unsupported device type '{}' for id '{}'", other, cfg.id),
    };
    Ok(dev)
}

impl Simulator {
    pub fn from_config(board: &BoardDescriptor) -> anyhow::Result<Self> {
        let settings = &board.simulation;
        let sim = Simulator::new(SimConfig {
            tick: settings.tick(),
            pacing: settings.pacing(),
            join_timeout: settings.join_timeout(),
            irq_lines: settings.irq_lines,
        });

        for cfg in &board.devices {
            let dev = build_device(&sim, cfg)?;
            let irq = cfg
                .irq
                .or_else(|| (cfg.r#type == "systick").then_some(SYSTICK_DEFAULT_IRQ));
            sim.add_device(cfg.id.clone(), cfg.base_address, cfg.size_bytes()?, irq, dev)
                .with_context(|| format!("Failed to map device '{}'", cfg.id))?;
        }

        info!(
            "Built board '{}' with {} devices",
            board.name,
            board.devices.len()
        );
        Ok(sim)
    }
}
