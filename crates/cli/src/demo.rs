// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Built-in controller firmware for the growth-chamber board.
//!
//! TIM2 paces ADC conversions of the air-temperature probe, every sample is
//! published on CAN1, and CAN1 mailbox 0 accepts setpoint updates from the
//! host. A status line goes out on USART1 once per simulated second.

use anyhow::{anyhow, Result};
use chambersim_config::BoardDescriptor;
use chambersim_core::peripherals::can::{code, cs, mb_offset, std_id, IFLAG1, IMASK1, RXMGMASK};
use chambersim_core::{Firmware, MemoryBus, Simulator};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// CAN identifier the host uses to send a new setpoint (tenths of a degree).
pub const SETPOINT_ID: u32 = 0x100;
/// CAN identifier of the temperature samples published by the firmware.
pub const SAMPLE_ID: u32 = 0x200;

const RX_MB: usize = 0;
const TX_MB: usize = 8;

const TIM_CR1_CEN: u32 = 1 << 0;
const TIM_DIER_UIE: u32 = 1 << 0;
const TIM_SR_UIF: u32 = 1 << 0;

const ADC_CR1_EOCIE: u32 = 1 << 5;
const ADC_CR2_ADON: u32 = 1 << 0;
const ADC_CR2_SWSTART: u32 = 1 << 30;

const USART_SR_TXE: u32 = 1 << 7;
const USART_CR1_UE: u32 = 1 << 13;
const USART_CR1_TE: u32 = 1 << 3;

/// Counters the firmware exposes to the host.
#[derive(Debug, Default)]
pub struct DemoStats {
    pub samples: AtomicU64,
    pub last_sample: AtomicU32,
    pub setpoint: AtomicU32,
    pub published: AtomicU64,
    ready: AtomicBool,
}

impl DemoStats {
    /// Block until the firmware has configured its peripherals.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.ready.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// Register addresses and interrupt lines the firmware needs, looked up from
/// the running board rather than hard-coded.
#[derive(Debug, Clone)]
pub struct DemoLayout {
    nvic_iser: u64,
    usart_sr: u64,
    usart_dr: u64,
    usart_brr: u64,
    usart_cr1: u64,
    tim: TimerRegs,
    tim_irq: u32,
    adc: AdcRegs,
    adc_irq: u32,
    can_base: u64,
    can_irq: u32,
    adc_channel: u32,
    status_every: u64,
}

#[derive(Debug, Clone, Copy)]
struct TimerRegs {
    cr1: u64,
    dier: u64,
    sr: u64,
    psc: u64,
    arr: u64,
}

#[derive(Debug, Clone, Copy)]
struct AdcRegs {
    cr1: u64,
    cr2: u64,
    sqr3: u64,
    dr: u64,
}

impl DemoLayout {
    pub fn resolve(sim: &Simulator, board: &BoardDescriptor) -> Result<Self> {
        let reg = |device: &str, name: &str| {
            sim.register_address(device, name)
                .ok_or_else(|| anyhow!("Demo firmware needs register {}.{}", device, name))
        };
        let line = |device: &str| {
            board
                .device(device)
                .and_then(|d| d.irq)
                .ok_or_else(|| anyhow!("Demo firmware needs an interrupt line for '{}'", device))
        };

        Ok(Self {
            nvic_iser: reg("nvic", "ISER0")?,
            usart_sr: reg("usart1", "SR")?,
            usart_dr: reg("usart1", "DR")?,
            usart_brr: reg("usart1", "BRR")?,
            usart_cr1: reg("usart1", "CR1")?,
            tim: TimerRegs {
                cr1: reg("tim2", "CR1")?,
                dier: reg("tim2", "DIER")?,
                sr: reg("tim2", "SR")?,
                psc: reg("tim2", "PSC")?,
                arr: reg("tim2", "ARR")?,
            },
            tim_irq: line("tim2")?,
            adc: AdcRegs {
                cr1: reg("adc1", "CR1")?,
                cr2: reg("adc1", "CR2")?,
                sqr3: reg("adc1", "SQR3")?,
                dr: reg("adc1", "DR")?,
            },
            adc_irq: line("adc1")?,
            can_base: reg("can1", "MCR")?,
            can_irq: line("can1")?,
            adc_channel: 0,
            status_every: ticks_per_second(sim),
        })
    }

    fn enable_line(&self, fw: &mut impl MemoryBus, irq: u32) {
        let addr = self.nvic_iser + u64::from(irq / 32) * 4;
        fw.write_u32(addr, 1 << (irq % 32));
    }

    fn init_console(&self, fw: &mut impl MemoryBus) {
        fw.write_u32(self.usart_brr, 0x1A1);
        fw.write_u32(self.usart_cr1, USART_CR1_UE | USART_CR1_TE);
        self.print(fw, "chamber: boot\r\n");
    }

    fn print(&self, bus: &mut impl MemoryBus, text: &str) {
        for b in text.bytes() {
            while bus.read_u32(self.usart_sr) & USART_SR_TXE == 0 {}
            bus.write_u32(self.usart_dr, u32::from(b));
        }
    }
}

/// Run the controller until the simulator shuts down.
pub fn run(mut fw: Firmware, layout: DemoLayout, stats: Arc<DemoStats>) {
    let l = &layout;

    l.init_console(&mut fw);

    // TIM2: 1 MHz / 1000 = 1 kHz, update every 100 ms.
    fw.write_u32(l.tim.psc, 999);
    fw.write_u32(l.tim.arr, 99);
    fw.write_u32(l.tim.dier, TIM_DIER_UIE);
    fw.modify_u32(l.tim.cr1, 0, TIM_CR1_CEN);

    fw.write_u32(l.adc.sqr3, l.adc_channel);
    fw.write_u32(l.adc.cr1, ADC_CR1_EOCIE);
    fw.write_u32(l.adc.cr2, ADC_CR2_ADON);

    let can = l.can_base;
    // Leave freeze mode with sixteen message buffers.
    fw.write_u32(can, 0x0F);
    fw.write_u32(can + RXMGMASK, std_id(0x7FF));
    fw.write_u32(can + mb_offset(RX_MB) + 4, std_id(SETPOINT_ID));
    fw.write_u32(can + mb_offset(RX_MB), cs(code::RX_EMPTY, 0));
    fw.write_u32(can + mb_offset(TX_MB), cs(code::TX_INACTIVE, 0));
    fw.write_u32(can + IMASK1, (1 << RX_MB) | (1 << TX_MB));

    let tim = l.tim;
    let adc = l.adc;
    let result = fw.register_isr(l.tim_irq, move |ctx| {
        ctx.write_u32(tim.sr, !TIM_SR_UIF);
        ctx.write_u32(adc.cr2, ADC_CR2_ADON | ADC_CR2_SWSTART);
    });
    if let Err(e) = result {
        tracing::error!("Demo firmware: {}", e);
        return;
    }

    let s = stats.clone();
    let result = fw.register_isr(l.adc_irq, move |ctx| {
        let sample = ctx.read_u32(adc.dr) & 0xFFF;
        s.last_sample.store(sample, Ordering::Relaxed);
        s.samples.fetch_add(1, Ordering::Relaxed);

        let mb = can + mb_offset(TX_MB);
        if (ctx.read_u32(mb) >> 24) & 0xF == code::TX_INACTIVE {
            ctx.write_u32(mb + 4, std_id(SAMPLE_ID));
            ctx.write_u32(mb + 8, sample << 16);
            ctx.write_u32(mb, cs(code::TX_DATA, 2));
        }
    });
    if let Err(e) = result {
        tracing::error!("Demo firmware: {}", e);
        return;
    }

    let s = stats.clone();
    let result = fw.register_isr(l.can_irq, move |ctx| {
        let flags = ctx.read_u32(can + IFLAG1);
        if flags & (1 << RX_MB) != 0 {
            let mb = can + mb_offset(RX_MB);
            let data = ctx.read_u32(mb + 8);
            s.setpoint.store(data >> 16, Ordering::Relaxed);
            ctx.write_u32(mb, cs(code::RX_EMPTY, 0));
        }
        if flags & (1 << TX_MB) != 0 {
            s.published.fetch_add(1, Ordering::Relaxed);
        }
        ctx.write_u32(can + IFLAG1, flags);
    });
    if let Err(e) = result {
        tracing::error!("Demo firmware: {}", e);
        return;
    }

    for irq in [l.tim_irq, l.adc_irq, l.can_irq] {
        l.enable_line(&mut fw, irq);
    }

    stats.ready.store(true, Ordering::Release);

    let mut next_status = fw.ticks() + l.status_every;
    while fw.wait_for_interrupt() {
        if fw.ticks() >= next_status {
            next_status += l.status_every;
            let line = format!(
                "t={} temp={} sp={}\r\n",
                fw.ticks(),
                stats.last_sample.load(Ordering::Relaxed),
                stats.setpoint.load(Ordering::Relaxed),
            );
            l.print(&mut fw, &line);
        }
    }
}

fn ticks_per_second(sim: &Simulator) -> u64 {
    let tick = sim.config().tick.as_micros().max(1);
    (1_000_000 / tick).max(1) as u64
}
