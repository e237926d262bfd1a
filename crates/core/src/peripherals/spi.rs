// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{Device, Register, RegisterBank, TickResult, WriteAction};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

const CR1: usize = 0;
const CR2: usize = 1;
const SR: usize = 2;
const DR: usize = 3;

const CR1_SPE: u32 = 1 << 6;
const CR2_RXNEIE: u32 = 1 << 6;
const SR_RXNE: u32 = 1 << 0;
const SR_TXE: u32 = 1 << 1;
const SR_CRCERR: u32 = 1 << 4;
const SR_BSY: u32 = 1 << 7;

/// Completed transfers kept for inspection; older ones are dropped.
pub const TRANSFER_LOG_DEPTH: usize = 256;

/// Answers one MOSI byte with one MISO byte.
pub type SpiResponder = Box<dyn FnMut(u8) -> u8 + Send>;

/// STM32F1 compatible SPI master.
///
/// A DR write starts a transfer that completes on the next update; the
/// attached responder plays the slave, loopback when none is attached.
pub struct Spi {
    regs: RegisterBank,
    responder: Option<SpiResponder>,
    in_flight: Option<u8>,
    transfers: VecDeque<(u8, u8)>,
}

impl fmt::Debug for Spi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spi")
            .field("regs", &self.regs)
            .field("responder", &self.responder.is_some())
            .field("in_flight", &self.in_flight)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl Default for Spi {
    fn default() -> Self {
        Self::new()
    }
}

impl Spi {
    pub fn new() -> Self {
        Self {
            regs: RegisterBank::new(vec![
                Register::new("CR1", 0x00).writable(0xFFFF),
                Register::new("CR2", 0x04).writable(0xF7),
                // Reset value: TXE (Transmit buffer empty) set
                Register::new("SR", 0x08)
                    .reset_value(SR_TXE)
                    .writable(SR_CRCERR)
                    .on_write(WriteAction::WriteZeroToClear),
                Register::new("DR", 0x0C).writable(0xFFFF),
                Register::new("CRCPR", 0x10).reset_value(0x7).writable(0xFFFF),
            ]),
            responder: None,
            in_flight: None,
            transfers: VecDeque::with_capacity(TRANSFER_LOG_DEPTH),
        }
    }

    pub fn set_responder(&mut self, responder: Option<SpiResponder>) {
        self.responder = responder;
    }

    /// The last [`TRANSFER_LOG_DEPTH`] completed `(mosi, miso)` byte pairs,
    /// oldest first.
    pub fn transfers(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.transfers.iter().copied()
    }

    /// Drain the transfer log.
    pub fn take_transfers(&mut self) -> Vec<(u8, u8)> {
        self.transfers.drain(..).collect()
    }
}

impl Device for Spi {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        let value = self.regs.value(index);
        if index == DR {
            self.regs.clear_bits(SR, SR_RXNE);
        }
        value
    }

    fn post_write(&mut self, index: usize, value: u32) {
        if index != DR {
            self.regs.store(index, value);
            return;
        }
        if self.regs.value(CR1) & CR1_SPE == 0 {
            tracing::trace!("SPI DR write with SPE clear ignored");
            return;
        }
        self.in_flight = Some((value & 0xFF) as u8);
        self.regs.set_bits(SR, SR_BSY);
        self.regs.clear_bits(SR, SR_TXE);
    }

    fn update(&mut self, _dt: Duration) -> TickResult {
        let Some(mosi) = self.in_flight.take() else {
            return TickResult::default();
        };
        let miso = match self.responder.as_mut() {
            Some(respond) => respond(mosi),
            None => mosi,
        };
        if self.transfers.len() == TRANSFER_LOG_DEPTH {
            self.transfers.pop_front();
        }
        self.transfers.push_back((mosi, miso));
        self.regs.force(DR, miso as u32);
        self.regs.set_bits(SR, SR_RXNE | SR_TXE);
        self.regs.clear_bits(SR, SR_BSY);
        TickResult::irq(self.regs.value(CR2) & CR2_RXNEIE != 0)
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
