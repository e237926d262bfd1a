// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod adc;
pub mod can;
pub mod nvic;
pub mod rtc;
pub mod spi;
pub mod systick;
pub mod timer;
pub mod uart;

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Converts simulated time into whole peripheral clock cycles, carrying the
/// fractional remainder between ticks.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TickClock {
    hz: u64,
    remainder: u64,
}

impl TickClock {
    pub fn new(hz: u64) -> Self {
        Self { hz, remainder: 0 }
    }

    pub fn hz(&self) -> u64 {
        self.hz
    }

    pub fn advance(&mut self, dt: Duration) -> u64 {
        let total = dt.as_nanos() * self.hz as u128 + self.remainder as u128;
        self.remainder = (total % NANOS_PER_SEC) as u64;
        (total / NANOS_PER_SEC) as u64
    }
}
