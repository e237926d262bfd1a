// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{SimulationObserver, TickResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
pub struct PerformanceMetrics {
    tick_count: AtomicU64,
    irq_count: AtomicU64,
    irqs_by_line: Mutex<HashMap<u32, u64>>,
    requests_by_device: Mutex<HashMap<String, u64>>,
    start_time: Mutex<Instant>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            tick_count: AtomicU64::new(0),
            irq_count: AtomicU64::new(0),
            irqs_by_line: Mutex::new(HashMap::new()),
            requests_by_device: Mutex::new(HashMap::new()),
            start_time: Mutex::new(Instant::now()),
        }
    }

    pub fn reset(&self) {
        self.tick_count.store(0, Ordering::SeqCst);
        self.irq_count.store(0, Ordering::SeqCst);
        if let Ok(mut m) = self.irqs_by_line.lock() {
            m.clear();
        }
        if let Ok(mut m) = self.requests_by_device.lock() {
            m.clear();
        }
        if let Ok(mut t) = self.start_time.lock() {
            *t = Instant::now();
        }
    }

    pub fn get_ticks(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    pub fn get_irqs_total(&self) -> u64 {
        self.irq_count.load(Ordering::SeqCst)
    }

    pub fn get_irqs(&self, line: u32) -> u64 {
        self.irqs_by_line
            .lock()
            .ok()
            .and_then(|m| m.get(&line).copied())
            .unwrap_or(0)
    }

    /// Ticks in which device `name` asked for an interrupt.
    pub fn get_device_requests(&self, name: &str) -> u64 {
        self.requests_by_device
            .lock()
            .ok()
            .and_then(|m| m.get(name).copied())
            .unwrap_or(0)
    }

    /// Wall-clock tick rate since creation or the last reset.
    pub fn get_tps(&self) -> f64 {
        let elapsed = self
            .start_time
            .lock()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        if elapsed > 0.0 {
            self.get_ticks() as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl SimulationObserver for PerformanceMetrics {
    fn on_simulation_start(&self) {
        if let Ok(mut t) = self.start_time.lock() {
            *t = Instant::now();
        }
    }

    fn on_device_update(&self, name: &str, result: &TickResult) {
        if !result.irq && result.explicit_irqs.is_empty() {
            return;
        }
        if let Ok(mut m) = self.requests_by_device.lock() {
            *m.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    fn on_irq_dispatch(&self, line: u32) {
        self.irq_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut m) = self.irqs_by_line.lock() {
            *m.entry(line).or_insert(0) += 1;
        }
    }

    fn on_tick_end(&self, _tick: u64) {
        self.tick_count.fetch_add(1, Ordering::SeqCst);
    }
}
