// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{Device, Register, RegisterBank, TickResult, WriteAction};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SR: usize = 0;
const DR: usize = 1;
const CR1: usize = 3;

const SR_RXNE: u32 = 1 << 5;
const SR_TC: u32 = 1 << 6;
const SR_TXE: u32 = 1 << 7;
const CR1_RXNEIE: u32 = 1 << 5;
const CR1_TCIE: u32 = 1 << 6;

/// Host side of a UART: feeds bytes to the firmware's receiver.
#[derive(Debug, Clone)]
pub struct UartHostPort {
    to_device: Sender<u8>,
}

impl UartHostPort {
    pub fn send(&self, bytes: &[u8]) {
        for &b in bytes {
            // The device only disappears with the simulator.
            let _ = self.to_device.send(b);
        }
    }
}

/// STM32F1-layout USART (SR, DR, BRR, CR1).
#[derive(Debug)]
pub struct Uart {
    regs: RegisterBank,
    sink: Option<Arc<Mutex<Vec<u8>>>>,
    echo_stdout: bool,
    host_tx: Sender<u8>,
    rx_channel: Receiver<u8>,
    rx_queue: VecDeque<u8>,
    tc_event: bool,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    pub fn new() -> Self {
        let (host_tx, rx_channel) = crossbeam_channel::unbounded();
        Self {
            regs: RegisterBank::new(vec![
                // TXE and TC stay set: transmission completes instantly.
                Register::new("SR", 0x00)
                    .reset_value(SR_TXE | SR_TC)
                    .writable(SR_RXNE | SR_TC)
                    .on_write(WriteAction::WriteZeroToClear),
                Register::new("DR", 0x04).writable(0x1FF),
                Register::new("BRR", 0x08).writable(0xFFFF),
                Register::new("CR1", 0x0C).writable(0x3FFF),
            ]),
            sink: None,
            echo_stdout: true,
            host_tx,
            rx_channel,
            rx_queue: VecDeque::new(),
            tc_event: false,
        }
    }

    pub fn host_port(&self) -> UartHostPort {
        UartHostPort {
            to_device: self.host_tx.clone(),
        }
    }

    /// Attach a transmit capture sink.
    ///
    /// When `echo_stdout` is false, transmitted bytes are no longer printed.
    pub fn set_sink(&mut self, sink: Option<Arc<Mutex<Vec<u8>>>>, echo_stdout: bool) {
        self.sink = sink;
        self.echo_stdout = echo_stdout;
    }

    /// Queue bytes for the receiver directly, bypassing the host port.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx_queue.extend(bytes);
    }

    fn push_tx(&mut self, value: u8) {
        if let Some(sink) = &self.sink {
            if let Ok(mut guard) = sink.lock() {
                guard.push(value);
            }
        }

        if self.echo_stdout {
            #[allow(unused_must_use)]
            {
                print!("{}", value as char);
                io::stdout().flush();
            }
        }
    }
}

impl Device for Uart {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        let value = self.regs.value(index);
        if index == DR {
            // Reading DR clears RXNE.
            self.regs.clear_bits(SR, SR_RXNE);
        }
        value
    }

    fn post_write(&mut self, index: usize, value: u32) {
        if index == DR {
            self.push_tx((value & 0xFF) as u8);
            self.regs.set_bits(SR, SR_TXE | SR_TC);
            self.tc_event = true;
            return;
        }
        self.regs.store(index, value);
    }

    fn update(&mut self, _dt: Duration) -> TickResult {
        self.rx_queue.extend(self.rx_channel.try_iter());

        let cr1 = self.regs.value(CR1);
        let mut irq = false;
        if self.regs.value(SR) & SR_RXNE == 0 {
            if let Some(byte) = self.rx_queue.pop_front() {
                self.regs.force(DR, byte as u32);
                self.regs.set_bits(SR, SR_RXNE);
                irq |= cr1 & CR1_RXNEIE != 0;
            }
        }
        if std::mem::take(&mut self.tc_event) {
            irq |= cr1 & CR1_TCIE != 0;
        }
        TickResult::irq(irq)
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "registers": self.regs.snapshot(),
            "rx_queued": self.rx_queue.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_uart_transmit_to_sink() {
        let mut uart = Uart::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        uart.set_sink(Some(sink.clone()), false);

        uart.write_register(0x04, b'A' as u32);
        uart.write_register(0x04, b'B' as u32);

        let data = sink.lock().unwrap().clone();
        assert_eq!(data, vec![b'A', b'B']);
        assert_eq!(uart.read_register(0x00) & 0xC0, 0xC0);
    }

    #[test]
    fn test_uart_receive_one_byte_per_tick() {
        let mut uart = Uart::new();
        uart.set_sink(None, false);
        uart.write_register(0x0C, CR1_RXNEIE);
        uart.host_port().send(b"hi");

        assert!(uart.update(MS).irq);
        assert_ne!(uart.read_register(0x00) & SR_RXNE, 0);
        // RXNE still set: the second byte waits.
        assert!(!uart.update(MS).irq);
        assert_eq!(uart.read_register(0x04), b'h' as u32);
        assert_eq!(uart.read_register(0x00) & SR_RXNE, 0);

        assert!(uart.update(MS).irq);
        assert_eq!(uart.read_register(0x04), b'i' as u32);
        assert!(!uart.update(MS).irq);
    }

    #[test]
    fn test_rxne_cleared_by_writing_zero() {
        let mut uart = Uart::new();
        uart.push_rx(b"x");
        uart.update(MS);
        uart.write_register(0x00, !SR_RXNE);
        assert_eq!(uart.read_register(0x00) & SR_RXNE, 0);
        assert_eq!(uart.read_register(0x00) & SR_TC, SR_TC);
    }

    #[test]
    fn test_tc_interrupt_once_per_write() {
        let mut uart = Uart::new();
        uart.set_sink(None, false);
        uart.write_register(0x0C, CR1_TCIE);
        uart.write_register(0x04, b'z' as u32);
        assert!(uart.update(MS).irq);
        assert!(!uart.update(MS).irq);
    }
}
