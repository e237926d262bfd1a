// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! FlexCAN-style CAN controller.
//!
//! The controller runs an explicit state machine. `Rx` and `Tx` are transient:
//! each `update` handles at most one frame, passing through the state and back
//! to `Idle`, and records the states it visited in
//! [`FlexCan::last_transitions`].
//!
//! Frames reach the model through a [`CanHostPort`], which stands in for the
//! physical bus: the host injects frames the firmware should receive and
//! collects the frames the firmware transmits.

use super::TickClock;
use crate::{Device, Register, RegisterBank, TickResult, WriteAction};
use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MAILBOXES: usize = 32;

pub const MCR: u64 = 0x00;
pub const CTRL1: u64 = 0x04;
pub const TIMER: u64 = 0x08;
pub const RXMGMASK: u64 = 0x10;
pub const RX14MASK: u64 = 0x14;
pub const RX15MASK: u64 = 0x18;
pub const ECR: u64 = 0x1C;
pub const ESR1: u64 = 0x20;
pub const IMASK1: u64 = 0x28;
pub const IFLAG1: u64 = 0x30;
pub const MB_BASE: u64 = 0x80;
pub const MB_STRIDE: u64 = 0x10;
pub const RXIMR_BASE: u64 = 0x880;

/// Mapped size of one controller.
pub const REGION_SIZE: u64 = 0x1000;

/// Offset of message buffer `n`'s CS word; ID, DATA0 and DATA1 follow.
pub const fn mb_offset(n: usize) -> u64 {
    MB_BASE + MB_STRIDE * n as u64
}

pub const fn rximr_offset(n: usize) -> u64 {
    RXIMR_BASE + 4 * n as u64
}

/// Message buffer codes, CS bits 27:24.
pub mod code {
    pub const RX_INACTIVE: u32 = 0x0;
    pub const RX_FULL: u32 = 0x2;
    pub const RX_EMPTY: u32 = 0x4;
    pub const RX_OVERRUN: u32 = 0x6;
    pub const TX_INACTIVE: u32 = 0x8;
    pub const TX_ABORT: u32 = 0x9;
    pub const TX_REMOTE: u32 = 0xA;
    pub const TX_DATA: u32 = 0xC;
}

pub const CS_SRR: u32 = 1 << 22;
pub const CS_IDE: u32 = 1 << 21;
pub const CS_RTR: u32 = 1 << 20;
const CS_CODE_SHIFT: u32 = 24;
const CS_DLC_SHIFT: u32 = 16;

const ID_EXT_MASK: u32 = 0x1FFF_FFFF;
const ID_STD_SHIFT: u32 = 18;

/// Build a CS word from a buffer code and length.
pub const fn cs(code: u32, dlc: u8) -> u32 {
    ((code & 0xF) << CS_CODE_SHIFT) | (((dlc & 0xF) as u32) << CS_DLC_SHIFT)
}

/// Standard identifier as laid out in the ID word and the masks.
pub const fn std_id(id: u32) -> u32 {
    (id & 0x7FF) << ID_STD_SHIFT
}

bitflags! {
    /// Module configuration register bits the model acts on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mcr: u32 {
        const MDIS = 1 << 31;
        const FRZ = 1 << 30;
        const HALT = 1 << 28;
        const NOTRDY = 1 << 27;
        const SOFTRST = 1 << 25;
        const FRZACK = 1 << 24;
        const LPMACK = 1 << 20;
        const IRMQ = 1 << 16;
        const MAXMB = 0x7F;

        const _ = !0;
    }
}

impl Mcr {
    const STATUS: Mcr = Mcr::NOTRDY.union(Mcr::FRZACK).union(Mcr::LPMACK);
    const RESET: Mcr = Mcr::MDIS
        .union(Mcr::FRZ)
        .union(Mcr::HALT)
        .union(Mcr::NOTRDY)
        .union(Mcr::LPMACK)
        .union(Mcr::from_bits_retain(0x0F));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanState {
    Off,
    Init,
    Sleep,
    Idle,
    Rx,
    Tx,
}

/// One classic CAN frame as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub remote: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Data frame with an 11-bit identifier. Payloads beyond 8 bytes are
    /// truncated.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        Self::with_payload(id & 0x7FF, false, payload)
    }

    /// Data frame with a 29-bit identifier.
    pub fn extended(id: u32, payload: &[u8]) -> Self {
        Self::with_payload(id & ID_EXT_MASK, true, payload)
    }

    /// Remote request with an 11-bit identifier.
    pub fn remote(id: u32, dlc: u8) -> Self {
        Self {
            id: id & 0x7FF,
            extended: false,
            remote: true,
            dlc: dlc.min(8),
            data: [0; 8],
        }
    }

    fn with_payload(id: u32, extended: bool, payload: &[u8]) -> Self {
        let len = payload.len().min(8);
        let mut data = [0; 8];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            extended,
            remote: false,
            dlc: len as u8,
            data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc.min(8) as usize]
    }

    fn id_word(&self) -> u32 {
        if self.extended {
            self.id & ID_EXT_MASK
        } else {
            std_id(self.id)
        }
    }
}

/// Host end of a controller's bus.
#[derive(Debug, Clone)]
pub struct CanHostPort {
    bus: u8,
    to_device: Sender<CanFrame>,
    from_device: Receiver<CanFrame>,
}

impl CanHostPort {
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Put a frame on the bus for the controller to receive.
    pub fn inject(&self, frame: CanFrame) {
        // Both ends live as long as the controller.
        let _ = self.to_device.send(frame);
    }

    pub fn try_recv(&self) -> Option<CanFrame> {
        self.from_device.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<CanFrame> {
        self.from_device.recv_timeout(timeout).ok()
    }

    /// Every frame transmitted so far and not yet collected.
    pub fn drain(&self) -> Vec<CanFrame> {
        self.from_device.try_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanDirection {
    Rx,
    Tx,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanTraceEvent {
    pub bus: u8,
    pub direction: CanDirection,
    pub frame: CanFrame,
    /// Message buffer involved, if any.
    pub buffer: Option<u8>,
}

/// Shared capture buffer for bus traffic.
pub type CanTrace = Arc<Mutex<Vec<CanTraceEvent>>>;

/// Decoded view of one message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    pub code: u32,
    pub cs: u32,
    pub id: u32,
    pub dlc: u8,
    pub data: [u8; 8],
}

// Register bank indices.
const R_MCR: usize = 0;
const R_TIMER: usize = 2;
const R_RXMGMASK: usize = 3;
const R_RX14MASK: usize = 4;
const R_RX15MASK: usize = 5;
const R_ECR: usize = 6;
const R_ESR1: usize = 7;
const R_IMASK1: usize = 8;
const R_IFLAG1: usize = 9;
const R_MB: usize = 10;
const R_RXIMR: usize = R_MB + 4 * MAILBOXES;

const W_CS: usize = 0;
const W_ID: usize = 1;
const W_DATA0: usize = 2;
const W_DATA1: usize = 3;

/// FlexCAN-like controller with 32 message buffers.
#[derive(Debug)]
pub struct FlexCan {
    bus: u8,
    regs: RegisterBank,
    state: CanState,
    transitions: Vec<CanState>,
    clock: TickClock,
    rx: Receiver<CanFrame>,
    host_tx: Sender<CanFrame>,
    tx: Sender<CanFrame>,
    host_rx: Receiver<CanFrame>,
    trace: Option<CanTrace>,
}

impl FlexCan {
    pub fn new(bus: u8) -> Self {
        let (host_tx, rx) = crossbeam_channel::unbounded();
        let (tx, host_rx) = crossbeam_channel::unbounded();

        let mut regs = vec![
            Register::new("MCR", MCR).reset_value(Mcr::RESET.bits()),
            Register::new("CTRL1", CTRL1),
            Register::new("TIMER", TIMER).writable(0xFFFF),
            Register::new("RXMGMASK", RXMGMASK).reset_value(u32::MAX),
            Register::new("RX14MASK", RX14MASK).reset_value(u32::MAX),
            Register::new("RX15MASK", RX15MASK).reset_value(u32::MAX),
            Register::new("ECR", ECR),
            Register::new("ESR1", ESR1),
            Register::new("IMASK1", IMASK1),
            Register::new("IFLAG1", IFLAG1).on_write(WriteAction::WriteOneToClear),
        ];
        for n in 0..MAILBOXES {
            let base = mb_offset(n);
            regs.push(Register::new(format!("MB{n}_CS"), base));
            regs.push(Register::new(format!("MB{n}_ID"), base + 4));
            regs.push(Register::new(format!("MB{n}_DATA0"), base + 8));
            regs.push(Register::new(format!("MB{n}_DATA1"), base + 12));
        }
        for n in 0..MAILBOXES {
            regs.push(Register::new(format!("RXIMR{n}"), rximr_offset(n)).reset_value(u32::MAX));
        }

        Self {
            bus,
            regs: RegisterBank::new(regs),
            state: CanState::Off,
            transitions: Vec::new(),
            clock: TickClock::new(1_000_000),
            rx,
            host_tx,
            tx,
            host_rx,
            trace: None,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn state(&self) -> CanState {
        self.state
    }

    /// States entered during the most recent `update`, in order.
    pub fn last_transitions(&self) -> &[CanState] {
        &self.transitions
    }

    pub fn host_port(&self) -> CanHostPort {
        CanHostPort {
            bus: self.bus,
            to_device: self.host_tx.clone(),
            from_device: self.host_rx.clone(),
        }
    }

    /// Capture bus traffic into `trace`; `None` turns capture off.
    pub fn set_trace(&mut self, trace: Option<CanTrace>) {
        self.trace = trace;
    }

    pub fn mailbox(&self, n: usize) -> Option<Mailbox> {
        if n >= MAILBOXES {
            return None;
        }
        let cs = self.mb(n, W_CS);
        let mut data = [0; 8];
        data[..4].copy_from_slice(&self.mb(n, W_DATA0).to_be_bytes());
        data[4..].copy_from_slice(&self.mb(n, W_DATA1).to_be_bytes());
        Some(Mailbox {
            code: (cs >> CS_CODE_SHIFT) & 0xF,
            cs,
            id: self.mb(n, W_ID),
            dlc: ((cs >> CS_DLC_SHIFT) & 0xF) as u8,
            data,
        })
    }

    fn mcr(&self) -> Mcr {
        Mcr::from_bits_retain(self.regs.value(R_MCR))
    }

    fn mb(&self, n: usize, word: usize) -> u32 {
        self.regs.value(R_MB + 4 * n + word)
    }

    fn set_mb(&mut self, n: usize, word: usize, value: u32) {
        self.regs.force(R_MB + 4 * n + word, value);
    }

    fn mb_code(&self, n: usize) -> u32 {
        (self.mb(n, W_CS) >> CS_CODE_SHIFT) & 0xF
    }

    /// Highest message buffer the module scans.
    fn last_mb(&self) -> usize {
        ((self.mcr() & Mcr::MAXMB).bits() as usize).min(MAILBOXES - 1)
    }

    fn enter(&mut self, next: CanState) {
        if next != self.state {
            tracing::debug!("CAN{} {:?} -> {:?}", self.bus, self.state, next);
        }
        self.state = next;
        self.transitions.push(next);
        self.refresh_status();
    }

    fn refresh_status(&mut self) {
        let mut status = Mcr::empty();
        if !matches!(self.state, CanState::Idle | CanState::Rx | CanState::Tx) {
            status |= Mcr::NOTRDY;
        }
        if self.state == CanState::Init {
            status |= Mcr::FRZACK;
        }
        if matches!(self.state, CanState::Off | CanState::Sleep) {
            status |= Mcr::LPMACK;
        }
        let mcr = (self.mcr() - Mcr::STATUS) | status;
        self.regs.force(R_MCR, mcr.bits());
    }

    fn write_mcr(&mut self, value: u32) {
        let req = Mcr::from_bits_retain(value);
        if req.contains(Mcr::SOFTRST) {
            self.soft_reset();
        }
        let kept = self.mcr() & Mcr::STATUS;
        self.regs
            .force(R_MCR, ((req - Mcr::STATUS - Mcr::SOFTRST) | kept).bits());

        let next = if req.contains(Mcr::MDIS) {
            match self.state {
                CanState::Off => CanState::Off,
                _ => CanState::Sleep,
            }
        } else {
            match self.state {
                CanState::Off => CanState::Init,
                CanState::Sleep if req.contains(Mcr::HALT) => CanState::Init,
                CanState::Idle if req.contains(Mcr::FRZ | Mcr::HALT) => CanState::Init,
                s => s,
            }
        };
        if next != self.state {
            tracing::debug!("CAN{} {:?} -> {:?} (MCR write)", self.bus, self.state, next);
            self.state = next;
        }
        self.refresh_status();
    }

    fn soft_reset(&mut self) {
        tracing::debug!("CAN{} soft reset", self.bus);
        for index in [R_TIMER, R_ECR, R_ESR1, R_IMASK1, R_IFLAG1] {
            self.regs.reset(index);
        }
    }

    fn rx_mask(&self, n: usize) -> u32 {
        if self.mcr().contains(Mcr::IRMQ) {
            return self.regs.value(R_RXIMR + n);
        }
        match n {
            14 => self.regs.value(R_RX14MASK),
            15 => self.regs.value(R_RX15MASK),
            _ => self.regs.value(R_RXMGMASK),
        }
    }

    /// A mask bit of 1 requires the identifier bit to match; IDE always must.
    fn accepts(&self, n: usize, frame: &CanFrame) -> bool {
        let ide = self.mb(n, W_CS) & CS_IDE != 0;
        if ide != frame.extended {
            return false;
        }
        let mask = self.rx_mask(n) & ID_EXT_MASK;
        (self.mb(n, W_ID) ^ frame.id_word()) & mask == 0
    }

    /// First matching EMPTY buffer, else the first matching FULL or OVERRUN
    /// one. The flag tells whether the frame overruns unread data.
    fn select_rx_buffer(&self, frame: &CanFrame) -> Option<(usize, bool)> {
        let mut occupied = None;
        for n in 0..=self.last_mb() {
            let code = self.mb_code(n);
            if !matches!(code, code::RX_EMPTY | code::RX_FULL | code::RX_OVERRUN)
                || !self.accepts(n, frame)
            {
                continue;
            }
            if code == code::RX_EMPTY {
                return Some((n, false));
            }
            occupied.get_or_insert((n, true));
        }
        occupied
    }

    fn timestamp(&self) -> u32 {
        self.regs.value(R_TIMER) & 0xFFFF
    }

    fn record(&self, direction: CanDirection, frame: CanFrame, buffer: Option<usize>) {
        let Some(trace) = &self.trace else {
            return;
        };
        tracing::info!(
            "CAN{} {:?} id={:#x}{} dlc={} data={:02x?} mb={:?}",
            self.bus,
            direction,
            frame.id,
            if frame.extended { "x" } else { "" },
            frame.dlc,
            frame.payload(),
            buffer
        );
        if let Ok(mut events) = trace.lock() {
            events.push(CanTraceEvent {
                bus: self.bus,
                direction,
                frame,
                buffer: buffer.map(|n| n as u8),
            });
        }
    }

    /// Returns whether the buffer's interrupt is unmasked.
    fn complete(&mut self, n: usize) -> bool {
        self.regs.set_bits(R_IFLAG1, 1 << n);
        self.regs.value(R_IMASK1) & (1 << n) != 0
    }

    fn receive(&mut self, frame: CanFrame) -> bool {
        let Some((n, overrun)) = self.select_rx_buffer(&frame) else {
            tracing::trace!("CAN{} no buffer accepts id {:#x}", self.bus, frame.id);
            self.record(CanDirection::Dropped, frame, None);
            return false;
        };
        if frame.remote {
            self.record(CanDirection::Dropped, frame, Some(n));
            return false;
        }

        let status = if overrun { code::RX_OVERRUN } else { code::RX_FULL };
        let mut cs = cs(status, frame.dlc) | self.timestamp();
        if frame.extended {
            cs |= CS_IDE | CS_SRR;
        }
        self.set_mb(n, W_CS, cs);
        self.set_mb(n, W_ID, frame.id_word());
        let [d0, d1] = split_payload(&frame.data);
        self.set_mb(n, W_DATA0, d0);
        self.set_mb(n, W_DATA1, d1);
        if overrun {
            tracing::debug!("CAN{} MB{} overrun", self.bus, n);
        }
        self.record(CanDirection::Rx, frame, Some(n));
        self.complete(n)
    }

    fn armed_tx_buffer(&self) -> Option<usize> {
        (0..=self.last_mb()).find(|&n| matches!(self.mb_code(n), code::TX_DATA | code::TX_REMOTE))
    }

    fn transmit(&mut self, n: usize) -> bool {
        let cs = self.mb(n, W_CS);
        let id = self.mb(n, W_ID);
        let status = (cs >> CS_CODE_SHIFT) & 0xF;
        let extended = cs & CS_IDE != 0;
        let mut data = [0; 8];
        data[..4].copy_from_slice(&self.mb(n, W_DATA0).to_be_bytes());
        data[4..].copy_from_slice(&self.mb(n, W_DATA1).to_be_bytes());
        let frame = CanFrame {
            id: if extended { id & ID_EXT_MASK } else { (id >> ID_STD_SHIFT) & 0x7FF },
            extended,
            remote: status == code::TX_REMOTE || cs & CS_RTR != 0,
            dlc: (((cs >> CS_DLC_SHIFT) & 0xF) as u8).min(8),
            data,
        };

        // A remote request waits for its answer in the same buffer.
        let next = if status == code::TX_REMOTE {
            code::RX_EMPTY
        } else {
            code::TX_INACTIVE
        };
        let keep = cs & (CS_SRR | CS_IDE | CS_RTR | (0xF << CS_DLC_SHIFT));
        self.set_mb(n, W_CS, (next << CS_CODE_SHIFT) | keep | self.timestamp());

        let _ = self.tx.send(frame);
        self.record(CanDirection::Tx, frame, Some(n));
        self.complete(n)
    }
}

fn split_payload(data: &[u8; 8]) -> [u32; 2] {
    [
        u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
    ]
}

impl Device for FlexCan {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn post_write(&mut self, index: usize, value: u32) {
        match index {
            R_MCR => self.write_mcr(value),
            _ => self.regs.store(index, value),
        }
    }

    fn update(&mut self, dt: Duration) -> TickResult {
        self.transitions.clear();
        let elapsed = self.clock.advance(dt);
        let timer = (self.regs.value(R_TIMER) as u64 + elapsed) & 0xFFFF;
        self.regs.force(R_TIMER, timer as u32);

        match self.state {
            CanState::Off => {
                for frame in self.rx.try_iter().collect::<Vec<_>>() {
                    self.record(CanDirection::Dropped, frame, None);
                }
                TickResult::default()
            }
            CanState::Init | CanState::Sleep => {
                if !self.mcr().intersects(Mcr::MDIS | Mcr::HALT) {
                    self.enter(CanState::Idle);
                }
                TickResult::default()
            }
            CanState::Idle | CanState::Rx | CanState::Tx => {
                if let Ok(frame) = self.rx.try_recv() {
                    self.enter(CanState::Rx);
                    let irq = self.receive(frame);
                    self.enter(CanState::Idle);
                    return TickResult::irq(irq);
                }
                if let Some(n) = self.armed_tx_buffer() {
                    self.enter(CanState::Tx);
                    let irq = self.transmit(n);
                    self.enter(CanState::Idle);
                    return TickResult::irq(irq);
                }
                TickResult::default()
            }
        }
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        let active: Vec<_> = (0..MAILBOXES)
            .filter_map(|n| self.mailbox(n).map(|mb| (n, mb)))
            .filter(|(_, mb)| mb.code != code::RX_INACTIVE)
            .map(|(n, mb)| serde_json::json!({ "index": n, "mailbox": mb }))
            .collect();
        serde_json::json!({
            "bus": self.bus,
            "state": self.state,
            "mcr": self.regs.value(R_MCR),
            "imask1": self.regs.value(R_IMASK1),
            "iflag1": self.regs.value(R_IFLAG1),
            "timer": self.timestamp(),
            "mailboxes": active,
        })
    }
}
