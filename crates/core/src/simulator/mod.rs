// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The MCU simulator: device ownership, the interrupt vector table, the
//! firmware thread and the fixed-step stepping loop.
//!
//! Each tick the stepping loop suspends firmware, updates every device,
//! dispatches every line that is both enabled and pending, then resumes
//! firmware. All device updates finish before the first dispatch, so no two
//! devices can see a tick's interrupts in different orders. Handlers run on
//! the stepping loop's thread with an [`IsrContext`].

mod firmware;
mod gate;

pub use firmware::{Firmware, IsrContext};

use crate::bus::{DeviceEntry, SystemBus};
use crate::interrupt::InterruptController;
use crate::peripherals::can::{CanHostPort, CanTrace, FlexCan};
use crate::peripherals::nvic::NvicState;
use crate::peripherals::uart::{Uart, UartHostPort};
use crate::snapshot::SimulatorSnapshot;
use crate::{Device, SimError, SimResult, SimulationObserver};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gate::{lock, SuspendGate, TickEpoch};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type IsrHandler = Box<dyn FnMut(&mut IsrContext<'_>) + Send>;

thread_local! {
    static IN_TICK: Cell<bool> = const { Cell::new(false) };
}

fn in_tick() -> bool {
    IN_TICK.with(Cell::get)
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Simulated time per tick.
    pub tick: Duration,
    /// Wall-clock wait between ticks when nothing wakes the loop.
    pub pacing: Duration,
    /// How long `stop` waits for the firmware thread.
    pub join_timeout: Duration,
    pub irq_lines: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1),
            pacing: Duration::from_millis(1),
            join_timeout: Duration::from_millis(500),
            irq_lines: 256,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Lines devices requested this tick, in device order.
    pub requested: Vec<u32>,
    /// Lines whose pending bit was consumed by dispatch, in index order.
    pub dispatched: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopSignal {
    Wake,
    Stop,
}

/// Everything the stepping loop mutates during a tick.
pub(crate) struct McuCore {
    pub(crate) bus: SystemBus,
    vectors: Vec<Option<IsrHandler>>,
    observers: Vec<Arc<dyn SimulationObserver>>,
    tick: u64,
    dt: Duration,
}

impl McuCore {
    fn run_tick(&mut self) -> TickReport {
        let tick = self.tick + 1;
        for observer in &self.observers {
            observer.on_tick_start(tick);
        }

        let requested = self.bus.update_devices(self.dt, &self.observers);

        // Lines pended by handlers below wait for the next tick.
        let ready = self.bus.nvic.ready_lines();
        let mut dispatched = Vec::with_capacity(ready.len());
        for line in ready {
            if self.bus.nvic.acknowledge(line) {
                self.dispatch(line, tick);
                dispatched.push(line);
            }
        }

        self.tick = tick;
        for observer in &self.observers {
            observer.on_tick_end(tick);
        }
        TickReport {
            tick,
            requested,
            dispatched,
        }
    }

    fn dispatch(&mut self, line: u32, tick: u64) {
        for observer in &self.observers {
            observer.on_irq_dispatch(line);
        }
        let Some(mut handler) = self
            .vectors
            .get_mut(line as usize)
            .and_then(Option::take)
        else {
            tracing::warn!("IRQ {} delivered with no handler registered", line);
            return;
        };
        tracing::debug!("Dispatching IRQ {} at tick {}", line, tick);
        let mut ctx = IsrContext {
            bus: &mut self.bus,
            line,
            tick,
        };
        handler(&mut ctx);
        self.vectors[line as usize] = Some(handler);
    }
}

/// State shared by the simulator, its stepping loop and firmware handles.
pub(crate) struct Shared {
    pub(crate) core: Mutex<McuCore>,
    pub(crate) nvic: Arc<NvicState>,
    gate: SuspendGate,
    epoch: TickEpoch,
    running: AtomicBool,
    signals: Sender<LoopSignal>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn request_irq(&self, line: u32) -> bool {
        let enabled = self.nvic.request_irq(line);
        if enabled {
            // A full channel already holds a wake-up.
            let _ = self.signals.try_send(LoopSignal::Wake);
        }
        enabled
    }

    fn register_isr(&self, line: u32, handler: IsrHandler) -> SimResult<()> {
        let mut core = lock(&self.core);
        let lines = core.vectors.len() as u32;
        let slot = core
            .vectors
            .get_mut(line as usize)
            .ok_or(SimError::InvalidIrqLine { line, lines })?;
        if slot.replace(handler).is_some() {
            tracing::debug!("Replaced handler for IRQ {}", line);
        }
        Ok(())
    }

    /// One full tick: suspend, update, dispatch, resume.
    fn tick(&self) -> TickReport {
        self.gate.suspend();
        IN_TICK.with(|t| t.set(true));
        let report = lock(&self.core).run_tick();
        IN_TICK.with(|t| t.set(false));
        self.epoch
            .advance(report.tick, report.dispatched.len() as u64);
        self.gate.resume();
        report
    }
}

fn stepping_loop(shared: Arc<Shared>, signals: Receiver<LoopSignal>, pacing: Duration) {
    tracing::debug!("Stepping loop started");
    while shared.is_running() {
        match signals.recv_timeout(pacing) {
            Ok(LoopSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(LoopSignal::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        if !shared.is_running() {
            break;
        }
        shared.tick();
    }
    tracing::debug!("Stepping loop exited");
}

/// A spawned thread plus the channel it signals on exit, so joins can be
/// bounded.
struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    /// Join if the thread signals exit within `timeout`. On timeout the
    /// thread is left detached and `false` is returned.
    fn join_within(self, timeout: Duration, name: &str) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::error!("{} thread panicked", name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!("{} thread did not exit within {:?}", name, timeout);
                false
            }
        }
    }
}

/// Simulated MCU running firmware against peripheral models.
pub struct Simulator {
    shared: Arc<Shared>,
    config: SimConfig,
    signals: Receiver<LoopSignal>,
    stepper: Option<Worker>,
    firmware: Option<Worker>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("tick", &self.tick_count())
            .finish()
    }
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        let nvic = Arc::new(NvicState::new(config.irq_lines));
        let lines = nvic.line_count() as usize;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let core = McuCore {
            bus: SystemBus::new(nvic.clone()),
            vectors: (0..lines).map(|_| None).collect(),
            observers: Vec::new(),
            tick: 0,
            dt: config.tick,
        };
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                nvic,
                gate: SuspendGate::default(),
                epoch: TickEpoch::default(),
                running: AtomicBool::new(false),
                signals: tx,
            }),
            config,
            signals: rx,
            stepper: None,
            firmware: None,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Map a device. Overlapping ranges and bad interrupt lines are rejected.
    pub fn add_device(
        &self,
        name: impl Into<String>,
        base: u64,
        size: u64,
        irq: Option<u32>,
        dev: Box<dyn Device>,
    ) -> SimResult<usize> {
        lock(&self.shared.core).bus.register_device(DeviceEntry {
            name: name.into(),
            base,
            size,
            irq,
            dev,
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn SimulationObserver>) {
        lock(&self.shared.core).observers.push(observer);
    }

    /// A firmware handle, for harnesses that drive memory directly.
    pub fn firmware(&self) -> Firmware {
        Firmware {
            shared: self.shared.clone(),
        }
    }

    pub fn register_isr<F>(&self, line: u32, handler: F) -> SimResult<()>
    where
        F: FnMut(&mut IsrContext<'_>) + Send + 'static,
    {
        if in_tick() {
            return Err(SimError::InIsr("register_isr"));
        }
        self.shared.register_isr(line, Box::new(handler))
    }

    /// Pend `line`, waking the stepping loop early if the line is enabled.
    pub fn request_irq(&self, line: u32) -> bool {
        self.shared.request_irq(line)
    }

    pub fn enable_irq(&self, line: u32, enabled: bool) {
        self.shared.nvic.set_enabled(line, enabled);
    }

    pub fn interrupt_state(&self) -> Arc<NvicState> {
        self.shared.nvic.clone()
    }

    /// Run one tick on the calling thread.
    pub fn step(&self) -> TickReport {
        self.shared.tick()
    }

    /// Run `ticks` ticks on the calling thread; returns how many interrupts
    /// were dispatched.
    pub fn run_ticks(&self, ticks: u64) -> usize {
        (0..ticks).map(|_| self.step().dispatched.len()).sum()
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.epoch.tick()
    }

    pub fn sim_time(&self) -> Duration {
        let nanos = self.config.tick.as_nanos() * self.tick_count() as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawn the firmware thread running `entry` and the stepping loop.
    pub fn start<F>(&mut self, entry: F) -> SimResult<()>
    where
        F: FnOnce(Firmware) + Send + 'static,
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::AlreadyRunning);
        }
        self.shared.epoch.restart();
        for observer in lock(&self.shared.core).observers.iter() {
            observer.on_simulation_start();
        }

        let fw = self.firmware();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("chambersim-firmware".into())
            .spawn(move || {
                let shared = fw.shared.clone();
                entry(fw);
                if shared.is_running() {
                    tracing::warn!("Firmware entry point returned while the simulator is running");
                }
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(SimError::Spawn {
                    name: "firmware",
                    source,
                });
            }
        };
        self.firmware = Some(Worker {
            handle,
            done: done_rx,
        });

        let shared = self.shared.clone();
        let signals = self.signals.clone();
        let pacing = self.config.pacing;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let stepper = thread::Builder::new()
            .name("chambersim-stepper".into())
            .spawn(move || {
                stepping_loop(shared, signals, pacing);
                let _ = done_tx.send(());
            })
            .map_err(|source| SimError::Spawn {
                name: "stepper",
                source,
            });
        match stepper {
            Ok(handle) => {
                self.stepper = Some(Worker {
                    handle,
                    done: done_rx,
                })
            }
            Err(e) => {
                // Unblock the firmware thread before reporting.
                let _ = self.stop();
                return Err(e);
            }
        }

        tracing::info!(
            "Simulation started: tick {:?}, {} interrupt lines",
            self.config.tick,
            self.shared.nvic.line_count()
        );
        Ok(())
    }

    /// Block until tick `target` completes, at most `timeout`.
    pub fn wait_until_tick(&self, target: u64, timeout: Duration) -> bool {
        self.shared.epoch.wait_tick_timeout(target, timeout)
    }

    /// Stop the stepping loop and join both simulator threads.
    ///
    /// Each join waits at most the configured join timeout. A thread still
    /// running after that is a fatal [`SimError::ShutdownTimeout`] and is left
    /// detached. A stepping loop stuck inside an interrupt handler still holds
    /// the core, so in that case observers are not notified.
    pub fn stop(&mut self) -> SimResult<()> {
        let timeout = self.config.join_timeout;
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        // A full channel already holds a signal the loop will act on.
        let _ = self.shared.signals.try_send(LoopSignal::Stop);
        let stepper_joined = match self.stepper.take() {
            Some(stepper) => stepper.join_within(timeout, "Stepper"),
            None => true,
        };
        self.shared.epoch.stop();
        self.shared.gate.resume();
        if !stepper_joined {
            // The firmware thread may be queued on the core lock behind the
            // stuck handler; it cannot be joined either.
            self.firmware = None;
            return Err(SimError::ShutdownTimeout(timeout));
        }
        // Drop any stale signal so a restart begins clean.
        while self.signals.try_recv().is_ok() {}

        if was_running {
            for observer in lock(&self.shared.core).observers.iter() {
                observer.on_simulation_stop();
            }
        }

        let Some(fw) = self.firmware.take() else {
            return Ok(());
        };
        if fw.join_within(timeout, "Firmware") {
            tracing::info!("Simulation stopped at tick {}", self.tick_count());
            Ok(())
        } else {
            Err(SimError::ShutdownTimeout(timeout))
        }
    }

    /// Run `f` against device `name` if it is a `T`.
    pub fn with_device<T, R>(&self, name: &str, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: Device + 'static,
    {
        let mut core = lock(&self.shared.core);
        let entry = core.bus.find_mut(name)?;
        let dev = entry.dev.as_any_mut()?.downcast_mut::<T>()?;
        Some(f(dev))
    }

    /// Host end of the CAN controller on `bus`.
    pub fn can_port(&self, bus: u8) -> Option<CanHostPort> {
        let mut core = lock(&self.shared.core);
        core.bus.devices.iter_mut().find_map(|entry| {
            let can = entry.dev.as_any_mut()?.downcast_mut::<FlexCan>()?;
            (can.bus() == bus).then(|| can.host_port())
        })
    }

    /// Capture traffic of every CAN controller into `trace`.
    pub fn attach_can_trace(&self, trace: CanTrace) -> usize {
        let mut core = lock(&self.shared.core);
        let mut attached = 0;
        for entry in core.bus.devices.iter_mut() {
            if let Some(can) = entry
                .dev
                .as_any_mut()
                .and_then(|d| d.downcast_mut::<FlexCan>())
            {
                can.set_trace(Some(trace.clone()));
                attached += 1;
            }
        }
        attached
    }

    pub fn uart_port(&self, name: &str) -> Option<UartHostPort> {
        self.with_device::<Uart, _>(name, |uart| uart.host_port())
    }

    /// Capture UART `name`'s transmitted bytes into `sink`.
    pub fn attach_uart_tx_sink(
        &self,
        name: &str,
        sink: Arc<Mutex<Vec<u8>>>,
        echo_stdout: bool,
    ) -> bool {
        self.with_device::<Uart, _>(name, |uart| uart.set_sink(Some(sink), echo_stdout))
            .is_some()
    }

    /// Absolute address of register `reg` of device `device`.
    pub fn register_address(&self, device: &str, reg: &str) -> Option<u64> {
        lock(&self.shared.core).bus.register_address(device, reg)
    }

    pub fn peek_device(&self, name: &str) -> Option<serde_json::Value> {
        lock(&self.shared.core)
            .bus
            .find(name)
            .map(|entry| entry.dev.snapshot())
    }

    pub fn snapshot(&self) -> SimulatorSnapshot {
        let core = lock(&self.shared.core);
        SimulatorSnapshot {
            tick: core.tick,
            sim_time_us: self.sim_time().as_micros() as u64,
            interrupts: self.shared.nvic.snapshot(),
            devices: core
                .bus
                .devices
                .iter()
                .map(|entry| (entry.name.clone(), entry.dev.snapshot()))
                .collect(),
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if self.stepper.is_none() && self.firmware.is_none() {
            return;
        }
        if let Err(e) = self.stop() {
            tracing::error!("Simulator shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::peripherals::timer::Timer;
    use std::sync::atomic::AtomicU32;

    const TIM2: u64 = 0x4000_0000;

    fn sim() -> Simulator {
        Simulator::new(SimConfig {
            irq_lines: 64,
            ..Default::default()
        })
    }

    #[test]
    fn test_request_then_enable_dispatches_once() {
        let sim = sim();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        sim.register_isr(7, move |ctx| {
            assert_eq!(ctx.line(), 7);
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Latched while disabled.
        assert!(!sim.request_irq(7));
        assert!(sim.step().dispatched.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sim.enable_irq(7, true);
        assert_eq!(sim.step().dispatched, vec![7]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!sim.interrupt_state().is_pending(7));

        assert!(sim.step().dispatched.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_in_index_order() {
        let sim = sim();
        let order = Arc::new(Mutex::new(Vec::new()));
        for line in [40, 3, 12] {
            let order = order.clone();
            sim.register_isr(line, move |ctx| order.lock().unwrap().push(ctx.line()))
                .unwrap();
            sim.enable_irq(line, true);
            sim.request_irq(line);
        }
        assert_eq!(sim.step().dispatched, vec![3, 12, 40]);
        assert_eq!(*order.lock().unwrap(), vec![3, 12, 40]);
    }

    #[test]
    fn test_reregistering_overwrites_handler() {
        let sim = sim();
        let seen = Arc::new(AtomicU32::new(0));
        let s1 = seen.clone();
        let s2 = seen.clone();
        sim.register_isr(5, move |_| s1.store(1, Ordering::SeqCst)).unwrap();
        sim.register_isr(5, move |_| s2.store(2, Ordering::SeqCst)).unwrap();
        sim.enable_irq(5, true);
        sim.request_irq(5);
        sim.step();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_isr_out_of_range() {
        let sim = sim();
        let err = sim.register_isr(64, |_| {}).unwrap_err();
        assert!(matches!(err, SimError::InvalidIrqLine { line: 64, lines: 64 }));
    }

    #[test]
    fn test_register_isr_from_handler_is_rejected() {
        let sim = sim();
        let fw = sim.firmware();
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        sim.register_isr(1, move |_| {
            *o.lock().unwrap() = Some(fw.register_isr(2, |_| {}));
        })
        .unwrap();
        sim.enable_irq(1, true);
        sim.request_irq(1);

        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(sim.step().dispatched);
        });
        let dispatched = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("tick did not complete");
        assert_eq!(dispatched, vec![1]);
        assert!(matches!(
            outcome.lock().unwrap().take(),
            Some(Err(SimError::InIsr("register_isr")))
        ));
    }

    #[test]
    fn test_unhandled_line_is_consumed() {
        let sim = sim();
        sim.enable_irq(9, true);
        sim.request_irq(9);
        assert_eq!(sim.step().dispatched, vec![9]);
        assert!(!sim.interrupt_state().is_pending(9));
    }

    #[test]
    fn test_handler_pended_line_waits_for_next_tick() {
        let sim = sim();
        let hits = Arc::new(AtomicU32::new(0));
        sim.register_isr(1, |ctx| {
            ctx.request_irq(2);
        })
        .unwrap();
        let h = hits.clone();
        sim.register_isr(2, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sim.enable_irq(1, true);
        sim.enable_irq(2, true);
        sim.request_irq(1);

        assert_eq!(sim.step().dispatched, vec![1]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(sim.step().dispatched, vec![2]);
    }

    #[test]
    fn test_timer_interrupt_through_handler() {
        let sim = sim();
        sim.add_device("tim2", TIM2, 0x400, Some(28), Box::new(Timer::with_clock(1_000)))
            .unwrap();
        let mut fw = sim.firmware();
        fw.write_u32(TIM2 + 0x2C, 4); // ARR
        fw.write_u32(TIM2 + 0x0C, 1); // UIE
        fw.write_u32(TIM2, 1); // CEN

        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        sim.register_isr(28, move |ctx| {
            // Acknowledge UIF.
            ctx.write_u32(TIM2 + 0x10, 0);
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sim.enable_irq(28, true);

        sim.run_ticks(10);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(sim.tick_count(), 10);
        assert_eq!(sim.sim_time(), Duration::from_millis(10));
    }

    #[test]
    fn test_start_and_stop_with_cooperative_firmware() {
        let mut sim = sim();
        sim.start(|fw| while fw.delay_ticks(1) {}).unwrap();
        assert!(matches!(sim.start(|_| {}), Err(SimError::AlreadyRunning)));
        assert!(sim.wait_until_tick(5, Duration::from_secs(5)));
        sim.stop().unwrap();
        assert!(!sim.is_running());
    }

    #[test]
    fn test_wait_for_interrupt_wakes_on_dispatch() {
        let mut sim = sim();
        sim.enable_irq(4, true);
        sim.register_isr(4, |_| {}).unwrap();
        let woke = Arc::new(AtomicU32::new(0));
        let w = woke.clone();
        sim.start(move |fw| {
            while fw.wait_for_interrupt() {
                w.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let target = sim.tick_count() + 3;
        assert!(sim.wait_until_tick(target, Duration::from_secs(5)));
        sim.request_irq(4);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while woke.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        sim.stop().unwrap();
        assert!(woke.load(Ordering::SeqCst) >= 1);
    }
}
