//! Register and data model of the simulated BIT 802E + BOP pair.
//!
//! A [`Device`] is a cheaply cloneable handle to one instrument; every
//! clone shares the same register file. Registers mutate only through SCPI
//! dispatch ([`Device::process`]) or the LIST runner, always under one
//! mutex with short critical sections. Multiple independent instruments
//! per process are fine; nothing here is global.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::scpi::Quantity;

/// Identity returned by `*IDN?`.
pub const IDN: &str = "KEPCO,BOP 50-20M,SIM-001,1.5 (Simulator)";

/// SCPI standard revision returned by `SYST:VERS?`.
pub const SCPI_VERSION: &str = "1995.0";

/// ±2 mV / mA measurement noise.
pub const NOISE_AMPLITUDE: f64 = 0.002;

/// Guardrail for unterminated input lines.
pub const MAX_RX_LINE_BYTES: usize = 64_000_000;

/// Observer log lines longer than this are truncated.
pub const MAX_LOG_TEXT: usize = 1200;

/// How long to wait for the LIST runner thread to acknowledge a stop.
const RUNNER_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Source regulation mode for one quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Fix,
    List,
    Tran,
}

impl SourceMode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            SourceMode::Fix => "FIX",
            SourceMode::List => "LIST",
            SourceMode::Tran => "TRAN",
        }
    }
}

/// LIST execution direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListDirection {
    Up,
    Down,
}

impl ListDirection {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ListDirection::Up => "UP",
            ListDirection::Down => "DOWN",
        }
    }
}

/// How the LIST execution order is generated: directly from the point
/// array (`DSEQ`) or through the programmed `LIST:SEQ` index table (`SEQ`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListGeneration {
    Dseq,
    Seq,
}

impl ListGeneration {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ListGeneration::Dseq => "DSEQ",
            ListGeneration::Seq => "SEQ",
        }
    }
}

/// Direction tag on observer log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    /// Command received from a controller.
    Rx,
    /// Response sent back.
    Tx,
    /// Internal event (connect, disconnect, dropped input).
    Sys,
}

/// Hooks fired by the device as it processes traffic.
///
/// Hooks run on server and sequencer threads, so implementations must not
/// block; hand off to a channel when the consumer is slow.
pub trait DeviceObserver: Send + Sync {
    /// Registers changed. Fired after every processed command line and
    /// after every LIST step.
    fn state_changed(&self) {}

    /// One protocol log line.
    fn log(&self, direction: LogDirection, text: &str) {
        let _ = (direction, text);
    }
}

struct NullObserver;

impl DeviceObserver for NullObserver {}

/// The full register file.
///
/// [`Device::snapshot`] hands out clones of this for display layers.
#[derive(Debug, Clone)]
pub struct Registers {
    // Output
    pub output_on: bool,
    pub func_mode: Quantity,
    pub volt_setpoint: f64,
    pub curr_setpoint: f64,
    /// Setpoints stashed while the output is off, restored on `OUTP ON`.
    pub volt_saved: f64,
    pub curr_saved: f64,
    // Range (0 = quarter scale, 1 = full scale)
    pub volt_range_auto: bool,
    pub curr_range_auto: bool,
    pub volt_range: i64,
    pub curr_range: i64,
    // Mode
    pub volt_mode: SourceMode,
    pub curr_mode: SourceMode,
    // LIST subsystem
    pub list_volt: Vec<f64>,
    pub list_curr: Vec<f64>,
    pub list_dwell: Vec<f64>,
    /// Iteration count; 0 (or negative) runs forever.
    pub list_count: i64,
    pub list_count_skip: i64,
    pub list_direction: ListDirection,
    pub list_generation: ListGeneration,
    pub list_sequence: Vec<i64>,
    /// Read cursor for the paginated LIST data queries.
    pub list_query_ptr: usize,
    pub list_running: bool,
    pub list_step_idx: usize,
    pub list_iteration: u64,
    // Trigger stubs
    pub init_cont: bool,
    pub volt_trig: f64,
    pub curr_trig: f64,
    // Status registers
    pub esr: i64,
    pub stb: i64,
    pub oper_cond: i64,
    pub oper_enable: i64,
    pub oper_event: i64,
    pub ques_cond: i64,
    pub ques_enable: i64,
    pub ques_event: i64,
    // Error queue, FIFO of (code, message)
    pub error_queue: VecDeque<(i32, String)>,
    // Traffic counters
    pub cmd_count: u64,
    pub query_count: u64,
}

impl Default for Registers {
    /// Power-on defaults.
    fn default() -> Self {
        Registers {
            output_on: false,
            func_mode: Quantity::Volt,
            volt_setpoint: 0.0,
            curr_setpoint: 0.0,
            volt_saved: 0.0,
            curr_saved: 0.0,
            volt_range_auto: true,
            curr_range_auto: true,
            volt_range: 1,
            curr_range: 1,
            volt_mode: SourceMode::Fix,
            curr_mode: SourceMode::Fix,
            list_volt: Vec::new(),
            list_curr: Vec::new(),
            list_dwell: Vec::new(),
            list_count: 1,
            list_count_skip: 0,
            list_direction: ListDirection::Up,
            list_generation: ListGeneration::Dseq,
            list_sequence: Vec::new(),
            list_query_ptr: 0,
            list_running: false,
            list_step_idx: 0,
            list_iteration: 0,
            init_cont: true,
            volt_trig: 0.0,
            curr_trig: 0.0,
            esr: 0,
            stb: 0,
            oper_cond: 0,
            oper_enable: 0,
            oper_event: 0,
            ques_cond: 0,
            ques_enable: 0,
            ques_event: 0,
            error_queue: VecDeque::new(),
            cmd_count: 0,
            query_count: 0,
        }
    }
}

struct DeviceInner {
    regs: Mutex<Registers>,
    /// Cancellation token for the LIST runner.
    list_stop: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
    observer: Arc<dyn DeviceObserver>,
}

/// Handle to one simulated instrument. Cloning shares the instrument.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// Create an instrument in its power-on state, with no observer.
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NullObserver))
    }

    /// Create an instrument whose traffic and state changes feed `observer`.
    pub fn with_observer(observer: Arc<dyn DeviceObserver>) -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                regs: Mutex::new(Registers::default()),
                list_stop: AtomicBool::new(true),
                runner: Mutex::new(None),
                observer,
            }),
        }
    }

    /// Run a short closure against the register file.
    pub(crate) fn with_regs<R>(&self, f: impl FnOnce(&mut Registers) -> R) -> R {
        f(&mut self.inner.regs.lock().unwrap())
    }

    /// Snapshot of every register, for display layers.
    pub fn snapshot(&self) -> Registers {
        self.inner.regs.lock().unwrap().clone()
    }

    pub(crate) fn notify(&self) {
        self.inner.observer.state_changed();
    }

    pub(crate) fn log(&self, direction: LogDirection, text: &str) {
        if text.len() > MAX_LOG_TEXT {
            let mut cut = MAX_LOG_TEXT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            let hidden = text.len() - cut;
            let truncated = format!("{} ... [truncated {} chars]", &text[..cut], hidden);
            self.inner.observer.log(direction, &truncated);
        } else {
            self.inner.observer.log(direction, text);
        }
    }

    /// Append one entry to the error queue.
    pub(crate) fn push_error(&self, code: i32, message: impl Into<String>) {
        self.inner
            .regs
            .lock()
            .unwrap()
            .error_queue
            .push_back((code, message.into()));
    }

    /// Pop the oldest queued error, or the `0,"No error"` sentinel.
    pub fn pop_error(&self) -> (i32, String) {
        self.inner
            .regs
            .lock()
            .unwrap()
            .error_queue
            .pop_front()
            .unwrap_or((0, "No error".to_string()))
    }

    /// Simulated measurement: the live LIST step value while a list runs,
    /// the setpoint otherwise, zero with the output off, ±2 mV/mA noise.
    pub fn measure(&self, quantity: Quantity) -> f64 {
        let base = {
            let regs = self.inner.regs.lock().unwrap();
            if !regs.output_on {
                return 0.0;
            }
            let (list, setpoint) = match quantity {
                Quantity::Volt => (&regs.list_volt, regs.volt_setpoint),
                Quantity::Curr => (&regs.list_curr, regs.curr_setpoint),
            };
            if regs.list_running && !list.is_empty() {
                list[regs.list_step_idx.min(list.len() - 1)]
            } else {
                setpoint
            }
        };
        base + rand::thread_rng().gen_range(-NOISE_AMPLITUDE..=NOISE_AMPLITUDE)
    }

    /// Reset to power-on defaults (`*RST`).
    ///
    /// A running list is stopped and its thread joined first so no stale
    /// background writer can touch the fresh register file.
    pub fn reset(&self) {
        self.stop_list();
        *self.inner.regs.lock().unwrap() = Registers::default();
        self.notify();
    }

    /// Stop any running list, demote LIST modes back to FIX and wait
    /// (bounded) for the runner thread to exit.
    pub fn stop_list(&self) {
        {
            let mut regs = self.inner.regs.lock().unwrap();
            regs.list_running = false;
            if regs.volt_mode == SourceMode::List {
                regs.volt_mode = SourceMode::Fix;
            }
            if regs.curr_mode == SourceMode::List {
                regs.curr_mode = SourceMode::Fix;
            }
        }
        self.inner.list_stop.store(true, Ordering::SeqCst);
        self.join_runner();
        self.notify();
    }

    /// Wait for the runner thread to finish. Dwell sleeps are sliced at
    /// 50 ms, so a healthy runner exits almost immediately.
    fn join_runner(&self) {
        let handle = self.inner.runner.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + RUNNER_EXIT_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!("list runner did not exit within {:?}", RUNNER_EXIT_TIMEOUT);
            }
        }
    }

    pub(crate) fn clear_stop(&self) {
        self.inner.list_stop.store(false, Ordering::SeqCst);
    }

    pub(crate) fn request_stop(&self) {
        self.inner.list_stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.inner.list_stop.load(Ordering::SeqCst)
    }

    pub(crate) fn store_runner(&self, handle: JoinHandle<()>) {
        *self.inner.runner.lock().unwrap() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_defaults() {
        let regs = Device::new().snapshot();
        assert!(!regs.output_on);
        assert_eq!(regs.func_mode, Quantity::Volt);
        assert_eq!(regs.list_count, 1);
        assert_eq!(regs.volt_range, 1);
        assert!(regs.volt_range_auto);
        assert!(regs.init_cont);
        assert!(regs.error_queue.is_empty());
    }

    #[test]
    fn error_queue_is_fifo_with_sentinel() {
        let device = Device::new();
        device.push_error(-100, "first");
        device.push_error(-221, "second");
        assert_eq!(device.pop_error(), (-100, "first".to_string()));
        assert_eq!(device.pop_error(), (-221, "second".to_string()));
        assert_eq!(device.pop_error(), (0, "No error".to_string()));
        assert_eq!(device.pop_error(), (0, "No error".to_string()));
    }

    #[test]
    fn measure_is_zero_with_output_off() {
        let device = Device::new();
        device.with_regs(|r| r.volt_setpoint = 5.0);
        assert_eq!(device.measure(Quantity::Volt), 0.0);
    }

    #[test]
    fn measure_tracks_setpoint_within_noise() {
        let device = Device::new();
        device.with_regs(|r| {
            r.output_on = true;
            r.volt_setpoint = 5.0;
        });
        for _ in 0..50 {
            let m = device.measure(Quantity::Volt);
            assert!((m - 5.0).abs() <= NOISE_AMPLITUDE + 1e-12, "measured {m}");
        }
    }

    #[test]
    fn oversized_log_lines_are_truncated() {
        use std::sync::Mutex as StdMutex;

        struct Capture(StdMutex<Vec<String>>);
        impl DeviceObserver for Capture {
            fn log(&self, _direction: LogDirection, text: &str) {
                self.0.lock().unwrap().push(text.to_string());
            }
        }

        let capture = Arc::new(Capture(StdMutex::new(Vec::new())));
        let device = Device::with_observer(capture.clone());
        device.log(LogDirection::Rx, &"x".repeat(MAX_LOG_TEXT + 100));
        let lines = capture.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[truncated 100 chars]"));
    }
}
