//! Background LIST execution.
//!
//! A run snapshots the entire LIST configuration at start, so edits made
//! while it executes cannot corrupt it. Steps are paced by real-time dwell
//! sleeps, sliced so cancellation is observed within 50 ms rather than at
//! dwell boundaries. Only one run may exist at a time; the cleanup on exit
//! (running flag down, LIST modes demoted to FIX) is unconditional.

use std::thread;
use std::time::Duration;

use crate::scpi::{Quantity, LIST_DWELL_MAX, LIST_DWELL_MIN};
use crate::sim::device::{Device, ListDirection, ListGeneration, SourceMode};

/// Upper bound on one dwell sleep slice.
const DWELL_SLICE: Duration = Duration::from_millis(50);

/// Configuration snapshot taken when a run starts.
struct ListProgram {
    points: Vec<f64>,
    dwells: Vec<f64>,
    count: i64,
    skip: usize,
    direction: ListDirection,
    generation: ListGeneration,
    sequence: Vec<i64>,
}

impl Device {
    /// Start LIST execution on a background thread.
    ///
    /// Attempting to start while a run is active is a settings conflict;
    /// the existing run is left untouched.
    pub(crate) fn start_list(&self) {
        let already_running = self.with_regs(|regs| {
            if regs.list_running {
                true
            } else {
                regs.list_running = true;
                regs.list_step_idx = 0;
                regs.list_iteration = 0;
                false
            }
        });
        if already_running {
            self.push_error(-221, "Settings conflict; list already running");
            return;
        }

        self.clear_stop();
        let device = self.clone();
        self.store_runner(thread::spawn(move || device.run_list()));
        self.notify();
    }

    fn run_list(&self) {
        self.execute_program();

        // Mirror of stop_list, minus the join: this is the runner itself.
        self.with_regs(|regs| {
            regs.list_running = false;
            if regs.volt_mode == SourceMode::List {
                regs.volt_mode = SourceMode::Fix;
            }
            if regs.curr_mode == SourceMode::List {
                regs.curr_mode = SourceMode::Fix;
            }
        });
        self.request_stop();
        self.notify();
    }

    fn execute_program(&self) {
        let program = self.with_regs(|regs| ListProgram {
            points: match regs.func_mode {
                Quantity::Volt => regs.list_volt.clone(),
                Quantity::Curr => regs.list_curr.clone(),
            },
            dwells: regs.list_dwell.clone(),
            count: regs.list_count,
            skip: regs.list_count_skip.max(0) as usize,
            direction: regs.list_direction,
            generation: regs.list_generation,
            sequence: regs.list_sequence.clone(),
        });

        if program.points.is_empty() {
            self.push_error(-200, "Execution error; list empty");
            return;
        }

        // A single dwell entry broadcasts to every step; anything else
        // must match the point count exactly.
        let dwells = if program.dwells.len() == 1 {
            vec![program.dwells[0]; program.points.len()]
        } else if program.dwells.len() != program.points.len() {
            self.push_error(-221, "Settings conflict; dwell/point mismatch");
            return;
        } else {
            program.dwells.clone()
        };

        let mut order: Vec<usize> = match program.generation {
            ListGeneration::Dseq => (0..program.points.len()).collect(),
            ListGeneration::Seq => program
                .sequence
                .iter()
                .filter_map(|&s| usize::try_from(s).ok())
                .filter(|&s| s < program.points.len())
                .collect(),
        };
        if program.direction == ListDirection::Down {
            order.reverse();
        }
        if order.is_empty() {
            self.push_error(-221, "Settings conflict; empty sequence");
            return;
        }

        let forever = program.count <= 0;
        let mut iteration: u64 = 0;
        while (forever || iteration < program.count as u64) && !self.stop_requested() {
            // COUN:SKIP applies to every iteration after the first. A skip
            // past the end leaves nothing to do and the iteration
            // completes immediately.
            let exec_order: &[usize] = if iteration == 0 {
                &order
            } else {
                &order[program.skip.min(order.len())..]
            };
            for &idx in exec_order {
                if self.stop_requested() {
                    return;
                }
                let still_running = self.with_regs(|regs| {
                    if !regs.list_running {
                        return false;
                    }
                    regs.list_step_idx = idx;
                    regs.list_iteration = iteration;
                    true
                });
                if !still_running {
                    return;
                }
                let dwell = dwells
                    .get(idx)
                    .copied()
                    .unwrap_or(dwells[0])
                    .clamp(LIST_DWELL_MIN, LIST_DWELL_MAX);
                self.notify();
                if !self.dwell_sleep(dwell) {
                    return;
                }
            }
            iteration += 1;
        }
    }

    /// Sleep for `seconds`, slicing so cancellation is observed promptly.
    /// Returns false when the run should abort.
    fn dwell_sleep(&self, seconds: f64) -> bool {
        let mut remaining = Duration::from_secs_f64(seconds);
        while remaining > Duration::ZERO {
            if self.stop_requested() || !self.with_regs(|regs| regs.list_running) {
                return false;
            }
            let slice = remaining.min(DWELL_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        true
    }
}
