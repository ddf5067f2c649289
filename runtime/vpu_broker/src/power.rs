//! Power/Clock Gate - Couples a core's lines to its reservation state
//!
//! Each core owns a [`PowerGate`]: its clock, reset and power-domain line
//! indices plus an enabled flag behind a per-core mutex. Activation runs
//! clock-enable, then reset-deassert across the core's reset lines, then
//! power-domain on, then waits for the hardware to settle. Deactivation
//! runs the reverse. Both are no-ops when the gate is already in the
//! requested state.
//!
//! The gate lock may be held across a sleep, so it is never taken while a
//! list's ownership lock is held. A release that wants to idle a core
//! passes the claim epoch it observed; if the core was claimed again in
//! the meantime the epoch moved and the deactivation is skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::registry::CoreId;

/// Platform hooks driving clock, reset and power-domain lines
pub trait PowerControl: Send + Sync {
    fn clock_enable(&self, index: usize, on: bool);

    /// `deassert == true` takes the block out of reset
    fn reset(&self, index: usize, deassert: bool);

    fn power_domain(&self, index: usize, on: bool);

    fn set_clock_rate(&self, index: usize, hz: u64);
}

/// Control for platforms where the lines are not software managed
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPowerControl;

impl PowerControl for NoPowerControl {
    fn clock_enable(&self, _index: usize, _on: bool) {}
    fn reset(&self, _index: usize, _deassert: bool) {}
    fn power_domain(&self, _index: usize, _on: bool) {}
    fn set_clock_rate(&self, _index: usize, _hz: u64) {}
}

/// One line transition, as seen by [`RecordingPowerControl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Clock { index: usize, on: bool },
    Reset { index: usize, deassert: bool },
    Domain { index: usize, on: bool },
    Rate { index: usize, hz: u64 },
}

/// Control that records every transition in order
#[derive(Debug, Default)]
pub struct RecordingPowerControl {
    events: Mutex<Vec<PowerEvent>>,
}

impl RecordingPowerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PowerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the recorded events, leaving the log empty
    pub fn drain(&self) -> Vec<PowerEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn push(&self, event: PowerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl PowerControl for RecordingPowerControl {
    fn clock_enable(&self, index: usize, on: bool) {
        self.push(PowerEvent::Clock { index, on });
    }

    fn reset(&self, index: usize, deassert: bool) {
        self.push(PowerEvent::Reset { index, deassert });
    }

    fn power_domain(&self, index: usize, on: bool) {
        self.push(PowerEvent::Domain { index, on });
    }

    fn set_clock_rate(&self, index: usize, hz: u64) {
        self.push(PowerEvent::Rate { index, hz });
    }
}

fn default_reset_count() -> usize {
    3
}

/// Control line indices of one core, as supplied by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PowerLines {
    #[serde(default)]
    pub clock: Option<usize>,
    /// First reset line; the core uses `reset_count` consecutive lines
    #[serde(default)]
    pub reset: Option<usize>,
    #[serde(default = "default_reset_count")]
    pub reset_count: usize,
    #[serde(default)]
    pub power_domain: Option<usize>,
}

impl Default for PowerLines {
    fn default() -> Self {
        Self {
            clock: None,
            reset: None,
            reset_count: default_reset_count(),
            power_domain: None,
        }
    }
}

impl PowerLines {
    fn reset_lines(&self) -> impl Iterator<Item = usize> {
        let count = if self.reset.is_some() { self.reset_count } else { 0 };
        let first = self.reset.unwrap_or(0);
        first..first + count
    }
}

#[derive(Debug)]
struct GateState {
    enabled: bool,
    clock_rate: u64,
}

/// Per-core power state
#[derive(Debug)]
pub(crate) struct PowerGate {
    lines: PowerLines,
    state: Mutex<GateState>,
    epoch: AtomicU64,
}

impl PowerGate {
    /// Gate for a core the prober found powered
    pub fn new(lines: PowerLines) -> Self {
        Self {
            lines,
            state: Mutex::new(GateState {
                enabled: true,
                clock_rate: 0,
            }),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn lines(&self) -> PowerLines {
        self.lines
    }

    pub fn is_enabled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled
    }

    pub fn clock_rate(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clock_rate
    }

    /// Record a new claim; called under the list lock
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Power the core up; returns true if it was off
    pub fn activate(&self, id: CoreId, control: &dyn PowerControl, settle: Duration) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.enabled {
            return false;
        }

        if let Some(clock) = self.lines.clock {
            control.clock_enable(clock, true);
        }
        for line in self.lines.reset_lines() {
            control.reset(line, true);
        }
        if let Some(domain) = self.lines.power_domain {
            control.power_domain(domain, true);
        }
        state.enabled = true;
        settle_for(settle);

        debug!("{} powered up", id);
        true
    }

    /// Power the core down; returns true if it was on
    pub fn deactivate(&self, id: CoreId, control: &dyn PowerControl, settle: Duration) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.power_down(&mut state, id, control, settle)
    }

    /// Deactivate unless the core was claimed again after `epoch`
    ///
    /// The epoch is compared under the gate lock, so a claim that races
    /// with this call either is seen here or activates after it.
    pub fn deactivate_if_idle(
        &self,
        id: CoreId,
        epoch: u64,
        control: &dyn PowerControl,
        settle: Duration,
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch() != epoch {
            debug!("{} reclaimed before power down", id);
            return false;
        }
        self.power_down(&mut state, id, control, settle)
    }

    fn power_down(
        &self,
        state: &mut GateState,
        id: CoreId,
        control: &dyn PowerControl,
        settle: Duration,
    ) -> bool {
        if !state.enabled {
            return false;
        }

        if let Some(domain) = self.lines.power_domain {
            control.power_domain(domain, false);
        }
        for line in self.lines.reset_lines() {
            control.reset(line, false);
        }
        if let Some(clock) = self.lines.clock {
            control.clock_enable(clock, false);
        }
        state.enabled = false;
        settle_for(settle);

        debug!("{} powered down", id);
        true
    }

    /// Apply the device-wide clock policy if it differs from the last rate
    pub fn apply_rate(&self, control: &dyn PowerControl, policy_hz: u64) -> bool {
        if policy_hz == 0 {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.clock_rate == policy_hz {
            return false;
        }
        if let Some(clock) = self.lines.clock {
            control.set_clock_rate(clock, policy_hz);
        }
        state.clock_rate = policy_hz;
        true
    }
}

fn settle_for(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

/// Power settings shared by every list of a device
#[derive(Clone)]
pub(crate) struct GatePolicy {
    pub control: Arc<dyn PowerControl>,
    pub settle: Duration,
    pub gating: bool,
    pub clock_hz: Arc<AtomicU64>,
}

impl GatePolicy {
    pub fn clock_policy(&self) -> u64 {
        self.clock_hz.load(Ordering::Relaxed)
    }
}
