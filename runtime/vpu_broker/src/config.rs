//! Broker configuration

use std::time::Duration;

use serde::Deserialize;

use crate::registry::CoreKind;

/// Tunables applied to every device attached through a [`crate::Context`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enable_decode: bool,
    pub enable_encode: bool,
    pub enable_cache: bool,
    /// Register interrupt lines at attach; otherwise completion comes from
    /// explicit [`crate::Device::poll_interrupts`] calls
    pub irq_mode: bool,
    /// Default completion wait, used when a wait passes no timeout
    pub wait_timeout_ms: u64,
    /// Settle delay after a power transition
    pub settle_delay_us: u64,
    /// Power cores down while nobody holds them
    pub power_gating: bool,
    /// Fail a reservation for a format no core supports instead of blocking
    pub reject_unsupported: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enable_decode: true,
            enable_encode: true,
            enable_cache: true,
            irq_mode: true,
            wait_timeout_ms: 10,
            settle_delay_us: 1000,
            power_gating: true,
            reject_unsupported: true,
        }
    }
}

impl BrokerConfig {
    pub fn enabled(&self, kind: CoreKind) -> bool {
        match kind {
            CoreKind::Decoder => self.enable_decode,
            CoreKind::Encoder => self.enable_encode,
            CoreKind::Cache => self.enable_cache,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_micros(self.settle_delay_us)
    }
}
