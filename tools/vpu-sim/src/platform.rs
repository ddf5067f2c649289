//! Platform description - Devices, nodes and simulated register contents

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use vpu_broker::sim::{SimBus, SimCore};
use vpu_broker::{
    BrokerConfig, CodecFormat, Context, DeviceDescriptor, DeviceId, Formats, Generation,
    NodeDescriptor, PowerControl, RecordingPowerControl, RegionMapper,
};

#[derive(Debug, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub broker: BrokerConfig,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeDescriptor>,
    /// Register banks backing the nodes, keyed by base address
    #[serde(default)]
    pub banks: Vec<BankSpec>,
}

/// Contents of one simulated core
#[derive(Debug, Deserialize)]
pub struct BankSpec {
    pub base: u64,
    pub generation: Generation,
    #[serde(default)]
    pub major: Option<u8>,
    #[serde(default)]
    pub formats: Vec<CodecFormat>,
    #[serde(default)]
    pub pipeline: Vec<CodecFormat>,
    #[serde(default)]
    pub cache_config: u32,
}

fn mask(formats: &[CodecFormat]) -> Formats {
    formats
        .iter()
        .fold(Formats::empty(), |acc, format| acc | format.flag())
}

impl BankSpec {
    fn core(&self) -> SimCore {
        let core = match self.generation {
            Generation::Cache => SimCore::cache(self.cache_config),
            Generation::H1 | Generation::Vc8000e => SimCore::encoder(self.generation),
            generation => SimCore::decoder(generation),
        };
        let core = match self.major {
            Some(major) => core.major(major),
            None => core,
        };
        core.formats(mask(&self.formats)).pipeline(mask(&self.pipeline))
    }
}

impl Platform {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Install every bank and attach every device
    pub fn attach(&self) -> Result<Simulation> {
        let bus = Arc::new(SimBus::new());
        let power = Arc::new(RecordingPowerControl::new());
        let ctx = Context::new(
            self.broker.clone(),
            Arc::clone(&bus) as Arc<dyn RegionMapper>,
            Arc::clone(&power) as Arc<dyn PowerControl>,
        );

        let mut devices = Vec::with_capacity(self.devices.len());
        for entry in &self.devices {
            for bank in &entry.banks {
                bus.install(bank.base, bank.core().build());
            }
            let id = ctx
                .attach(&DeviceDescriptor {
                    name: entry.name.clone(),
                    nodes: entry.nodes.clone(),
                })
                .with_context(|| format!("Failed to attach device '{}'", entry.name))?;
            log::info!("'{}' attached as {}", entry.name, id);
            devices.push(id);
        }

        Ok(Simulation {
            ctx,
            bus,
            power,
            devices,
        })
    }
}

/// An attached platform
pub struct Simulation {
    pub ctx: Context,
    pub bus: Arc<SimBus>,
    pub power: Arc<RecordingPowerControl>,
    pub devices: Vec<DeviceId>,
}
