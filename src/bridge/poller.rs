use anyhow::{anyhow, Result};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use super::{
    link::SensorLink,
    mirror::ModbusMirror,
    register_map::{RegisterMap, SensorMapEntry},
};
use crate::config::PollingSettings;

/// Outcome of one pass over the register map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Cycle not run because an upgrade owns the link.
    pub skipped: bool,
}

/// Reads every register map entry from the board and republishes the
/// values in the Modbus mirror.
pub struct PollingScheduler {
    link: Arc<SensorLink>,
    mirror: Arc<ModbusMirror>,
    map: RegisterMap,
    settings: PollingSettings,
}

impl PollingScheduler {
    pub fn new(
        link: Arc<SensorLink>,
        mirror: Arc<ModbusMirror>,
        map: RegisterMap,
        settings: PollingSettings,
    ) -> Self {
        Self {
            link,
            mirror,
            map,
            settings,
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Poll each entry once, in map order.
    ///
    /// Failures are logged per entry and leave that entry's registers
    /// untouched. `running` is checked between entries so shutdown does not
    /// wait for the whole map.
    pub fn poll_cycle(&self, running: &AtomicBool) -> PollReport {
        let gate = self.link.gate();
        if !gate.begin_polling() {
            log::debug!("link is {}, skipping poll cycle", gate.current());
            return PollReport {
                skipped: true,
                ..PollReport::default()
            };
        }

        let mut report = PollReport::default();
        for entry in self.map.entries() {
            if !running.load(Ordering::Acquire) {
                break;
            }
            match self.poll_entry(entry) {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    report.failed += 1;
                    log::info!(
                        "failed to read '{}' bus {}, node {}, addr {}, size {}: {err}",
                        entry.description,
                        entry.bus,
                        entry.node,
                        entry.source_address,
                        entry.size
                    );
                }
            }
            thread::sleep(self.settings.pacing());
        }

        gate.end_polling();
        report
    }

    fn poll_entry(&self, entry: &SensorMapEntry) -> Result<()> {
        let reply = self
            .link
            .request(
                entry.read_command(),
                self.settings.response_timeout(),
                self.settings.wait_step(),
            )
            .ok_or_else(|| anyhow!("no response within {:?}", self.settings.response_timeout()))?;

        if let Some(status) = reply.status().filter(|s| *s != 0) {
            return Err(anyhow!("board reported status {status}"));
        }
        let mut data = reply
            .data()
            .ok_or_else(|| anyhow!("reply carries no register data: {:?}", reply.fields()))?;
        log::debug!("sensor data {:?}", reply.fields());

        if data.len() != entry.size as usize {
            log::warn!(
                "'{}' returned {} registers, expected {}",
                entry.description,
                data.len(),
                entry.size
            );
            data.truncate(entry.size as usize);
        }
        self.mirror.set_values(entry.register_offset, &data)
    }
}
