use anyhow::{anyhow, Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::signal;

use super::{
    identity::{read_identity, DeviceIdentity},
    link::{SensorLink, SharedTransport},
    mirror::{MirrorServer, ModbusMirror},
    mode::ModeGate,
    poller::PollingScheduler,
    register_map::RegisterMap,
    upgrade::{UpgradeOutcome, Upgrader},
};
use crate::{
    config::BridgeConfig,
    protocol::{
        reset::{self, NoReset},
        transfer::ExternalTransfer,
        transport::open_serial,
        FirmwareTransfer, ResetLine, Transport,
    },
};

/// A started bridge: link threads running, Modbus/TCP server bound.
pub struct Bridge {
    config: BridgeConfig,
    identity: DeviceIdentity,
    link: Arc<SensorLink>,
    mirror: Arc<ModbusMirror>,
    server: MirrorServer,
    scheduler: PollingScheduler,
    upgrader: Upgrader,
}

impl Bridge {
    /// Bring the bridge up on an already opened transport.
    ///
    /// `reset_line` receives the shared transport so a DTR-driven reset can
    /// be built on top of it.
    pub async fn start<F>(
        config: BridgeConfig,
        transport: Box<dyn Transport>,
        reset_line: F,
        transfer: Arc<dyn FirmwareTransfer>,
    ) -> Result<Self>
    where
        F: FnOnce(SharedTransport) -> Result<Box<dyn ResetLine>>,
    {
        let link = SensorLink::new(transport, ModeGate::new());
        let reset_line: Box<dyn ResetLine> = match reset_line(Arc::clone(link.transport())) {
            Ok(line) => line,
            Err(err) => {
                log::error!("reset line unavailable, upgrades need a manual reset: {err:#}");
                Box::new(NoReset)
            }
        };
        link.start().context("Failed to start serial link threads")?;

        let (identity, map) = {
            let link = Arc::clone(&link);
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                let identity = read_identity(&link, &config.polling);
                let map = RegisterMap::load(&config, &identity);
                (identity, map)
            })
            .await
            .map_err(|err| anyhow!("identity task failed: {err}"))?
        };
        log::info!(
            "using {} register map entries from {:?}",
            map.len(),
            map.source()
        );

        let mirror = ModbusMirror::new(config.modbus.unit_id, map.capacity());
        let server = match MirrorServer::start(Arc::clone(&mirror), &config.modbus.listen).await {
            Ok(server) => server,
            Err(err) => {
                link.stop();
                return Err(err);
            }
        };

        let scheduler = PollingScheduler::new(
            Arc::clone(&link),
            Arc::clone(&mirror),
            map,
            config.polling.clone(),
        );
        let upgrader = Upgrader::new(
            Arc::clone(link.transport()),
            reset_line,
            transfer,
            config.upgrade.clone(),
        );

        Ok(Self {
            config,
            identity,
            link,
            mirror,
            server,
            scheduler,
            upgrader,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn link(&self) -> &Arc<SensorLink> {
        &self.link
    }

    pub fn mirror(&self) -> &Arc<ModbusMirror> {
        &self.mirror
    }

    pub fn server(&self) -> &MirrorServer {
        &self.server
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    /// One poll cycle followed by an upgrade check.
    pub fn step(&mut self, running: &AtomicBool) -> Option<UpgradeOutcome> {
        let report = self.scheduler.poll_cycle(running);
        log::debug!("poll cycle: {report:?}");
        if report.succeeded + report.failed == 0 {
            std::thread::sleep(self.config.polling.pacing());
        }

        let outcome = self.upgrader.check_upgrade(&self.link, &self.config.files)?;
        match &outcome {
            UpgradeOutcome::Upgraded { image, attempt } => {
                log::info!("sensor board upgraded from {} ({attempt})", image.display())
            }
            UpgradeOutcome::Failed => log::error!("sensor board upgrade failed"),
            UpgradeOutcome::Rejected => log::warn!("upgrade request rejected"),
        }
        Some(outcome)
    }

    /// Loop over [`Bridge::step`] until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            self.step(running);
        }
    }

    /// Stop serving, join the link threads and release the reset line.
    pub async fn shutdown(mut self) {
        self.server.stop().await;
        self.link.stop();
        if let Err(err) = self.upgrader.release_reset_line() {
            log::warn!("failed to release reset line: {err:#}");
        }
        log::info!("bridge stopped");
    }
}

/// Run the bridge on the configured serial port until interrupted.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let port = open_serial(&config.serial)
        .with_context(|| format!("open serial {} failed", config.serial.port))?;
    log::info!(
        "serial {} opened at {} baud",
        config.serial.port,
        config.serial.baud_rate
    );

    let transfer: Arc<dyn FirmwareTransfer> =
        Arc::new(ExternalTransfer::new(&config.transfer, &config.serial.port));
    let reset_config = config.reset.clone();
    let mut bridge = Bridge::start(
        config,
        Box::new(port),
        move |transport| reset::from_config(&reset_config, transport),
        transfer,
    )
    .await?;

    let running = Arc::new(AtomicBool::new(true));
    let worker = {
        let running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            bridge.run(&running);
            bridge
        })
    };

    match signal::ctrl_c().await {
        Ok(()) => log::info!("Received shutdown signal, stopping bridge"),
        Err(err) => log::error!("Error waiting for shutdown signal: {err}"),
    }
    running.store(false, Ordering::Release);

    let bridge = worker
        .await
        .map_err(|err| anyhow!("bridge worker failed: {err}"))?;
    bridge.shutdown().await;
    Ok(())
}
