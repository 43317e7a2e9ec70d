//! Sensor board firmware upgrade over the serial link.
//!
//! An upgrade is requested by dropping a small `filename=<image>` file next
//! to the bridge. The session then owns the link: it pulses the reset line,
//! walks the bootloader menu, hands the port to the chunked transfer
//! program, resets again into the application and waits for the ready
//! banner. A failed primary image is retried once with the default image.
//! The request file is removed at the end whatever the outcome.

use anyhow::{anyhow, Context, Result};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use strum::Display;

use super::link::{SensorLink, SharedTransport};
use crate::{
    config::{FileSettings, UpgradeSettings},
    protocol::{
        reset::{self, ResetLine},
        transport::read_available,
        FirmwareTransfer, SensorCommand,
    },
};

pub const BOOTLOADER_BANNER: &str = "Bootloader is started";
pub const SLOT_PROMPT: &str = "Select 1 or 2";
pub const BOARD_READY_BANNER: &str = "Sensor board is ready!";
const HANDSHAKE_BYTE: u8 = b'C';

/// Bootloader menu choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Download,
    RunApplication,
}

impl ImageSlot {
    fn byte(self) -> u8 {
        match self {
            ImageSlot::Download => b'1',
            ImageSlot::RunApplication => b'2',
        }
    }
}

/// Which image a session is flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ImageAttempt {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum UpgradePhase {
    Idle,
    ResettingBoard,
    AwaitingBootloaderBanner,
    SelectingImageSlot,
    Transferring,
    VerifyingBoot,
    Succeeded,
    Failed,
}

/// Why an upgrade attempt ended in [`UpgradePhase::Failed`].
#[derive(Debug)]
pub enum UpgradeFailure {
    /// No bootloader banner after the reset pulse.
    NoBootloaderBanner { after_transfer: bool },
    /// The bootloader never offered the image menu.
    NoSlotPrompt { after_transfer: bool },
    Transfer(anyhow::Error),
    /// The application did not report ready after the final reset.
    BootTimeout,
    /// Reset line or transport error.
    Link(anyhow::Error),
}

impl fmt::Display for UpgradeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = |after: &bool| if *after { " after updating" } else { "" };
        match self {
            UpgradeFailure::NoBootloaderBanner { after_transfer } => {
                write!(f, "sensor board cannot be reset{}", when(after_transfer))
            }
            UpgradeFailure::NoSlotPrompt { after_transfer } => {
                write!(f, "bootloader does not respond{}", when(after_transfer))
            }
            UpgradeFailure::Transfer(err) => write!(f, "writing sensor board failed: {err:#}"),
            UpgradeFailure::BootTimeout => write!(f, "sensor board reset after updating timeout"),
            UpgradeFailure::Link(err) => write!(f, "link error during upgrade: {err:#}"),
        }
    }
}

impl std::error::Error for UpgradeFailure {}

impl From<anyhow::Error> for UpgradeFailure {
    fn from(err: anyhow::Error) -> Self {
        UpgradeFailure::Link(err)
    }
}

/// One attempt at flashing one image.
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    pub firmware_path: PathBuf,
    pub attempt: ImageAttempt,
    phase: UpgradePhase,
    history: Vec<UpgradePhase>,
}

impl UpgradeSession {
    pub fn new(firmware_path: impl Into<PathBuf>, attempt: ImageAttempt) -> Self {
        Self {
            firmware_path: firmware_path.into(),
            attempt,
            phase: UpgradePhase::Idle,
            history: vec![UpgradePhase::Idle],
        }
    }

    pub fn phase(&self) -> UpgradePhase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[UpgradePhase] {
        &self.history
    }

    fn enter(&mut self, phase: UpgradePhase) {
        log::debug!("upgrade ({}): {} -> {}", self.attempt, self.phase, phase);
        self.phase = phase;
        self.history.push(phase);
    }
}

/// Contents of the upgrade request file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub firmware: PathBuf,
}

impl UpgradeRequest {
    /// Parse the request body. Relative image paths are resolved against `base`.
    pub fn parse(content: &str, base: &Path) -> Result<Self> {
        let name = content
            .lines()
            .find_map(|line| line.trim_start().strip_prefix("filename="))
            .ok_or_else(|| anyhow!("no filename found in upgrade request"))?
            .trim();
        if name.is_empty() {
            return Err(anyhow!("empty upgrading file, no action"));
        }
        Ok(Self {
            firmware: base.join(name),
        })
    }

    /// Read and validate the request file; the named image must exist.
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read upgrade request {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let request = Self::parse(&content, base)?;
        if !request.firmware.exists() {
            return Err(anyhow!(
                "upgrade filename {} not found",
                request.firmware.display()
            ));
        }
        Ok(request)
    }
}

/// How a handled upgrade request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Upgraded {
        image: PathBuf,
        attempt: ImageAttempt,
    },
    /// Primary and, when available, fallback image both failed.
    Failed,
    /// The request file was unusable; nothing was flashed.
    Rejected,
}

/// Drives upgrade sessions against the board.
pub struct Upgrader {
    transport: SharedTransport,
    reset_line: Box<dyn ResetLine>,
    transfer: Arc<dyn FirmwareTransfer>,
    settings: UpgradeSettings,
    buffer: Vec<u8>,
}

impl Upgrader {
    pub fn new(
        transport: SharedTransport,
        reset_line: Box<dyn ResetLine>,
        transfer: Arc<dyn FirmwareTransfer>,
        settings: UpgradeSettings,
    ) -> Self {
        Self {
            transport,
            reset_line,
            transfer,
            settings,
            buffer: Vec::new(),
        }
    }

    /// Handle a pending upgrade request, if the request file exists.
    ///
    /// Returns `None` when there is nothing to do. The request file is
    /// removed once the attempt is over, successful or not.
    pub fn check_upgrade(
        &mut self,
        link: &SensorLink,
        files: &FileSettings,
    ) -> Option<UpgradeOutcome> {
        let marker = &files.upgrade_request_path();
        if !marker.exists() {
            return None;
        }
        log::debug!("found update config file {}", marker.display());

        let Some(session_guard) = link.enter_upgrade() else {
            log::warn!("upgrade already in progress, ignoring {}", marker.display());
            return None;
        };

        let outcome = match UpgradeRequest::read(marker) {
            Ok(request) => {
                self.upgrade_with_fallback(&request.firmware, &files.default_image_path())
            }
            Err(err) => {
                log::warn!("{err:#}");
                UpgradeOutcome::Rejected
            }
        };
        if matches!(outcome, UpgradeOutcome::Upgraded { .. }) {
            self.confirm_version();
        }
        drop(session_guard);

        match fs::remove_file(marker) {
            Ok(()) => log::info!("removed upgrade request {}", marker.display()),
            Err(err) => log::error!(
                "failed to remove upgrade request {}: {err}",
                marker.display()
            ),
        }
        Some(outcome)
    }

    /// Flash `image`, falling back once to `default_image` on failure.
    pub fn upgrade_with_fallback(&mut self, image: &Path, default_image: &Path) -> UpgradeOutcome {
        let mut primary = UpgradeSession::new(image, ImageAttempt::Primary);
        match self.do_upgrade(&mut primary) {
            Ok(()) => {
                return UpgradeOutcome::Upgraded {
                    image: image.to_path_buf(),
                    attempt: ImageAttempt::Primary,
                }
            }
            Err(err) => log::error!("upgrade from {} failed: {err}", image.display()),
        }

        if !default_image.exists() {
            log::error!("ext upgrade failed but no default image found");
            return UpgradeOutcome::Failed;
        }
        let mut fallback = UpgradeSession::new(default_image, ImageAttempt::Fallback);
        match self.do_upgrade(&mut fallback) {
            Ok(()) => UpgradeOutcome::Upgraded {
                image: default_image.to_path_buf(),
                attempt: ImageAttempt::Fallback,
            },
            Err(err) => {
                log::error!("ext upgrade failed from default image: {err}");
                UpgradeOutcome::Failed
            }
        }
    }

    /// Run one session to `Succeeded` or `Failed`.
    pub fn do_upgrade(&mut self, session: &mut UpgradeSession) -> Result<(), UpgradeFailure> {
        log::info!(
            "begin to upgrade ext board from {} ({})",
            session.firmware_path.display(),
            session.attempt
        );
        let result = self.run_session(session);
        session.enter(match result {
            Ok(()) => UpgradePhase::Succeeded,
            Err(_) => UpgradePhase::Failed,
        });
        result
    }

    /// Put the reset line in its inactive state.
    pub fn release_reset_line(&mut self) -> Result<()> {
        self.reset_line.release()
    }

    fn run_session(&mut self, session: &mut UpgradeSession) -> Result<(), UpgradeFailure> {
        self.enter_bootloader(session, ImageSlot::Download)?;

        thread::sleep(ms(self.settings.transfer_delay_ms));
        session.enter(UpgradePhase::Transferring);
        log::info!("updating sensor board...");
        {
            let mut transport = self.transport.lock();
            self.transfer
                .send(transport.as_mut(), &session.firmware_path)
                .map_err(UpgradeFailure::Transfer)?;
        }
        log::info!("write sensor board successfully");

        self.enter_bootloader(session, ImageSlot::RunApplication)?;

        session.enter(UpgradePhase::VerifyingBoot);
        self.wait_for_boot()?;
        log::info!("updating successfully!");
        Ok(())
    }

    /// Reset the board and pick `slot` from the bootloader menu.
    fn enter_bootloader(
        &mut self,
        session: &mut UpgradeSession,
        slot: ImageSlot,
    ) -> Result<(), UpgradeFailure> {
        let after_transfer = slot == ImageSlot::RunApplication;

        session.enter(UpgradePhase::ResettingBoard);
        self.buffer.clear();
        self.transport
            .lock()
            .clear_input()
            .context("Failed to clear input buffer")?;
        reset::pulse(
            self.reset_line.as_mut(),
            ms(self.settings.reset_hold_ms),
            ms(self.settings.reset_settle_ms),
        )?;

        session.enter(UpgradePhase::AwaitingBootloaderBanner);
        self.pump()?;
        if !self.buffer_contains(BOOTLOADER_BANNER) {
            return Err(UpgradeFailure::NoBootloaderBanner { after_transfer });
        }
        log::info!(
            "sensor board is reset{}",
            if after_transfer { " after updating" } else { "" }
        );

        session.enter(UpgradePhase::SelectingImageSlot);
        let interval = ms(self.settings.handshake_interval_ms);
        let attempts = (self.settings.handshake_timeout_ms / self.settings.handshake_interval_ms.max(1)).max(1);
        for _ in 0..attempts {
            thread::sleep(interval);
            log::debug!("writing C to sensor board");
            self.write_raw(&[HANDSHAKE_BYTE])?;
            self.pump()?;
            if self.buffer_contains(SLOT_PROMPT) {
                thread::sleep(ms(self.settings.select_delay_ms));
                self.write_raw(&[slot.byte()])?;
                return Ok(());
            }
        }
        Err(UpgradeFailure::NoSlotPrompt { after_transfer })
    }

    fn wait_for_boot(&mut self) -> Result<(), UpgradeFailure> {
        let deadline = Instant::now() + ms(self.settings.boot_timeout_ms);
        let poll = ms(self.settings.boot_poll_ms);
        while Instant::now() < deadline {
            thread::sleep(poll);
            self.pump()?;
            if self.buffer_contains(BOARD_READY_BANNER) {
                log::debug!("<boot>:{}", String::from_utf8_lossy(&self.buffer));
                self.buffer.clear();
                return Ok(());
            }
        }
        self.buffer.clear();
        Err(UpgradeFailure::BootTimeout)
    }

    /// Ask the freshly flashed application for its version and log it.
    fn confirm_version(&mut self) {
        self.buffer.clear();
        if let Err(err) = self.write_raw(&SensorCommand::GetVersion.encode()) {
            log::warn!("failed to query software version: {err:#}");
            return;
        }
        let deadline = Instant::now() + ms(self.settings.version_timeout_ms);
        let poll = ms(self.settings.boot_poll_ms);
        while Instant::now() < deadline {
            thread::sleep(poll);
            if let Err(err) = self.pump() {
                log::warn!("{err:#}");
                break;
            }
            if self.buffer_contains("date") && self.buffer_contains("time") {
                log::info!("<software info>:{}", String::from_utf8_lossy(&self.buffer));
                self.buffer.clear();
                return;
            }
        }
        log::warn!("no software info from sensor board after upgrade");
        self.buffer.clear();
    }

    /// Move everything waiting on the port into the raw buffer.
    fn pump(&mut self) -> Result<()> {
        let data = {
            let mut transport = self.transport.lock();
            read_available(transport.as_mut()).context("Failed to read from sensor board")?
        };
        if !data.is_empty() {
            log::debug!("<recv>: {}", String::from_utf8_lossy(&data));
            self.buffer.extend_from_slice(&data);
        }
        Ok(())
    }

    fn write_raw(&self, data: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock();
        log::debug!("<send>: {}", String::from_utf8_lossy(data));
        transport
            .write_all(data)
            .and_then(|_| transport.flush())
            .context("Failed to write to sensor board")
    }

    fn buffer_contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        self.buffer.windows(needle.len()).any(|w| w == needle)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
