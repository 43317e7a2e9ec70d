//! Simulated sensor board shared by the integration tests.
//!
//! The board answers scripted commands in application mode and walks the
//! bootloader menu after a reset pulse, close enough to the real firmware
//! to drive the link, the poller and the upgrade machine end to end.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sensorhub::{
    config::{BridgeConfig, ResetLineConfig},
    protocol::{FirmwareTransfer, ResetLine, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardMode {
    Application,
    Bootloader,
    Download,
}

pub struct BoardState {
    pub mode: BoardMode,
    pub to_host: VecDeque<u8>,
    pub received: Vec<Vec<u8>>,
    pub replies: HashMap<String, String>,
    /// Print the bootloader banner after a reset pulse.
    pub bootloader_alive: bool,
    /// Answer the `C` handshake with the slot prompt.
    pub prompt_alive: bool,
    /// Print the ready banner when the application is started.
    pub application_boots: bool,
    pub resets: usize,
    pub releases: usize,
    pub in_reset: bool,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            mode: BoardMode::Application,
            to_host: VecDeque::new(),
            received: Vec::new(),
            replies: HashMap::new(),
            bootloader_alive: true,
            prompt_alive: true,
            application_boots: true,
            resets: 0,
            releases: 0,
            in_reset: false,
        }
    }
}

impl BoardState {
    fn push(&mut self, text: &str) {
        self.to_host.extend(text.as_bytes());
    }

    fn handle(&mut self, data: &[u8]) {
        self.received.push(data.to_vec());
        match self.mode {
            BoardMode::Application => {
                let command = String::from_utf8_lossy(data).to_string();
                if let Some(reply) = self.replies.get(&command).cloned() {
                    self.push(&reply);
                }
            }
            BoardMode::Bootloader => match data {
                b"C" if self.prompt_alive => self.push("\r\nSelect 1 or 2\r\n"),
                b"1" => self.mode = BoardMode::Download,
                b"2" => {
                    self.mode = BoardMode::Application;
                    if self.application_boots {
                        self.push("Sensor board is ready!\r\n");
                    }
                }
                _ => {}
            },
            BoardMode::Download => {}
        }
    }
}

#[derive(Clone, Default)]
pub struct SimBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `reply` while in application mode.
    pub fn reply(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .replies
            .insert(command.to_string(), reply.to_string());
    }

    /// Bytes sent by the board on its own.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.lock().to_host.extend(bytes);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut BoardState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Everything the host wrote, one entry per write.
    pub fn received(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).to_string())
            .collect()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn mode(&self) -> BoardMode {
        self.state.lock().mode
    }

    pub fn in_reset(&self) -> bool {
        self.state.lock().in_reset
    }

    pub fn releases(&self) -> usize {
        self.state.lock().releases
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn reset_line(&self) -> Box<dyn ResetLine> {
        Box::new(SimReset {
            board: self.clone(),
        })
    }
}

impl Transport for SimBoard {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.state.lock().to_host.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.to_host.len());
        for (slot, byte) in buf.iter_mut().zip(state.to_host.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.state.lock().handle(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().to_host.clear();
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }
}

pub struct SimReset {
    board: SimBoard,
}

impl ResetLine for SimReset {
    fn assert_reset(&mut self) -> Result<()> {
        self.board.state.lock().in_reset = true;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let mut state = self.board.state.lock();
        state.releases += 1;
        if !state.in_reset {
            return Ok(());
        }
        state.in_reset = false;
        state.resets += 1;
        if state.bootloader_alive {
            state.mode = BoardMode::Bootloader;
            state.push("Bootloader is started\r\n");
        }
        Ok(())
    }
}

/// Transfer stand-in recording every image it was asked to send.
#[derive(Default)]
pub struct RecordingTransfer {
    calls: Mutex<Vec<PathBuf>>,
    failing: Vec<PathBuf>,
}

impl RecordingTransfer {
    pub fn failing_for(images: Vec<PathBuf>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: images,
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().clone()
    }
}

impl FirmwareTransfer for RecordingTransfer {
    fn send(&self, transport: &mut dyn Transport, image: &Path) -> Result<()> {
        self.calls.lock().push(image.to_path_buf());
        transport.write_all(b"<image>")?;
        if self.failing.iter().any(|p| p == image) {
            return Err(anyhow!("receiver cancelled transfer of {}", image.display()));
        }
        Ok(())
    }
}

/// Configuration with short timings, files rooted in `dir`.
pub fn fast_config(dir: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.files.config_dir = dir.to_path_buf();
    config.modbus.listen = "127.0.0.1:0".to_string();
    config.reset = ResetLineConfig::None;
    config.log.file = None;

    config.polling.response_timeout_ms = 800;
    config.polling.wait_step_ms = 50;
    config.polling.pacing_ms = 10;
    config.polling.identity_attempts = 2;
    config.polling.identity_timeout_ms = 500;

    config.upgrade.reset_hold_ms = 1;
    config.upgrade.reset_settle_ms = 10;
    config.upgrade.handshake_interval_ms = 10;
    config.upgrade.handshake_timeout_ms = 200;
    config.upgrade.select_delay_ms = 1;
    config.upgrade.transfer_delay_ms = 1;
    config.upgrade.boot_timeout_ms = 600;
    config.upgrade.boot_poll_ms = 20;
    config.upgrade.version_timeout_ms = 600;
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}
