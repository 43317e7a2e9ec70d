use anyhow::{anyhow, Context, Result};
use std::{
    fs::OpenOptions,
    path::Path,
    process::{Command, Stdio},
};

use super::transport::Transport;
use crate::config::TransferSettings;

/// Chunked, checksum-verified file transfer to the board bootloader.
///
/// Called while the caller holds the transport exclusively; implementations
/// may use the handle directly or drive the device node by other means.
pub trait FirmwareTransfer: Send + Sync {
    fn send(&self, transport: &mut dyn Transport, image: &Path) -> Result<()>;
}

/// Delegates the transfer to an external program (YMODEM `sb` by default)
/// whose stdin and stdout are bound to the serial device.
#[derive(Debug, Clone)]
pub struct ExternalTransfer {
    program: String,
    args: Vec<String>,
    device: String,
}

impl ExternalTransfer {
    pub fn new(settings: &TransferSettings, device: &str) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            device: device.to_string(),
        }
    }
}

impl FirmwareTransfer for ExternalTransfer {
    fn send(&self, transport: &mut dyn Transport, image: &Path) -> Result<()> {
        transport.flush()?;

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .with_context(|| format!("Failed to open {} for transfer", self.device))?;
        let device_out = device
            .try_clone()
            .with_context(|| format!("Failed to duplicate handle of {}", self.device))?;

        log::info!(
            "Running {} {} {}",
            self.program,
            self.args.join(" "),
            image.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::from(device))
            .stdout(Stdio::from(device_out))
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to start transfer program {}", self.program))?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            if !line.trim().is_empty() {
                log::debug!("<{}>: {}", self.program, line.trim());
            }
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "Transfer program {} exited with {}",
                self.program,
                output.status
            ))
        }
    }
}
