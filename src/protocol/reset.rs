use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{fs, path::PathBuf, sync::Arc, thread, time::Duration};

use super::transport::Transport;
use crate::config::ResetLineConfig;

const GPIO_ROOT: &str = "/sys/class/gpio";

/// Hardware line that holds the sensor board in reset.
pub trait ResetLine: Send {
    /// Put the board into reset.
    fn assert_reset(&mut self) -> Result<()>;

    /// Let the board run. Also the safe state on shutdown.
    fn release(&mut self) -> Result<()>;
}

/// Pulse the reset line: hold it for `hold`, release, then wait `settle`
/// for the board to print its boot output.
pub fn pulse(line: &mut dyn ResetLine, hold: Duration, settle: Duration) -> Result<()> {
    log::warn!("reset ext board for upgrading");
    line.assert_reset()?;
    thread::sleep(hold);
    line.release()?;
    thread::sleep(settle);
    Ok(())
}

/// Active-low reset pin driven through the sysfs GPIO interface.
pub struct SysfsGpio {
    pin: u32,
    root: PathBuf,
}

impl SysfsGpio {
    pub fn open(pin: u32) -> Result<Self> {
        Self::open_at(PathBuf::from(GPIO_ROOT), pin)
    }

    fn open_at(root: PathBuf, pin: u32) -> Result<Self> {
        let gpio = Self { pin, root };
        let pin_dir = gpio.pin_dir();
        if !pin_dir.exists() {
            fs::write(gpio.root.join("export"), pin.to_string())
                .with_context(|| format!("Failed to export GPIO {pin}"))?;
        }
        fs::write(pin_dir.join("direction"), "out")
            .with_context(|| format!("Failed to configure GPIO {pin} as output"))?;
        Ok(gpio)
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    fn set(&self, high: bool) -> Result<()> {
        fs::write(self.pin_dir().join("value"), if high { "1" } else { "0" })
            .with_context(|| format!("Failed to drive GPIO {}", self.pin))
    }
}

impl ResetLine for SysfsGpio {
    fn assert_reset(&mut self) -> Result<()> {
        self.set(false)
    }

    fn release(&mut self) -> Result<()> {
        self.set(true)
    }
}

/// Reset through the serial DTR line of the shared transport.
pub struct DtrReset {
    transport: Arc<Mutex<Box<dyn Transport>>>,
}

impl DtrReset {
    pub fn new(transport: Arc<Mutex<Box<dyn Transport>>>) -> Self {
        Self { transport }
    }
}

impl ResetLine for DtrReset {
    fn assert_reset(&mut self) -> Result<()> {
        self.transport
            .lock()
            .set_dtr(true)
            .context("Failed to assert DTR")
    }

    fn release(&mut self) -> Result<()> {
        self.transport
            .lock()
            .set_dtr(false)
            .context("Failed to release DTR")
    }
}

/// Used when the reset line is not wired; the board has to be reset by hand.
pub struct NoReset;

impl ResetLine for NoReset {
    fn assert_reset(&mut self) -> Result<()> {
        log::warn!("no reset line configured, reset the sensor board manually");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the reset line described by the configuration.
pub fn from_config(
    config: &ResetLineConfig,
    transport: Arc<Mutex<Box<dyn Transport>>>,
) -> Result<Box<dyn ResetLine>> {
    let mut line: Box<dyn ResetLine> = match config {
        ResetLineConfig::None => Box::new(NoReset),
        ResetLineConfig::Gpio { pin } => Box::new(SysfsGpio::open(*pin)?),
        ResetLineConfig::Dtr => Box::new(DtrReset::new(transport)),
    };
    // Start with the board running.
    line.release()?;
    Ok(line)
}
