use super::link::SensorLink;
use crate::{config::PollingSettings, protocol::SensorCommand};

/// Identity of the attached sensor board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    cpuid: Option<String>,
}

impl DeviceIdentity {
    pub fn known(cpuid: &str) -> Self {
        Self {
            cpuid: Some(cpuid.to_string()),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn cpuid(&self) -> Option<&str> {
        self.cpuid.as_deref()
    }
}

/// Ask the board for its CPU id, giving up after the configured attempts.
///
/// A board that never answers is accepted as unknown; the bridge then runs
/// with the common or built-in register map.
pub fn read_identity(link: &SensorLink, settings: &PollingSettings) -> DeviceIdentity {
    for attempt in 1..=settings.identity_attempts {
        let reply = link.request(
            SensorCommand::GetCpuid,
            settings.identity_timeout(),
            settings.wait_step(),
        );
        match reply.as_ref().and_then(|m| m.cpuid()) {
            Some(cpuid) => {
                log::info!("CPUID = {cpuid}");
                return DeviceIdentity { cpuid: Some(cpuid) };
            }
            None => log::debug!(
                "no CPUID in reply (attempt {attempt}/{}): {reply:?}",
                settings.identity_attempts
            ),
        }
    }
    log::warn!("failed to read CPUID, board may be broken");
    DeviceIdentity::unknown()
}
