use parking_lot::Mutex;
use std::sync::Arc;
use strum::Display;

/// Who currently owns the sensor board link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BridgeMode {
    /// Nothing scheduled; the reader still decodes whatever arrives.
    Idle,
    /// A poll cycle is issuing read commands.
    Polling,
    /// An upgrade session owns the transport. Reader and writer stay off it.
    Upgrading,
}

/// Shared mode value checked before every transport access.
///
/// The reader and writer threads take the transport lock first and then read
/// the mode, so once an upgrade has been entered and has taken the transport
/// once, neither of them touches the link again until the session ends.
#[derive(Debug)]
pub struct ModeGate {
    mode: Mutex<BridgeMode>,
}

impl Default for ModeGate {
    fn default() -> Self {
        Self {
            mode: Mutex::new(BridgeMode::Idle),
        }
    }
}

impl ModeGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> BridgeMode {
        *self.mode.lock()
    }

    /// Whether inbound bytes may be routed to the framer and outbound commands written.
    pub fn allows_dispatch(&self) -> bool {
        self.current() != BridgeMode::Upgrading
    }

    /// Enter `Polling`. Refused while an upgrade runs.
    pub fn begin_polling(&self) -> bool {
        let mut mode = self.mode.lock();
        match *mode {
            BridgeMode::Upgrading => false,
            _ => {
                *mode = BridgeMode::Polling;
                true
            }
        }
    }

    pub fn end_polling(&self) {
        let mut mode = self.mode.lock();
        if *mode == BridgeMode::Polling {
            *mode = BridgeMode::Idle;
        }
    }

    /// Enter `Upgrading`. Only one session may exist; the returned guard
    /// puts the gate back to `Idle` when dropped.
    pub fn begin_upgrade(self: &Arc<Self>) -> Option<UpgradeGuard> {
        let mut mode = self.mode.lock();
        if *mode == BridgeMode::Upgrading {
            return None;
        }
        log::debug!("mode {} -> {}", *mode, BridgeMode::Upgrading);
        *mode = BridgeMode::Upgrading;
        Some(UpgradeGuard {
            gate: Arc::clone(self),
        })
    }
}

/// Proof that the caller owns the link for an upgrade session.
#[must_use = "dropping the guard ends the upgrade session"]
#[derive(Debug)]
pub struct UpgradeGuard {
    gate: Arc<ModeGate>,
}

impl Drop for UpgradeGuard {
    fn drop(&mut self) {
        *self.gate.mode.lock() = BridgeMode::Idle;
        log::debug!("mode {} -> {}", BridgeMode::Upgrading, BridgeMode::Idle);
    }
}
