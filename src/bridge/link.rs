use anyhow::Result;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::mode::{ModeGate, UpgradeGuard};
use crate::protocol::{
    transport::read_available, InboundMessage, MessageFramer, SensorCommand, Transport,
};

/// Transport handle shared by the reader, the writer and the upgrade session.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Pause of the reader when nothing is waiting on the port.
const READER_TICK: Duration = Duration::from_millis(50);
/// Pace of the writer loop when the outbound queue is empty.
const WRITER_PACE: Duration = Duration::from_secs(1);

/// The serial link to the sensor board and the threads serving it.
///
/// The board has no request ids, so at most one request is outstanding at
/// a time and the next decoded message is taken as its answer.
pub struct SensorLink {
    transport: SharedTransport,
    gate: Arc<ModeGate>,
    framer: Mutex<MessageFramer>,
    inbox_tx: Sender<InboundMessage>,
    inbox_rx: Receiver<InboundMessage>,
    outbox_tx: Sender<Vec<u8>>,
    outbox_rx: Receiver<Vec<u8>>,
    in_flight: Mutex<()>,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SensorLink {
    pub fn new(transport: Box<dyn Transport>, gate: Arc<ModeGate>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = flume::unbounded();
        let (outbox_tx, outbox_rx) = flume::unbounded();
        Arc::new(Self {
            transport: Arc::new(Mutex::new(transport)),
            gate,
            framer: Mutex::new(MessageFramer::new()),
            inbox_tx,
            inbox_rx,
            outbox_tx,
            outbox_rx,
            in_flight: Mutex::new(()),
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Start the reader and writer threads.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let reader = {
            let link = Arc::clone(self);
            thread::Builder::new()
                .name("uart-rx".to_string())
                .spawn(move || link.reader_loop())?
        };
        let writer = {
            let link = Arc::clone(self);
            thread::Builder::new()
                .name("uart-tx".to_string())
                .spawn(move || link.writer_loop())?
        };
        self.threads.lock().extend([reader, writer]);
        Ok(())
    }

    /// Stop both threads and wait for them to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("link thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn gate(&self) -> &Arc<ModeGate> {
        &self.gate
    }

    /// Most recent message the framer decoded.
    pub fn last_decoded(&self) -> Option<InboundMessage> {
        self.framer.lock().last_decoded().cloned()
    }

    /// Take the link over for an upgrade session.
    ///
    /// Flips the gate and then waits for any reader or writer access already
    /// holding the transport, so no byte is routed to the framer once this
    /// returns.
    pub fn enter_upgrade(&self) -> Option<UpgradeGuard> {
        let guard = self.gate.begin_upgrade()?;
        drop(self.transport.lock());
        Some(guard)
    }

    /// Queue a command for the writer thread.
    pub fn send(&self, command: SensorCommand) {
        if self.outbox_tx.send(command.encode()).is_err() {
            log::warn!("outbound queue closed, dropping {command}");
        }
    }

    /// Send `command` and wait for the next decoded message.
    ///
    /// Stale messages left over from earlier timed-out requests are dropped
    /// first. The wait is bounded by a monotonic deadline and re-checked every
    /// `step`, returning early when the link is stopped.
    pub fn request(
        &self,
        command: SensorCommand,
        timeout: Duration,
        step: Duration,
    ) -> Option<InboundMessage> {
        let _in_flight = self.in_flight.lock();

        let stale = self.inbox_rx.drain().count();
        if stale > 0 {
            log::debug!("dropped {stale} stale message(s) before {command}");
        }

        self.send(command);
        let deadline = Instant::now() + timeout;
        let step = step.max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            if now >= deadline || !self.is_running() {
                return None;
            }
            match self.inbox_rx.recv_timeout((deadline - now).min(step)) {
                Ok(message) => return Some(message),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn reader_loop(&self) {
        log::debug!("uart reader started");
        while self.is_running() {
            match self.read_tick() {
                Ok(true) => {}
                Ok(false) => thread::sleep(READER_TICK),
                Err(err) => {
                    log::warn!("uart read failed: {err}");
                    thread::sleep(READER_TICK);
                }
            }
        }
        log::debug!("uart reader stopped");
    }

    /// Drain the port into the framer once. Returns whether bytes were read.
    fn read_tick(&self) -> Result<bool> {
        let mut transport = self.transport.lock();
        if !self.gate.allows_dispatch() {
            return Ok(false);
        }
        let data = read_available(transport.as_mut())?;
        if data.is_empty() {
            return Ok(false);
        }
        log::debug!("<recv>: {}", String::from_utf8_lossy(&data));

        if let Some(message) = self.framer.lock().feed(&data) {
            let _ = self.inbox_tx.send(message);
        }
        Ok(true)
    }

    fn writer_loop(&self) {
        log::debug!("uart writer started");
        while self.is_running() {
            match self.outbox_rx.recv_timeout(WRITER_PACE) {
                Ok(frame) => self.write_frame(&frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("uart writer stopped");
    }

    fn write_frame(&self, frame: &[u8]) {
        let mut transport = self.transport.lock();
        if !self.gate.allows_dispatch() {
            log::warn!(
                "link is {}, dropping <send>: {}",
                self.gate.current(),
                String::from_utf8_lossy(frame)
            );
            return;
        }
        log::debug!("<send>: {}", String::from_utf8_lossy(frame));
        if let Err(err) = transport.write_all(frame).and_then(|_| transport.flush()) {
            log::warn!("uart write failed: {err}");
        }
    }
}
