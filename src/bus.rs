//! Bus task composition root: drives the serial port, feeds every received
//! byte through the bus observer and arbitration engine, and fans out
//! client events. This is the "pass-through forwarder" build: network
//! clients arbitrate for and write their own telegram bytes via the
//! enhanced protocol (§4.7); the full
//! [`crate::ebus::transaction::TransactionEngine`] is available as a
//! library API for an in-process sender (the out-of-scope command
//! scheduler collaborator) and is not otherwise driven by network clients.

use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio_serial::SerialStream;

use crate::arbitration_claim::{ArbitrationClaim, Claim};
use crate::constants::SYN;
use crate::ebus::arbitration::{Arbitration, ArbitrationCounters, ArbitrationState};
use crate::ebus::observer::BusObserver;
use crate::socket::enhanced::{EventTag, ERR_FRAMING};
use crate::socket::fanout::{ClientEvent, FanoutSender, Routing};

/// A point-in-time snapshot of bus health for the status port. Updated by
/// the bus task after every processed byte and read by status-port
/// connection handlers through a short-held mutex, the same pattern
/// [`ArbitrationClaim`] uses for its own small `Copy` payload.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    /// When the bus task started, for the status port's `uptime` field.
    pub started_at: Instant,
    /// Arbitration instrumentation counters.
    pub arbitration: ArbitrationCounters,
    /// The client currently holding arbitration, if any.
    pub claim: Option<Claim>,
}

impl StatusSnapshot {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            arbitration: ArbitrationCounters::default(),
            claim: None,
        }
    }
}

/// A non-blocking byte sink the bus task writes onto. Production is backed
/// by a channel to a dedicated serial-write task (so a slow or blocked UART
/// write never suspends the bus task's per-byte protocol step); tests use
/// an in-memory recorder.
pub trait ByteWriter {
    /// Writes one byte. Returns `true` if accepted.
    fn write(&mut self, byte: u8) -> bool;
}

/// Production byte writer: hands bytes to a dedicated async write task over
/// an unbounded channel.
#[derive(Debug, Clone)]
pub struct SerialWriter {
    tx: mpsc::UnboundedSender<u8>,
}

impl ByteWriter for SerialWriter {
    fn write(&mut self, byte: u8) -> bool {
        self.tx.send(byte).is_ok()
    }
}

async fn serial_write_task(mut port: WriteHalf<SerialStream>, mut rx: mpsc::UnboundedReceiver<u8>) {
    while let Some(byte) = rx.recv().await {
        if let Err(e) = port.write_all(&[byte]).await {
            log::error!("[Bus] serial write error: {e}");
        }
    }
}

/// Commands the network task sends to the bus task on behalf of a
/// connected enhanced-port client.
#[derive(Debug, Clone, Copy)]
pub enum BusCommand {
    /// `CMD_INIT` — reply `RESETTED`, no bus action.
    Init { client_id: u64 },
    /// `CMD_SEND` — write a byte to the bus.
    Send { byte: u8 },
    /// `CMD_START(addr)` with `addr != SYN` — request arbitration.
    StartArbitration { client_id: u64, address: u8 },
    /// `CMD_START(SYN)` — cancel this client's pending/held arbitration.
    CancelArbitration { client_id: u64 },
    /// The client disconnected; cancel any claim it held.
    ClientDisconnected { client_id: u64 },
}

/// Owns the bus-side protocol state: the observer, the arbitration engine,
/// and the shared claim record.
pub struct Bus {
    observer: BusObserver,
    arbitration: Arbitration,
    claim: std::sync::Arc<ArbitrationClaim>,
    fanout: FanoutSender,
    raw_tx: broadcast::Sender<u8>,
    status: std::sync::Arc<std::sync::Mutex<StatusSnapshot>>,
    arbitrating_client: Option<u64>,
}

/// Capacity of the raw-byte broadcast channel backing the raw TCP ports. A
/// slow raw-port reader lags and misses old bytes rather than blocking the
/// bus task (`broadcast`'s `Lagged` semantics), matching the fan-out queue's
/// own drop-on-backpressure rule for the enhanced port.
const RAW_BROADCAST_CAPACITY: usize = 1024;

impl Bus {
    /// Creates a bus with no pending arbitration claim.
    #[must_use]
    pub fn new(claim: std::sync::Arc<ArbitrationClaim>, fanout: FanoutSender) -> Self {
        let (raw_tx, _rx) = broadcast::channel(RAW_BROADCAST_CAPACITY);
        Self {
            observer: BusObserver::new(),
            arbitration: Arbitration::new(),
            claim,
            fanout,
            raw_tx,
            status: std::sync::Arc::new(std::sync::Mutex::new(StatusSnapshot::new())),
            arbitrating_client: None,
        }
    }

    /// Subscribes to the raw byte stream forwarded to the raw TCP ports
    /// (every byte observed on the bus, verbatim, in observation order).
    #[must_use]
    pub fn subscribe_raw(&self) -> broadcast::Receiver<u8> {
        self.raw_tx.subscribe()
    }

    /// A cloneable handle to the raw broadcast sender, so the network task
    /// can subscribe a fresh receiver per incoming raw-port connection.
    #[must_use]
    pub fn raw_sender(&self) -> broadcast::Sender<u8> {
        self.raw_tx.clone()
    }

    /// A shared handle to this bus's status snapshot, for the status port.
    #[must_use]
    pub fn status_handle(&self) -> std::sync::Arc<std::sync::Mutex<StatusSnapshot>> {
        self.status.clone()
    }

    /// Applies one command from the network task.
    pub fn handle_command(&mut self, command: BusCommand, writer: &mut dyn ByteWriter) {
        match command {
            BusCommand::Init { client_id } => {
                self.fanout.push(ClientEvent {
                    tag: EventTag::Resetted,
                    data: 0x00,
                    routing: Routing::Only(client_id),
                });
            }
            BusCommand::Send { byte } => {
                writer.write(byte);
            }
            BusCommand::StartArbitration { client_id, address } => {
                match self.claim.try_acquire(client_id, address) {
                    Ok(true) => {
                        self.arbitrating_client = Some(client_id);
                        self.arbitration.request(address);
                    }
                    Ok(false) => {}
                    Err(()) => {
                        self.fanout.push(ClientEvent {
                            tag: EventTag::ErrorHost,
                            data: ERR_FRAMING,
                            routing: Routing::Only(client_id),
                        });
                    }
                }
            }
            BusCommand::CancelArbitration { client_id } | BusCommand::ClientDisconnected { client_id } => {
                self.claim.cancel_for(client_id);
                if self.arbitrating_client == Some(client_id) {
                    self.arbitration.cancel();
                    self.arbitrating_client = None;
                }
            }
        }
    }

    /// Processes one byte observed on the bus: updates the observer and
    /// arbitration engine, and enqueues the resulting client events.
    ///
    /// `now` and `write` are supplied by the caller so this method has no
    /// hidden time or I/O dependency, matching the original firmware's
    /// `BusType::receive` dispatch (observer → arbitration → routed push).
    pub fn process_byte(&mut self, byte: u8, now: Instant, writer: &mut dyn ByteWriter) {
        // Measured against the *previous* SYN, before this byte (if itself
        // a SYN) becomes the new reference point.
        let since_syn = self
            .observer
            .micros_since_last_syn(now)
            .unwrap_or_default();
        self.observer.data(byte, now);
        // Raw ports forward every observed byte verbatim regardless of
        // arbitration outcome; a lagging subscriber drops old bytes rather
        // than stalling this step.
        let _ = self.raw_tx.send(byte);

        let client = self.arbitrating_client;
        let in_progress_before = self.arbitration.is_in_progress();

        let state = if byte == SYN {
            let mut write_closure = |addr: u8| writer.write(addr);
            self.arbitration.on_syn(since_syn, &mut write_closure)
        } else if in_progress_before {
            self.arbitration.on_round_byte(byte)
        } else {
            ArbitrationState::None
        };

        match state {
            ArbitrationState::None => {
                // Broadcasts unconditionally, even to a client whose claim
                // just started this cycle: the SYN/idle byte that precedes
                // a round isn't yet the winner's own echo, so every
                // connected client (including the future arbitrator) sees
                // it like any other bus byte.
                self.fanout.push(ClientEvent {
                    tag: EventTag::Received,
                    data: byte,
                    routing: Routing::All,
                });
            }
            ArbitrationState::Arbitrating => {
                let routing = client.map_or(Routing::All, Routing::AllExcept);
                self.fanout.push(ClientEvent {
                    tag: EventTag::Received,
                    data: byte,
                    routing,
                });
            }
            ArbitrationState::Won => {
                if let Some(id) = client {
                    self.fanout.push(ClientEvent {
                        tag: EventTag::Started,
                        data: byte,
                        routing: Routing::Only(id),
                    });
                    // The winner already has this byte via STARTED; every
                    // other connected client still sees it as a plain
                    // RECEIVED byte on the wire.
                    self.fanout.push(ClientEvent {
                        tag: EventTag::Received,
                        data: byte,
                        routing: Routing::AllExcept(id),
                    });
                }
                self.claim.release();
                self.arbitrating_client = None;
            }
            ArbitrationState::Lost => {
                if let Some(id) = client {
                    self.fanout.push(ClientEvent {
                        tag: EventTag::Failed,
                        data: byte,
                        routing: Routing::Only(id),
                    });
                }
                self.fanout.push(ClientEvent {
                    tag: EventTag::Received,
                    data: byte,
                    routing: Routing::All,
                });
                self.claim.release();
                self.arbitrating_client = None;
            }
            ArbitrationState::Error => {
                if let Some(id) = client {
                    self.fanout.push(ClientEvent {
                        tag: EventTag::ErrorEbus,
                        data: ERR_FRAMING,
                        routing: Routing::Only(id),
                    });
                }
                self.fanout.push(ClientEvent {
                    tag: EventTag::Received,
                    data: byte,
                    routing: Routing::All,
                });
                self.claim.release();
                self.arbitrating_client = None;
            }
        }

        if let Ok(mut snapshot) = self.status.lock() {
            snapshot.arbitration = self.arbitration.counters();
            snapshot.claim = self.claim.current();
        }
    }
}

/// Opens the configured serial port and spawns the dedicated write task,
/// returning the read half (driven by the bus run loop) and a
/// [`SerialWriter`] handle.
///
/// # Errors
///
/// Returns an error if the serial port cannot be opened.
pub fn open_serial(
    path: &str,
    baud_rate: u32,
) -> anyhow::Result<(ReadHalf<SerialStream>, SerialWriter)> {
    use anyhow::Context;
    let port = tokio_serial::new(path, baud_rate)
        .open_native_async()
        .with_context(|| format!("failed to open serial port {path}"))?;
    let (read_half, write_half) = tokio::io::split(port);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(serial_write_task(write_half, rx));
    Ok((read_half, SerialWriter { tx }))
}

/// Runs the bus task: drains pending commands non-blockingly between serial
/// reads, then processes every received byte synchronously. This task only
/// suspends on the serial port read; the per-byte protocol step never
/// awaits.
pub async fn run(
    mut bus: Bus,
    mut serial: ReadHalf<SerialStream>,
    mut writer: SerialWriter,
    mut commands: mpsc::UnboundedReceiver<BusCommand>,
) {
    let mut buf = [0u8; 256];
    loop {
        while let Ok(command) = commands.try_recv() {
            bus.handle_command(command, &mut writer);
        }

        match serial.read(&mut buf).await {
            Ok(0) => {
                log::error!("[Bus] serial port closed");
                break;
            }
            Ok(n) => {
                let now = Instant::now();
                for &byte in &buf[..n] {
                    bus.process_byte(byte, now, &mut writer);
                }
            }
            Err(e) => {
                log::error!("[Bus] serial read error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::fanout::channel;
    use std::sync::Arc;

    struct RecordingWriter {
        written: Vec<u8>,
        accept: bool,
    }

    impl RecordingWriter {
        fn new() -> Self {
            Self { written: Vec::new(), accept: true }
        }
    }

    impl ByteWriter for RecordingWriter {
        fn write(&mut self, byte: u8) -> bool {
            if self.accept {
                self.written.push(byte);
            }
            self.accept
        }
    }

    #[tokio::test]
    async fn arbitration_lost_routes_failed_and_received_events() {
        let claim = Arc::new(ArbitrationClaim::new());
        let (tx, mut rx) = channel();
        let mut bus = Bus::new(claim.clone(), tx);
        let mut writer = RecordingWriter::new();

        bus.handle_command(
            BusCommand::StartArbitration { client_id: 7, address: 0x03 },
            &mut writer,
        );

        let t0 = Instant::now();
        // First SYN: no prior reference, treated as too soon (late/retry).
        bus.process_byte(SYN, t0, &mut writer);
        let t1 = t0 + crate::constants::ARBITRATION_MIN_GAP + std::time::Duration::from_micros(1);
        // Second SYN clears the minimum gap: our address is transmitted.
        bus.process_byte(SYN, t1, &mut writer);
        // A higher-priority-class byte (differing high nibble) wins round 1.
        bus.process_byte(0x10, t1, &mut writer);

        assert!(claim.current().is_none());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().any(|e| e.tag == EventTag::Failed && e.data == 0x10));
        assert!(events.iter().any(|e| e.tag == EventTag::Received && e.data == 0x10));
    }

    #[tokio::test]
    async fn arbitration_won_sends_started_only_to_winner_and_received_to_others() {
        let claim = Arc::new(ArbitrationClaim::new());
        let (tx, mut rx) = channel();
        let mut bus = Bus::new(claim.clone(), tx);
        let mut writer = RecordingWriter::new();

        bus.handle_command(
            BusCommand::StartArbitration { client_id: 7, address: 0x03 },
            &mut writer,
        );

        let t0 = Instant::now();
        bus.process_byte(SYN, t0, &mut writer);
        let t1 = t0 + crate::constants::ARBITRATION_MIN_GAP + std::time::Duration::from_micros(1);
        bus.process_byte(SYN, t1, &mut writer);
        // Round byte matches our own address outright: we win.
        bus.process_byte(0x03, t1, &mut writer);

        assert!(claim.current().is_none());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let started = events
            .iter()
            .find(|e| e.tag == EventTag::Started && e.data == 0x03)
            .expect("started event");
        assert_eq!(started.routing, Routing::Only(7));

        let received = events
            .iter()
            .find(|e| e.tag == EventTag::Received && e.data == 0x03)
            .expect("received event for the winning byte");
        assert_eq!(received.routing, Routing::AllExcept(7));
    }

    #[tokio::test]
    async fn cmd_init_replies_resetted_only_to_requester() {
        let claim = Arc::new(ArbitrationClaim::new());
        let (tx, mut rx) = channel();
        let mut bus = Bus::new(claim, tx);
        let mut writer = RecordingWriter::new();

        bus.handle_command(BusCommand::Init { client_id: 42 }, &mut writer);
        let event = rx.recv().await.expect("event");
        assert_eq!(event.tag, EventTag::Resetted);
        assert_eq!(event.routing, Routing::Only(42));
    }

    #[tokio::test]
    async fn conflicting_start_is_rejected() {
        let claim = Arc::new(ArbitrationClaim::new());
        let (tx, mut rx) = channel();
        let mut bus = Bus::new(claim, tx);
        let mut writer = RecordingWriter::new();

        bus.handle_command(BusCommand::StartArbitration { client_id: 1, address: 0x03 }, &mut writer);
        bus.handle_command(BusCommand::StartArbitration { client_id: 2, address: 0x07 }, &mut writer);

        let event = rx.recv().await.expect("event");
        assert_eq!(event.tag, EventTag::ErrorHost);
        assert_eq!(event.routing, Routing::Only(2));
    }
}
