//! Per-connection state for enhanced-port clients.
//!
//! Each accepted enhanced-port connection gets a read task that decodes
//! [`Command`]s and forwards them to the bus as [`BusCommand`]s, and a
//! write task that drains this client's slice of the fan-out queue and
//! encodes it back onto the wire — the same split-task shape the teacher
//! uses for its Unix-socket connections, adapted to the tagged protocol.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::enhanced::{encode_event, Command, EnhancedDecoder};
use super::fanout::{has_capacity, ClientEvent};
use crate::bus::BusCommand;

/// Bound on a single client's pending outgoing event queue. Exceeding this
/// means the client is not draining fast enough; the dispatcher drops
/// further events for it rather than stall.
const CLIENT_OUTBOX_CAPACITY: usize = 256;

/// Handle to a connected enhanced-port client, held by the dispatcher so it
/// can route fan-out events to this connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientEvent>,
    available_threshold: usize,
}

impl ClientHandle {
    /// Routes one event to this client's outbox, but only once the outbox's
    /// remaining capacity clears `available_threshold` — mirroring the
    /// original's "only write when the client's send buffer has enough free
    /// space" rule. Drops the event silently otherwise, whether because the
    /// outbox is full or merely below the threshold.
    pub fn try_deliver(&self, event: ClientEvent) {
        if !has_capacity(self.tx.capacity(), self.available_threshold) {
            return;
        }
        let _ = self.tx.try_send(event);
    }
}

/// Spawns the read and write tasks for one enhanced-port connection.
///
/// Returns the [`ClientHandle`] the dispatcher should register (and later
/// deregister on disconnect) plus both task handles for cleanup.
pub fn spawn(
    client_id: u64,
    stream: TcpStream,
    commands: mpsc::UnboundedSender<BusCommand>,
    available_threshold: usize,
) -> (ClientHandle, JoinHandle<()>, JoinHandle<()>) {
    let (read_half, write_half) = stream.into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);

    let read_handle = tokio::spawn(read_loop(client_id, read_half, commands));
    let write_handle = tokio::spawn(write_loop(client_id, write_half, outbox_rx));

    (
        ClientHandle {
            tx: outbox_tx,
            available_threshold,
        },
        read_handle,
        write_handle,
    )
}

async fn read_loop(
    client_id: u64,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    commands: mpsc::UnboundedSender<BusCommand>,
) {
    let mut decoder = EnhancedDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Enhanced] client {client_id} disconnected");
                let _ = commands.send(BusCommand::ClientDisconnected { client_id });
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(decoded) => {
                    for command in decoded {
                        if !dispatch(client_id, command, &commands) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Enhanced] frame decode error for client {client_id}: {e}");
                    let _ = commands.send(BusCommand::ClientDisconnected { client_id });
                    break;
                }
            },
            Err(e) => {
                log::error!("[Enhanced] read error for client {client_id}: {e}");
                let _ = commands.send(BusCommand::ClientDisconnected { client_id });
                break;
            }
        }
    }
}

/// Translates one decoded command into a [`BusCommand`]. Returns `false` if
/// the bus command channel is closed (adapter shutting down).
fn dispatch(client_id: u64, command: Command, commands: &mpsc::UnboundedSender<BusCommand>) -> bool {
    let bus_command = match command {
        Command::Init(_) => BusCommand::Init { client_id },
        Command::Send(byte) => BusCommand::Send { byte },
        Command::Start(addr) if addr == crate::constants::SYN => {
            BusCommand::CancelArbitration { client_id }
        }
        Command::Start(addr) => BusCommand::StartArbitration { client_id, address: addr },
        Command::Info(_) => return true,
    };
    commands.send(bus_command).is_ok()
}

async fn write_loop(
    client_id: u64,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbox: mpsc::Receiver<ClientEvent>,
) {
    while let Some(event) = outbox.recv().await {
        let frame = encode_event(event.tag, event.data);
        if let Err(e) = writer.write_all(&frame).await {
            log::error!("[Enhanced] write error for client {client_id}: {e}");
            break;
        }
    }
}
