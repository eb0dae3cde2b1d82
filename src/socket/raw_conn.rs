//! Raw port connection handling: the read/write port forwards every
//! observed bus byte verbatim and queues client-written bytes for bus
//! transmission; the read-only port forwards bytes but discards writes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::bus::BusCommand;

/// Spawns read/write tasks for one raw-port connection and returns their
/// handles, mirroring [`super::client_conn`]'s split read/write task shape.
pub fn spawn(
    client_id: u64,
    stream: TcpStream,
    raw_rx: broadcast::Receiver<u8>,
    commands: mpsc::UnboundedSender<BusCommand>,
    read_only: bool,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (read_half, write_half) = stream.into_split();

    let write_handle = tokio::spawn(write_loop(client_id, write_half, raw_rx));

    let read_handle = if read_only {
        tokio::spawn(discard_loop(client_id, read_half))
    } else {
        tokio::spawn(read_loop(client_id, read_half, commands))
    };

    (read_handle, write_handle)
}

/// Forwards every client-written byte to the bus as `CMD_SEND`.
async fn read_loop(
    client_id: u64,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    commands: mpsc::UnboundedSender<BusCommand>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Raw] client {client_id} disconnected");
                let _ = commands.send(BusCommand::ClientDisconnected { client_id });
                break;
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    if commands.send(BusCommand::Send { byte }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::error!("[Raw] read error for client {client_id}: {e}");
                let _ = commands.send(BusCommand::ClientDisconnected { client_id });
                break;
            }
        }
    }
}

/// Read-only port: drains and discards whatever the client writes, so a
/// confused client filling its send buffer doesn't wedge the connection.
async fn discard_loop(client_id: u64, mut reader: tokio::net::tcp::OwnedReadHalf) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Raw] read-only client {client_id} disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("[Raw] read-only read error for client {client_id}: {e}");
                break;
            }
        }
    }
}

/// Forwards every byte observed on the bus to the client, in observation
/// order. A lagging client skips the bytes it missed rather than stalling
/// the bus task, matching the fan-out queue's own backpressure rule.
async fn write_loop(
    client_id: u64,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut raw_rx: broadcast::Receiver<u8>,
) {
    loop {
        match raw_rx.recv().await {
            Ok(byte) => {
                if let Err(e) = writer.write_all(&[byte]).await {
                    log::error!("[Raw] write error for client {client_id}: {e}");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("[Raw] client {client_id} lagged, dropped {skipped} bytes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
