//! TCP server: binds the four network ports and spawns per-connection
//! tasks, mirroring the teacher's accept-loop-spawns-per-connection-task
//! shape (originally over a `UnixListener`, here over `TcpListener`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{Bus, BusCommand, StatusSnapshot};
use crate::config::Config;
use super::client_conn::{self, ClientHandle};
use super::fanout::FanoutReceiver;
use super::raw_conn;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

type ClientRegistry = Arc<Mutex<HashMap<u64, ClientHandle>>>;

/// Live connection counts per port, read by the status port alongside the
/// bus's arbitration counters.
#[derive(Debug, Default)]
struct ClientCounts {
    raw: AtomicU64,
    raw_ro: AtomicU64,
    enhanced: AtomicU64,
}

/// Running network surface: the four listeners and the fan-out dispatcher,
/// all spawned as independent Tokio tasks.
#[derive(Debug)]
pub struct Server {
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds every configured port and spawns its accept loop plus the
    /// fan-out dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if any port fails to bind.
    pub async fn start(
        config: &Config,
        bus: &Bus,
        commands: mpsc::UnboundedSender<BusCommand>,
        fanout_rx: FanoutReceiver,
    ) -> Result<Self> {
        let registry: ClientRegistry = Arc::default();
        let counts = Arc::new(ClientCounts::default());

        let raw_listener = bind(config.raw_port).await?;
        let raw_ro_listener = bind(config.raw_ro_port).await?;
        let enhanced_listener = bind(config.enhanced_port).await?;
        let status_listener = bind(config.status_port).await?;

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(dispatch_loop(fanout_rx, registry.clone())));

        tasks.push(tokio::spawn(raw_accept_loop(
            raw_listener,
            bus.raw_sender(),
            commands.clone(),
            false,
            counts.clone(),
            config.max_clients,
        )));
        tasks.push(tokio::spawn(raw_accept_loop(
            raw_ro_listener,
            bus.raw_sender(),
            commands.clone(),
            true,
            counts.clone(),
            config.max_clients,
        )));
        tasks.push(tokio::spawn(enhanced_accept_loop(
            enhanced_listener,
            commands.clone(),
            registry,
            counts.clone(),
            config.max_clients,
            config.available_threshold,
        )));
        tasks.push(tokio::spawn(status_accept_loop(
            status_listener,
            bus.status_handle(),
            counts,
        )));

        Ok(Self { tasks })
    }

    /// Aborts every listener/dispatcher task. Existing connections' own
    /// tasks are left to wind down on their own I/O errors.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind port {port}"))
}

async fn raw_accept_loop(
    listener: TcpListener,
    raw_tx: tokio::sync::broadcast::Sender<u8>,
    commands: mpsc::UnboundedSender<BusCommand>,
    read_only: bool,
    counts: Arc<ClientCounts>,
    max_clients: usize,
) {
    let counter = if read_only { &counts.raw_ro } else { &counts.raw };
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if counter.load(Ordering::Relaxed) as usize >= max_clients {
                    log::warn!(
                        "[Raw] rejecting client from {addr}: max_clients ({max_clients}) reached (read_only={read_only})"
                    );
                    drop(stream);
                    continue;
                }
                let client_id = next_client_id();
                log::info!("[Raw] client {client_id} connected from {addr} (read_only={read_only})");
                counter.fetch_add(1, Ordering::Relaxed);
                let (read_handle, write_handle) =
                    raw_conn::spawn(client_id, stream, raw_tx.subscribe(), commands.clone(), read_only);

                let cleanup_counts = counts.clone();
                let read_only_cleanup = read_only;
                tokio::spawn(async move {
                    let _ = read_handle.await;
                    write_handle.abort();
                    let counter = if read_only_cleanup {
                        &cleanup_counts.raw_ro
                    } else {
                        &cleanup_counts.raw
                    };
                    counter.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(e) => {
                log::error!("[Raw] accept error: {e}");
            }
        }
    }
}

async fn enhanced_accept_loop(
    listener: TcpListener,
    commands: mpsc::UnboundedSender<BusCommand>,
    registry: ClientRegistry,
    counts: Arc<ClientCounts>,
    max_clients: usize,
    available_threshold: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if counts.enhanced.load(Ordering::Relaxed) as usize >= max_clients {
                    log::warn!(
                        "[Enhanced] rejecting client from {addr}: max_clients ({max_clients}) reached"
                    );
                    drop(stream);
                    continue;
                }
                let client_id = next_client_id();
                log::info!("[Enhanced] client {client_id} connected from {addr}");
                let (handle, read_handle, write_handle) =
                    client_conn::spawn(client_id, stream, commands.clone(), available_threshold);

                registry
                    .lock()
                    .expect("client registry mutex poisoned")
                    .insert(client_id, handle);
                counts.enhanced.fetch_add(1, Ordering::Relaxed);

                let cleanup_registry = registry.clone();
                let cleanup_commands = commands.clone();
                let cleanup_counts = counts.clone();
                tokio::spawn(async move {
                    let _ = read_handle.await;
                    write_handle.abort();
                    cleanup_registry
                        .lock()
                        .expect("client registry mutex poisoned")
                        .remove(&client_id);
                    cleanup_counts.enhanced.fetch_sub(1, Ordering::Relaxed);
                    let _ = cleanup_commands.send(BusCommand::ClientDisconnected { client_id });
                });
            }
            Err(e) => {
                log::error!("[Enhanced] accept error: {e}");
            }
        }
    }
}

async fn status_accept_loop(
    listener: TcpListener,
    status: Arc<Mutex<StatusSnapshot>>,
    counts: Arc<ClientCounts>,
) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                log::info!("[Status] client connected from {addr}");
                let snapshot = *status.lock().expect("status mutex poisoned");
                let text = format_snapshot(&snapshot, &counts);
                if let Err(e) = stream.write_all(text.as_bytes()).await {
                    log::warn!("[Status] write error for {addr}: {e}");
                }
            }
            Err(e) => {
                log::error!("[Status] accept error: {e}");
            }
        }
    }
}

fn format_snapshot(snapshot: &StatusSnapshot, counts: &ClientCounts) -> String {
    let counters = &snapshot.arbitration;
    let claim = snapshot
        .claim
        .map(|c| format!("client {} arbitrating for {:#04x}", c.client_id, c.address))
        .unwrap_or_else(|| "none".to_string());
    format!(
        "uptime_ms={} arbitrations={} won1={} won2={} lost1={} lost2={} late={} errors={} claim={claim} clients_raw={} clients_raw_ro={} clients_enhanced={}\n",
        snapshot.started_at.elapsed().as_millis(),
        counters.arbitrations,
        counters.won_round1,
        counters.won_round2,
        counters.lost_round1,
        counters.lost_round2,
        counters.late,
        counters.errors,
        counts.raw.load(Ordering::Relaxed),
        counts.raw_ro.load(Ordering::Relaxed),
        counts.enhanced.load(Ordering::Relaxed),
    )
}

/// Drains the bus's fan-out queue and routes each event to every admitted,
/// currently registered enhanced-port client.
async fn dispatch_loop(mut fanout_rx: FanoutReceiver, registry: ClientRegistry) {
    while let Some(event) = fanout_rx.recv().await {
        let registry = registry.lock().expect("client registry mutex poisoned");
        for (client_id, handle) in registry.iter() {
            if event.admits(*client_id) {
                handle.try_deliver(event);
            }
        }
    }
}
