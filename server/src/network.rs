//! Server network layer driving the gateway from a UDP socket
//!
//! A spawned receiver task reads datagrams and forwards them over a channel
//! to the main loop, which is the only place the gateway is touched. After
//! every event the loop writes out whatever the gateway queued.

use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::handler::{DefaultHandler, GameHandler};
use crate::loss;
use crate::store::{FileStore, MemoryStore, PlayerStore};
use log::{debug, error, info, warn};
use shared::MAX_DATAGRAM_LEN;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, MissedTickBehavior};

pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Attempts made to rebind the socket after a failed write
const REBIND_ATTEMPTS: u32 = 5;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { addr: SocketAddr, bytes: Vec<u8> },
    Shutdown,
}

/// Asks a running server to disconnect everyone and stop
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.server_tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }
}

pub struct Server<H: GameHandler = DefaultHandler> {
    socket: Option<Arc<UdpSocket>>,
    addr: SocketAddr,
    gateway: Gateway<H>,
    ping_check_interval: Duration,
    receiver: Option<JoinHandle<()>>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server<DefaultHandler> {
    /// Binds the configured address with the default gameplay handler
    ///
    /// Player records go to `config.data_dir` when set, otherwise they are
    /// kept in memory.
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        let store: Box<dyn PlayerStore> = match &config.data_dir {
            Some(dir) => Box::new(FileStore::open(dir)?),
            None => Box::new(MemoryStore::new()),
        };
        if config.fault_injection_enabled() {
            warn!(
                "Fault injection enabled: dropping {}% inbound, {}% outbound",
                config.inbound_loss, config.outbound_loss
            );
        }
        let loss = loss::from_percentages(config.inbound_loss, config.outbound_loss);
        let gateway = Gateway::new(config, DefaultHandler::new(), store, loss);
        Self::with_gateway(gateway).await
    }
}

impl<H: GameHandler + 'static> Server<H> {
    pub async fn with_gateway(gateway: Gateway<H>) -> ServerResult<Self> {
        let config = gateway.registry().config();
        let addr = config.bind_addr();
        let ping_check_interval = config.ping_check_interval;

        let socket = UdpSocket::bind(&addr).await?;
        let addr = socket.local_addr()?;
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket: Some(Arc::new(socket)),
            addr,
            gateway,
            ping_check_interval,
            receiver: None,
            server_tx,
            server_rx,
        })
    }

    /// Address the socket is bound to, kept across restarts
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    pub fn gateway(&self) -> &Gateway<H> {
        &self.gateway
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&mut self) {
        let socket = match &self.socket {
            Some(socket) => Arc::clone(socket),
            None => return,
        };
        let server_tx = self.server_tx.clone();

        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_LEN * 64];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let bytes = buffer[..len].to_vec();
                        if let Err(e) =
                            server_tx.send(ServerMessage::DatagramReceived { addr, bytes })
                        {
                            error!("Failed to send datagram to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        if let Some(old) = self.receiver.replace(handle) {
            old.abort();
        }
    }

    /// Rebinds the socket on the same address and restarts the receiver
    ///
    /// The old socket is closed first so the port is free to bind again.
    async fn restart(&mut self) -> ServerResult<()> {
        let addr = self.addr;
        warn!("Restarting network on {}", addr);

        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
            // Aborted tasks still hold the socket until they are dropped
            let _ = receiver.await;
        }
        self.socket = None;

        let mut attempt = 0;
        let socket = loop {
            attempt += 1;
            match UdpSocket::bind(addr).await {
                Ok(socket) => break socket,
                Err(e) if attempt < REBIND_ATTEMPTS => {
                    warn!("Rebind attempt {} failed: {}", attempt, e);
                    sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.socket = Some(Arc::new(socket));
        self.spawn_network_receiver();
        info!("Network restarted on {}", addr);
        Ok(())
    }

    /// Writes out everything the gateway queued
    async fn send_outbox(&mut self) {
        for (addr, datagram) in self.gateway.drain_outbox() {
            if self.socket.is_none() {
                if let Err(e) = self.restart().await {
                    error!("Dropping {} bytes to {}, no socket: {}", datagram.len(), addr, e);
                    continue;
                }
            }
            let socket = match self.socket.clone() {
                Some(socket) => socket,
                None => continue,
            };
            let sent = socket.send_to(&datagram, addr).await;
            drop(socket);
            if let Err(e) = sent {
                error!("Failed to send {} bytes to {}: {}", datagram.len(), addr, e);
                if let Err(e) = self.restart().await {
                    error!("Network restart failed: {}", e);
                }
            }
        }
    }

    /// Main server loop; returns after a shutdown request
    pub async fn run(&mut self) -> ServerResult<()> {
        self.spawn_network_receiver();

        let mut ping_check = interval(self.ping_check_interval);
        ping_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            let flush_at = self.gateway.next_deadline();

            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { addr, bytes }) => {
                            self.gateway.handle_datagram(addr, &bytes, Instant::now());
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.gateway.shutdown();
                            self.send_outbox().await;
                            break;
                        }
                    }
                },

                _ = flush_timer(flush_at) => {
                    self.gateway.poll_flush(Instant::now());
                },

                _ = ping_check.tick() => {
                    let expired = self.gateway.check_ping_timeouts(Instant::now());
                    if expired > 0 {
                        info!("Disconnected {} sessions for ping timeout", expired);
                    }
                },
            }

            self.send_outbox().await;
        }

        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        Ok(())
    }
}

/// Resolves at the next coalescing deadline, or never without one
async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}
