//! Monitor network driver: UDP transport to the node agent

use crate::classifier::ViewerCapability;
use crate::instance::InstanceMonitor;
use crate::reconciler::{FetchError, FetchTicket};
use crate::render::TerminalRenderer;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, DEFAULT_AGENT_PORT, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub agent_addr: String,
    pub instance_key: String,
    pub capability: ViewerCapability,
    pub fake_ping_ms: u64,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    pub reinstall_on_start: bool,
    pub render: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agent_addr: format!("127.0.0.1:{}", DEFAULT_AGENT_PORT),
            instance_key: String::new(),
            capability: ViewerCapability::Standard,
            fake_ping_ms: 0,
            poll_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(5),
            reinstall_on_start: false,
            render: true,
        }
    }
}

struct PendingFetch {
    ticket: FetchTicket,
    sent_at: Instant,
}

pub struct MonitorClient {
    socket: UdpSocket,
    agent_addr: SocketAddr,
    config: MonitorConfig,
    monitor: InstanceMonitor,
    renderer: TerminalRenderer,

    next_request_id: u32,
    pending_fetches: HashMap<u32, PendingFetch>,
    pending_reinstall: Option<(u32, Instant)>,
    last_packet: Instant,
    connect_sent_at: Option<Instant>,
}

impl MonitorClient {
    pub async fn new(config: MonitorConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let agent_addr = config.agent_addr.parse()?;

        let monitor = InstanceMonitor::new(config.instance_key.clone(), config.capability);
        let renderer = TerminalRenderer::new(config.render);

        Ok(MonitorClient {
            socket,
            agent_addr,
            monitor,
            renderer,
            next_request_id: 1,
            pending_fetches: HashMap::new(),
            pending_reinstall: None,
            last_packet: Instant::now(),
            connect_sent_at: None,
            config,
        })
    }

    pub fn monitor(&self) -> &InstanceMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut InstanceMonitor {
        &mut self.monitor
    }

    fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.config.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.config.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.agent_addr).await?;
        Ok(())
    }

    async fn connect(&mut self) {
        info!("Connecting to agent at {}...", self.agent_addr);

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            instance_key: self.config.instance_key.clone(),
        };
        self.connect_sent_at = Some(Instant::now());
        if let Err(e) = self.send_packet(&packet).await {
            error!("Error sending connect: {}", e);
        }
    }

    /// Issues a snapshot fetch; the answer is merged when it arrives.
    pub async fn request_snapshot(&mut self) {
        let ticket = self.monitor.begin_fetch();
        let request_id = self.next_request_id();

        let packet = Packet::FetchSnapshot {
            request_id,
            instance_key: self.config.instance_key.clone(),
        };

        match self.send_packet(&packet).await {
            Ok(()) => {
                self.pending_fetches.insert(
                    request_id,
                    PendingFetch {
                        ticket,
                        sent_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                let _ = self
                    .monitor
                    .apply_fetch(ticket, Err(FetchError::Transport(e.to_string())));
            }
        }
    }

    pub async fn request_reinstall(&mut self) {
        let request_id = self.next_request_id();
        let packet = Packet::Reinstall {
            request_id,
            instance_key: self.config.instance_key.clone(),
        };

        match self.send_packet(&packet).await {
            Ok(()) => self.pending_reinstall = Some((request_id, Instant::now())),
            Err(e) => error!("Error sending reinstall request: {}", e),
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        self.last_packet = Instant::now();

        match packet {
            Packet::Connected { session_id } => {
                self.connect_sent_at = None;
                self.monitor.stream().establish(session_id);
            }

            Packet::Snapshot {
                request_id,
                snapshot,
            } => match self.pending_fetches.remove(&request_id) {
                Some(pending) => {
                    if let Err(e) = self.monitor.apply_fetch(pending.ticket, Ok(snapshot)) {
                        warn!("Discarding snapshot: {}", e);
                    }
                }
                None => debug!("Snapshot for unknown request {}", request_id),
            },

            Packet::RequestFailed { request_id, reason } => {
                if let Some(pending) = self.pending_fetches.remove(&request_id) {
                    let _ = self
                        .monitor
                        .apply_fetch(pending.ticket, Err(FetchError::Rejected(reason)));
                } else if matches!(self.pending_reinstall, Some((id, _)) if id == request_id) {
                    self.pending_reinstall = None;
                    warn!("Reinstall rejected: {}", reason);
                } else {
                    debug!("Failure for unknown request {}: {}", request_id, reason);
                }
            }

            Packet::ReinstallAccepted { request_id } => {
                if matches!(self.pending_reinstall, Some((id, _)) if id == request_id) {
                    self.pending_reinstall = None;
                    info!("Reinstall of {} started", self.config.instance_key);
                }
            }

            Packet::StatusChanged { session_id, status } => {
                self.monitor.stream().push_status(session_id, status);
            }

            Packet::ConsoleOutput { session_id, line } => {
                if self.monitor.stream().push_console(session_id, line.clone()) {
                    self.renderer.console_line(&self.monitor, &line);
                }
            }

            Packet::Ping { .. } => {}

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.monitor.stream().lose(reason);
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }

        self.pump().await;
    }

    async fn pump(&mut self) {
        let outcome = self.monitor.pump();
        if outcome.refresh_requested {
            self.request_snapshot().await;
        }
    }

    /// Liveness, connect retries, keepalive and request timeouts.
    pub async fn maintain(&mut self) {
        let connection = self.monitor.stream().connection();

        if connection.connected {
            if self.last_packet.elapsed() > self.config.stale_after {
                self.monitor.stream().lose("agent stopped responding");
                self.pump().await;
                self.connect().await;
            } else if let Err(e) = self.send_packet(&Packet::Heartbeat).await {
                error!("Error sending heartbeat: {}", e);
            }
        } else {
            let waited_out = self
                .connect_sent_at
                .map(|sent| sent.elapsed() > self.config.connect_timeout)
                .unwrap_or(true);
            if waited_out {
                if self.connect_sent_at.is_some() {
                    self.monitor.stream().lose("connect timed out");
                    self.pump().await;
                }
                self.connect().await;
            }
        }

        let fetch_timeout = self.config.fetch_timeout;
        let expired: Vec<u32> = self
            .pending_fetches
            .iter()
            .filter(|(_, pending)| pending.sent_at.elapsed() > fetch_timeout)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            if let Some(pending) = self.pending_fetches.remove(&request_id) {
                let _ = self.monitor.apply_fetch(pending.ticket, Err(FetchError::Timeout));
            }
        }

        if matches!(self.pending_reinstall, Some((_, sent)) if sent.elapsed() > fetch_timeout) {
            self.pending_reinstall = None;
            warn!("Reinstall request timed out");
        }
    }

    /// Connects, loads the first snapshot and optionally kicks off a reinstall.
    pub async fn start(&mut self) {
        self.connect().await;
        self.request_snapshot().await;
        if self.config.reinstall_on_start {
            self.request_reinstall().await;
        }
    }

    /// Waits up to `wait` for one packet and handles it. Returns whether a
    /// packet was processed.
    pub async fn poll_once(&mut self, wait: Duration) -> bool {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        match timeout(wait, self.socket.recv_from(&mut buffer)).await {
            Ok(Ok((len, addr))) => {
                if addr != self.agent_addr {
                    debug!("Ignoring datagram from {}", addr);
                    return false;
                }
                match deserialize::<Packet>(&buffer[0..len]) {
                    Ok(packet) => {
                        self.handle_packet(packet).await;
                        true
                    }
                    Err(e) => {
                        warn!("Failed to deserialize packet: {}", e);
                        false
                    }
                }
            }
            Ok(Err(e)) => {
                error!("Error receiving packet: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.start().await;

        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        let mut poll_interval = interval(self.config.poll_interval);
        let mut render_interval = interval(Duration::from_millis(100));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first poll fires immediately; start() already fetched.
        poll_interval.tick().await;

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.agent_addr => {
                            if self.config.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.config.fake_ping_ms / 2)).await;
                            }

                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                self.handle_packet(packet).await;
                            }
                        },
                        Ok((_, addr)) => debug!("Ignoring datagram from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    self.maintain().await;
                },

                _ = poll_interval.tick() => {
                    self.request_snapshot().await;
                },

                _ = render_interval.tick() => {
                    self.renderer.render(&self.monitor);
                },

                line = stdin.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => match line.trim() {
                            "d" => self.monitor.dismiss_alert(),
                            "r" => self.request_snapshot().await,
                            "q" => break,
                            _ => {}
                        },
                        // Detached from a terminal: keep monitoring.
                        Ok(None) | Err(_) => stdin_open = false,
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if self.monitor.stream().connection().connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }
        self.monitor.shutdown();
    }
}
