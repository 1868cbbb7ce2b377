//! Agent network layer: UDP transport, session routing and the instance tick loop

use crate::instance::{InstanceEvent, InstanceRegistry};
use crate::session_manager::{SessionManager, DEFAULT_SESSION_TIMEOUT};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{
    get_timestamp, Packet, SessionId, DEFAULT_AGENT_PORT, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub type AgentResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Time between scenario steps
    pub tick_duration: Duration,
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_AGENT_PORT),
            tick_duration: Duration::from_millis(250),
            max_sessions: 32,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// Messages sent from network tasks to the main agent loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    SessionTimeout { session_id: SessionId },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    /// Sent to every attached session regardless of instance
    BroadcastPacket { packet: Packet },
}

/// Node agent serving instance snapshots and pushing lifecycle events
pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<SessionManager>>,
    instances: InstanceRegistry,
    config: ServerConfig,
    rng: StdRng,
    tasks: Vec<JoinHandle<()>>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(config: ServerConfig, instances: InstanceRegistry) -> AgentResult<Self> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Agent listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            sessions: Arc::new(RwLock::new(
                SessionManager::new(config.max_sessions).with_timeout(config.session_timeout),
            )),
            instances,
            config,
            rng: StdRng::from_entropy(),
            tasks: Vec::new(),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> AgentResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Handle that stops `run` when sent `ServerMessage::Shutdown`.
    pub fn shutdown_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[0..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);
        let sessions = Arc::clone(&self.sessions);

        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::BroadcastPacket { packet } => {
                        let addrs = sessions.read().await.session_addrs();
                        for (session_id, addr) in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to session {}: {}", session_id, e);
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Spawns task that drops sessions whose monitors went silent
    fn spawn_timeout_checker(&mut self) {
        let sessions = Arc::clone(&self.sessions);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = sessions.write().await.check_timeouts();
                for session_id in timed_out {
                    if server_tx
                        .send(ServerMessage::SessionTimeout { session_id })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }));
    }

    async fn send_packet_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> AgentResult<()> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outbound_tx.send(OutboundMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet) {
        if let Err(e) = self.outbound_tx.send(OutboundMessage::BroadcastPacket { packet }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Pushes an instance event to every session following that instance,
    /// stamped with each recipient's own session id.
    async fn route_event(&self, instance_key: &str, event: &InstanceEvent) {
        let recipients = self.sessions.read().await.sessions_for_instance(instance_key);

        for (session_id, addr) in recipients {
            let packet = match event {
                InstanceEvent::StatusChanged(status) => Packet::StatusChanged {
                    session_id,
                    status: status.clone(),
                },
                InstanceEvent::ConsoleOutput(line) => Packet::ConsoleOutput {
                    session_id,
                    line: line.clone(),
                },
            };
            self.send_packet(packet, addr);
        }
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        self.sessions.write().await.touch(addr);

        match packet {
            Packet::Connect {
                client_version,
                instance_key,
            } => {
                info!(
                    "Monitor connecting from {} for {} (version: {})",
                    addr, instance_key, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    let reason = "Protocol version mismatch".to_string();
                    self.send_packet(Packet::Disconnected { reason }, addr);
                    return;
                }

                if !self.instances.contains(&instance_key) {
                    let reason = "instance not found".to_string();
                    self.send_packet(Packet::Disconnected { reason }, addr);
                    return;
                }

                let session_id = {
                    let mut sessions = self.sessions.write().await;
                    if let Some(existing) = sessions.find_session_by_addr(addr) {
                        info!("Replacing session {} from {}", existing, addr);
                        sessions.remove_session(&existing);
                    }
                    sessions.add_session(addr, &instance_key)
                };

                match session_id {
                    Some(session_id) => self.send_packet(Packet::Connected { session_id }, addr),
                    None => {
                        let reason = "Agent full".to_string();
                        self.send_packet(Packet::Disconnected { reason }, addr);
                    }
                }
            }

            Packet::FetchSnapshot {
                request_id,
                instance_key,
            } => {
                let response = match self.instances.snapshot(&instance_key) {
                    Ok(snapshot) => Packet::Snapshot {
                        request_id,
                        snapshot,
                    },
                    Err(e) => Packet::RequestFailed {
                        request_id,
                        reason: e.to_string(),
                    },
                };
                self.send_packet(response, addr);
            }

            Packet::Reinstall {
                request_id,
                instance_key,
            } => match self.instances.reinstall(&instance_key) {
                Ok(events) => {
                    info!("Reinstalling {} at the request of {}", instance_key, addr);
                    self.send_packet(Packet::ReinstallAccepted { request_id }, addr);
                    for event in &events {
                        self.route_event(&instance_key, event).await;
                    }
                }
                Err(e) => {
                    warn!("Reinstall of {} refused: {}", instance_key, e);
                    let reason = e.to_string();
                    self.send_packet(Packet::RequestFailed { request_id, reason }, addr);
                }
            },

            Packet::Heartbeat => {}

            Packet::Disconnect => {
                let mut sessions = self.sessions.write().await;
                if let Some(session_id) = sessions.find_session_by_addr(addr) {
                    sessions.remove_session(&session_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from monitor at {}", addr);
            }
        }
    }

    async fn tick(&mut self) {
        let events = self.instances.advance_all(&mut self.rng);
        for (instance_key, event) in &events {
            self.route_event(instance_key, event).await;
        }
    }

    /// Tells every attached monitor the agent is going away.
    async fn disconnect_all(&self) {
        let addrs = self.sessions.read().await.session_addrs();
        let packet = Packet::Disconnected {
            reason: "Agent shutting down".to_string(),
        };
        for (_, addr) in addrs {
            if let Err(e) = Self::send_packet_impl(&self.socket, &packet, addr).await {
                debug!("Failed to notify {} of shutdown: {}", addr, e);
            }
        }
    }

    /// Main agent loop
    pub async fn run(&mut self) -> AgentResult<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.config.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ping_interval = interval(self.config.ping_interval);

        info!(
            "Agent started with {} instance(s), tick {:?}",
            self.instances.len(),
            self.config.tick_duration
        );

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::SessionTimeout { session_id }) => {
                            info!("Session {} timed out", session_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Agent shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.tick().await;
                },

                _ = ping_interval.tick() => {
                    self.broadcast_packet(Packet::Ping { timestamp: get_timestamp() });
                },
            }
        }

        self.disconnect_all().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Scenario;
    use shared::InstanceStatus;

    async fn spawn_agent(
        instances: InstanceRegistry,
        max_sessions: usize,
    ) -> (SocketAddr, mpsc::UnboundedSender<ServerMessage>) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            tick_duration: Duration::from_millis(20),
            max_sessions,
            ..ServerConfig::default()
        };
        let mut server = Server::new(config, instances).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_sender();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, shutdown)
    }

    async fn exchange(socket: &UdpSocket, agent: SocketAddr, packet: &Packet) -> Packet {
        socket.send_to(&serialize(packet).unwrap(), agent).await.unwrap();
        recv_matching(socket, |p| {
            !matches!(
                p,
                Packet::Ping { .. } | Packet::ConsoleOutput { .. } | Packet::StatusChanged { .. }
            )
        })
        .await
    }

    async fn recv_matching(socket: &UdpSocket, wanted: impl Fn(&Packet) -> bool) -> Packet {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
                .await
                .expect("agent did not answer")
                .unwrap();
            let packet: Packet = deserialize(&buffer[..len]).unwrap();
            if wanted(&packet) {
                return packet;
            }
        }
    }

    fn registry(key: &str, scenario: Scenario) -> InstanceRegistry {
        let mut instances = InstanceRegistry::new();
        instances.add(key, scenario);
        instances
    }

    fn connect_packet(key: &str) -> Packet {
        Packet::Connect {
            client_version: PROTOCOL_VERSION,
            instance_key: key.to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.bind_addr.parse::<SocketAddr>().is_ok());
        assert!(config.session_timeout > config.ping_interval);
        assert!(config.max_sessions > 0);
    }

    #[tokio::test]
    async fn test_connect_and_fetch_snapshot() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Suspended), 4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connected = exchange(&socket, agent, &connect_packet("srv-1")).await;
        assert!(matches!(connected, Packet::Connected { .. }));

        let fetch = Packet::FetchSnapshot {
            request_id: 9,
            instance_key: "srv-1".to_string(),
        };
        match exchange(&socket, agent, &fetch).await {
            Packet::Snapshot {
                request_id,
                snapshot,
            } => {
                assert_eq!(request_id, 9);
                assert_eq!(snapshot.status, InstanceStatus::Suspended);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_instance_is_refused() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Steady), 4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        match exchange(&socket, agent, &connect_packet("missing")).await {
            Packet::Disconnected { reason } => assert_eq!(reason, "instance not found"),
            other => panic!("Unexpected packet {:?}", other),
        }

        let fetch = Packet::FetchSnapshot {
            request_id: 1,
            instance_key: "missing".to_string(),
        };
        match exchange(&socket, agent, &fetch).await {
            Packet::RequestFailed { request_id, reason } => {
                assert_eq!(request_id, 1);
                assert_eq!(reason, "instance not found");
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_is_refused() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Steady), 4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION + 1,
            instance_key: "srv-1".to_string(),
        };
        assert!(matches!(
            exchange(&socket, agent, &packet).await,
            Packet::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_agent_full() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Steady), 1).await;
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert!(matches!(
            exchange(&first, agent, &connect_packet("srv-1")).await,
            Packet::Connected { .. }
        ));
        match exchange(&second, agent, &connect_packet("srv-1")).await {
            Packet::Disconnected { reason } => assert_eq!(reason, "Agent full"),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_from_same_address_gets_new_session() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Steady), 1).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let first = exchange(&socket, agent, &connect_packet("srv-1")).await;
        let second = exchange(&socket, agent, &connect_packet("srv-1")).await;
        match (first, second) {
            (Packet::Connected { session_id: a }, Packet::Connected { session_id: b }) => {
                assert_ne!(a, b)
            }
            other => panic!("Unexpected packets {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reinstall_pushes_installing_to_session() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Steady), 4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let session = match exchange(&socket, agent, &connect_packet("srv-1")).await {
            Packet::Connected { session_id } => session_id,
            other => panic!("Unexpected packet {:?}", other),
        };

        let reinstall = Packet::Reinstall {
            request_id: 3,
            instance_key: "srv-1".to_string(),
        };
        assert!(matches!(
            exchange(&socket, agent, &reinstall).await,
            Packet::ReinstallAccepted { request_id: 3 }
        ));

        let pushed = recv_matching(&socket, |p| matches!(p, Packet::StatusChanged { .. })).await;
        match pushed {
            Packet::StatusChanged { session_id, status } => {
                assert_eq!(session_id, session);
                assert_eq!(status, InstanceStatus::Installing);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reinstall_refused_while_suspended() {
        let (agent, _shutdown) = spawn_agent(registry("srv-1", Scenario::Suspended), 4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let reinstall = Packet::Reinstall {
            request_id: 5,
            instance_key: "srv-1".to_string(),
        };
        assert!(matches!(
            exchange(&socket, agent, &reinstall).await,
            Packet::RequestFailed { request_id: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_sessions() {
        let (agent, shutdown) = spawn_agent(registry("srv-1", Scenario::Steady), 4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        exchange(&socket, agent, &connect_packet("srv-1")).await;

        shutdown.send(ServerMessage::Shutdown).unwrap();
        let packet = recv_matching(&socket, |p| matches!(p, Packet::Disconnected { .. })).await;
        match packet {
            Packet::Disconnected { reason } => assert_eq!(reason, "Agent shutting down"),
            other => panic!("Unexpected packet {:?}", other),
        }
    }
}
