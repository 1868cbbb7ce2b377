use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PACKET_SIZE: usize = 8192;
pub const DEFAULT_AGENT_PORT: u16 = 8080;

/// Operational status of a managed instance.
///
/// Travels over the wire as its lower-snake-case name so that a status this
/// build does not know about decodes to `Unknown` rather than failing the
/// whole packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceStatus {
    Installing,
    InstallFailed,
    ReinstallFailed,
    Suspended,
    Running,
    Starting,
    Stopping,
    Offline,
    Transferring,
    RestoringBackup,
    Unknown(String),
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceStatus::Installing => "installing",
            InstanceStatus::InstallFailed => "install_failed",
            InstanceStatus::ReinstallFailed => "reinstall_failed",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Running => "running",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Offline => "offline",
            InstanceStatus::Transferring => "transferring",
            InstanceStatus::RestoringBackup => "restoring_backup",
            InstanceStatus::Unknown(raw) => raw,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    /// True for the installer family: installing and both failure outcomes.
    pub fn is_installer(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Installing
                | InstanceStatus::InstallFailed
                | InstanceStatus::ReinstallFailed
        )
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, InstanceStatus::Unknown(_))
    }
}

impl From<String> for InstanceStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "installing" => InstanceStatus::Installing,
            "install_failed" => InstanceStatus::InstallFailed,
            "reinstall_failed" => InstanceStatus::ReinstallFailed,
            "suspended" => InstanceStatus::Suspended,
            "running" => InstanceStatus::Running,
            "starting" => InstanceStatus::Starting,
            "stopping" => InstanceStatus::Stopping,
            "offline" => InstanceStatus::Offline,
            "transferring" => InstanceStatus::Transferring,
            "restoring_backup" => InstanceStatus::RestoringBackup,
            _ => InstanceStatus::Unknown(raw),
        }
    }
}

impl From<&str> for InstanceStatus {
    fn from(raw: &str) -> Self {
        InstanceStatus::from(raw.to_string())
    }
}

impl From<InstanceStatus> for String {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one live connection epoch between a monitor and the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Point-in-time view of an instance as served by the agent.
///
/// Never patched in place: every update builds a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_key: String,
    pub status: InstanceStatus,
    pub is_transferring: bool,
    pub is_node_under_maintenance: bool,
    pub last_updated: u64,
}

impl InstanceSnapshot {
    pub fn new(instance_key: impl Into<String>, status: InstanceStatus) -> Self {
        Self {
            instance_key: instance_key.into(),
            status,
            is_transferring: false,
            is_node_under_maintenance: false,
            last_updated: get_timestamp(),
        }
    }

    /// Returns a copy carrying `status`, leaving the orthogonal flags alone.
    pub fn with_status(&self, status: InstanceStatus) -> Self {
        Self {
            instance_key: self.instance_key.clone(),
            status,
            is_transferring: self.is_transferring,
            is_node_under_maintenance: self.is_node_under_maintenance,
            last_updated: get_timestamp(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
        instance_key: String,
    },
    FetchSnapshot {
        request_id: u32,
        instance_key: String,
    },
    Reinstall {
        request_id: u32,
        instance_key: String,
    },
    Heartbeat,
    Disconnect,

    Connected {
        session_id: SessionId,
    },
    Snapshot {
        request_id: u32,
        snapshot: InstanceSnapshot,
    },
    RequestFailed {
        request_id: u32,
        reason: String,
    },
    ReinstallAccepted {
        request_id: u32,
    },
    StatusChanged {
        session_id: SessionId,
        status: InstanceStatus,
    },
    ConsoleOutput {
        session_id: SessionId,
        line: String,
    },
    Ping {
        timestamp: u64,
    },
    Disconnected {
        reason: String,
    },
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
