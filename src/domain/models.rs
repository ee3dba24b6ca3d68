use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Identity of a peer as the transport addresses it (MAC address or platform id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A characteristic-like attribute exposed by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeId(pub Uuid);

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A descriptor hanging off one attribute (e.g. its client configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    pub attribute: AttributeId,
    pub descriptor: Uuid,
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.attribute, self.descriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteMode {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// Observable link state. Only the connection controller produces these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(PeerId),
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// States in which nothing is happening on the link.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected(peer) => write!(f, "connected to {}", peer),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// One operation against the link.
///
/// Two commands are equal when they share the variant, the target id and
/// the payload bytes. The write mode does not take part in equality.
#[derive(Debug, Clone)]
pub enum Command {
    Read(AttributeId),
    Write {
        attribute: AttributeId,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    WriteDescriptor {
        descriptor: DescriptorId,
        payload: Vec<u8>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write { .. } => "write",
            Self::WriteDescriptor { .. } => "write-descriptor",
        }
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Read(a), Self::Read(b)) => a == b,
            (
                Self::Write {
                    attribute: a,
                    payload: pa,
                    ..
                },
                Self::Write {
                    attribute: b,
                    payload: pb,
                    ..
                },
            ) => a == b && pa == pb,
            (
                Self::WriteDescriptor {
                    descriptor: a,
                    payload: pa,
                },
                Self::WriteDescriptor {
                    descriptor: b,
                    payload: pb,
                },
            ) => a == b && pa == pb,
            _ => false,
        }
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Read(attribute) => attribute.hash(state),
            Self::Write {
                attribute, payload, ..
            } => {
                attribute.hash(state);
                payload.hash(state);
            }
            Self::WriteDescriptor {
                descriptor,
                payload,
            } => {
                descriptor.hash(state);
                payload.hash(state);
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(attribute) => write!(f, "read {}", attribute),
            Self::Write {
                attribute, payload, ..
            } => write!(f, "write {} ({} bytes)", attribute, payload.len()),
            Self::WriteDescriptor {
                descriptor,
                payload,
            } => write!(f, "write descriptor {} ({} bytes)", descriptor, payload.len()),
        }
    }
}

/// One broadcast sample as delivered by the scan primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub device_id: PeerId,
    /// Name reported by the platform, if it resolved one.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Raw advertisement data (AD structures).
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub id: PeerId,
    pub name: String,
    pub rssi: i16,
}

/// Output of a proximity (presence) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Loading,
    Acquired(ScannedDevice),
    Error(String),
}

/// Output of a plain discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Loading,
    Found(ScannedDevice),
    Error(String),
}

/// What the presence orchestrator is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PresenceStatus {
    #[default]
    Idle,
    Scanning,
    Acquired(PeerId),
    /// The last session timed out; waiting for the next disconnect cycle.
    Waiting,
    Error(String),
}
