//! Transport Boundary
//!
//! The platform Bluetooth driver is an external collaborator. It plugs in
//! through [`LinkTransport`] (connection-oriented link) and
//! [`ScanTransport`] (broadcast listening). Everything the driver reports
//! about a link arrives as a [`LinkEvent`] through the [`LinkEventSink`]
//! handed to it when the link was opened.

use crate::domain::error::LinkError;
use crate::domain::models::{
    Advertisement, AttributeId, Command, DescriptorId, PeerId, WriteMode,
};
use tokio::sync::mpsc;
use tracing::trace;

/// Distinguishes successive links so late events from a released link can be dropped.
pub type LinkId = u64;

/// Everything the transport can report about one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Established,
    Lost {
        reason: String,
    },
    CapabilitiesDiscovered(Result<Vec<AttributeId>, LinkError>),
    AttributeRead {
        attribute: AttributeId,
        result: Result<Vec<u8>, LinkError>,
    },
    AttributeWritten {
        attribute: AttributeId,
        result: Result<(), LinkError>,
    },
    DescriptorWritten {
        descriptor: DescriptorId,
        result: Result<(), LinkError>,
    },
    /// Unsolicited value change on a subscribed attribute.
    Notification {
        attribute: AttributeId,
        value: Vec<u8>,
    },
    /// Explicit error status from the driver; the link is unusable.
    Error {
        reason: String,
    },
}

impl LinkEvent {
    /// Whether this event is the completion signal of a dispatched command.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::AttributeRead { .. } | Self::AttributeWritten { .. } | Self::DescriptorWritten { .. }
        )
    }
}

/// Event consumer bound to exactly one link.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    link: LinkId,
    tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
}

impl LinkEventSink {
    pub fn new(link: LinkId, tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>) -> Self {
        Self { link, tx }
    }

    pub fn link_id(&self) -> LinkId {
        self.link
    }

    /// Deliver an event. Events sent after the owner went away are discarded.
    pub fn emit(&self, event: LinkEvent) {
        trace!("Link {} event: {:?}", self.link, event);
        let _ = self.tx.send((self.link, event));
    }
}

/// One open link as the driver exposes it.
///
/// Every call returns as soon as the request is queued with the driver.
/// Results arrive later as [`LinkEvent`]s. An `Err` means the driver
/// rejected the request outright and no completion will follow.
pub trait LinkSession: Send + Sync {
    fn discover_capabilities(&self) -> Result<(), LinkError>;

    fn read_attribute(&self, attribute: &AttributeId) -> Result<(), LinkError>;

    fn write_attribute(
        &self,
        attribute: &AttributeId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError>;

    fn write_descriptor(&self, descriptor: &DescriptorId, payload: &[u8])
        -> Result<(), LinkError>;

    /// Enable local delivery of notifications for an attribute.
    fn subscribe(&self, attribute: &AttributeId) -> Result<(), LinkError>;

    /// Tear the link down. Must be safe to call more than once.
    fn close(&self);
}

pub trait LinkTransport: Send + Sync {
    /// Start opening a link to `peer`. Progress is reported through `events`.
    fn open_link(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<Box<dyn LinkSession>, LinkError>;
}

/// What a scan should let through before our own filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    Any,
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Advertisement(Advertisement),
    Failed(String),
}

pub trait ScanTransport: Send + Sync {
    /// Begin listening for broadcasts. Fails when the adapter is off or missing.
    fn start_scan(&self, filter: &ScanFilter)
        -> Result<mpsc::UnboundedReceiver<ScanReport>, LinkError>;

    fn stop_scan(&self);
}

/// Exclusive ownership of one open link. Dropping it closes the link.
pub struct LinkHandle {
    id: LinkId,
    peer: PeerId,
    session: Box<dyn LinkSession>,
}

impl LinkHandle {
    pub fn new(id: LinkId, peer: PeerId, session: Box<dyn LinkSession>) -> Self {
        Self { id, peer, session }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn session(&self) -> &dyn LinkSession {
        self.session.as_ref()
    }

    /// Issue a queued command against this link.
    pub fn dispatch(&self, command: &Command) -> Result<(), LinkError> {
        match command {
            Command::Read(attribute) => self.session.read_attribute(attribute),
            Command::Write {
                attribute,
                payload,
                mode,
            } => self.session.write_attribute(attribute, payload, *mode),
            Command::WriteDescriptor {
                descriptor,
                payload,
            } => self.session.write_descriptor(descriptor, payload),
        }
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.session.close();
    }
}
