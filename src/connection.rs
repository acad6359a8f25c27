//! Transport boundary.
//!
//! The engine never opens sockets itself. A connection provider (TCP/TLS,
//! Bluetooth, an in-process loopback in tests) performs discovery and the
//! identity handshake out of band, then hands the engine live
//! [`Connection`] handles and feeds it [`ConnectionEvent`]s.

use async_trait::async_trait;
use std::sync::Arc;

use crate::device::DeviceInfo;
use crate::error::Result;
use crate::packet::Packet;

/// A live, authenticated link to a peer. Implementations own framing and
/// encryption; the engine only pushes packets through.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one packet. Errors map to `ProtocolError::Transport` or `Io`.
    async fn send(&self, packet: &Packet) -> Result<()>;
}

/// Source of connections. Implementations run discovery and the identity
/// exchange, then report the results as [`ConnectionEvent`]s.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Lifecycle and traffic notifications from a provider, consumed by the
/// device manager's dispatch loop.
pub enum ConnectionEvent {
    /// A peer completed the handshake and is reachable.
    Connected {
        info: DeviceInfo,
        connection: Arc<dyn Connection>,
    },
    /// A packet arrived from a connected peer.
    PacketReceived { device_id: String, packet: Packet },
    /// The link dropped.
    Disconnected { device_id: String },
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Connected { info, .. } => f
                .debug_struct("Connected")
                .field("device_id", &info.device_id)
                .finish(),
            ConnectionEvent::PacketReceived { device_id, packet } => f
                .debug_struct("PacketReceived")
                .field("device_id", device_id)
                .field("type", &packet.packet_type)
                .finish(),
            ConnectionEvent::Disconnected { device_id } => f
                .debug_struct("Disconnected")
                .field("device_id", device_id)
                .finish(),
        }
    }
}
