//! Peerlink protocol engine.
//!
//! Implements the device-to-device connectivity protocol: JSON packets on
//! newline-framed streams, symmetric pairing with timeouts, and
//! capability-based dispatch of packets to services (notifications,
//! telephony, media control, ping). Transport, discovery, and TLS live
//! behind the [`connection`] boundary and are supplied by the embedding
//! application, as are the notification surface ([`presentation`]) and the
//! media player ([`services::media::MediaPlayerBridge`]).
//!
//! # Typical wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerlink_protocol::{
//!     Config, DeviceManager, NotificationPresenter, ServiceManager, SystemNotification,
//!     TimerTable,
//! };
//! use peerlink_protocol::services::{notifications::NotificationsService, ping::PingService};
//!
//! struct Presenter;
//! impl NotificationPresenter for Presenter {
//!     fn show(&self, _notification: &SystemNotification) {}
//!     fn hide(&self, _id: &str) {}
//! }
//!
//! # fn main() -> peerlink_protocol::Result<()> {
//! let presenter: Arc<dyn NotificationPresenter> = Arc::new(Presenter);
//! let (timers, timer_rx) = TimerTable::new();
//!
//! let mut services = ServiceManager::new();
//! services.register(Box::new(PingService::new(presenter.clone())))?;
//! services.register(Box::new(NotificationsService::new(presenter)))?;
//!
//! let manager = DeviceManager::new(Config::default(), services, timers, timer_rx);
//! let identity = manager.host_info();
//! // Hand `identity` to the connection provider and feed its
//! // ConnectionEvents plus fired timer keys back into `manager`.
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod packet;
pub mod pairing;
pub mod presentation;
pub mod scheduler;
pub mod services;

pub use config::Config;
pub use connection::{Connection, ConnectionEvent, ConnectionProvider};
pub use device::{Device, DeviceInfo, DeviceManager, DeviceType, IDENTITY_PACKET_TYPE};
pub use error::{ProtocolError, Result};
pub use packet::Packet;
pub use pairing::{PairingEvent, PairingHandler, PairingStatus, PAIRING_TIMEOUT, PAIR_PACKET_TYPE};
pub use presentation::{NotificationPresenter, SystemNotification};
pub use scheduler::TimerTable;
pub use services::{Service, ServiceAction, ServiceManager};

/// Protocol version advertised in the identity handshake.
pub const PROTOCOL_VERSION: u32 = 1;
