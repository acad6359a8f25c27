//! Devices and the device manager.
//!
//! A [`Device`] is a remote peer: its advertised identity, its pairing
//! state, and (while reachable) a live [`Connection`]. The
//! [`DeviceManager`] owns all devices and is the single dispatch path for
//! the process: connection events, inbound packets, and timer firings all
//! funnel through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::pairing::{PairingEvent, PairingHandler, PairingStatus, PAIR_PACKET_TYPE};
use crate::scheduler::TimerTable;
use crate::services::{ServiceAction, ServiceManager};
use crate::PROTOCOL_VERSION;

/// Packet type of the identity exchange performed by connection providers.
pub const IDENTITY_PACKET_TYPE: &str = "peerlink.identity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Unknown,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Identity a peer advertises during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub device_type: DeviceType,
    pub protocol_version: u32,
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,
}

impl DeviceInfo {
    /// Render this identity as an identity packet for the handshake
    /// boundary.
    pub fn identity_packet(&self) -> Result<Packet> {
        let body = serde_json::to_value(self)?;
        Ok(Packet::new(IDENTITY_PACKET_TYPE, body))
    }

    /// Parse a peer identity out of a received identity packet.
    pub fn from_identity(packet: &Packet) -> Result<Self> {
        if !packet.is_type(IDENTITY_PACKET_TYPE) {
            return Err(ProtocolError::InvalidPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type
            )));
        }
        let info: DeviceInfo = serde_json::from_value(packet.body.clone())?;
        if info.device_id.is_empty() {
            return Err(ProtocolError::InvalidPacket(
                "identity with empty device id".to_string(),
            ));
        }
        Ok(info)
    }
}

/// A known remote peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(flatten)]
    info: DeviceInfo,
    #[serde(skip)]
    pairing_status: PairingStatus,
    #[serde(default = "Utc::now")]
    last_seen: DateTime<Utc>,
    #[serde(skip)]
    connection: Option<Arc<dyn Connection>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.info.device_id)
            .field("name", &self.info.device_name)
            .field("pairing_status", &self.pairing_status)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl Device {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            pairing_status: PairingStatus::Unpaired,
            last_seen: Utc::now(),
            connection: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    pub fn name(&self) -> &str {
        &self.info.device_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.info.device_type
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Refresh the advertised identity (capabilities can change between
    /// connections).
    pub fn update_info(&mut self, info: DeviceInfo) {
        self.info = info;
    }

    pub fn pairing_status(&self) -> PairingStatus {
        self.pairing_status
    }

    pub fn is_paired(&self) -> bool {
        self.pairing_status == PairingStatus::Paired
    }

    /// Change pairing state. A device without a live connection can never
    /// become `Paired`.
    pub fn set_pairing_status(&mut self, status: PairingStatus) -> Result<()> {
        if status == PairingStatus::Paired && self.connection.is_none() {
            return Err(ProtocolError::InvalidState(format!(
                "device {} cannot pair without a connection",
                self.id()
            )));
        }
        self.pairing_status = status;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Handle for services that need to send outside a dispatch callback
    /// (e.g. media broadcasts).
    pub fn connection_handle(&self) -> Option<Arc<dyn Connection>> {
        self.connection.clone()
    }

    pub fn mark_connected(&mut self, connection: Arc<dyn Connection>) {
        self.connection = Some(connection);
        self.touch();
    }

    /// Drop the connection. Pairing does not outlive it.
    pub fn mark_disconnected(&mut self) {
        self.connection = None;
        self.pairing_status = PairingStatus::Unpaired;
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        match &self.connection {
            Some(connection) => connection.send(packet).await,
            None => Err(ProtocolError::NotConnected),
        }
    }

    pub fn has_incoming_capability(&self, capability: &str) -> bool {
        self.info
            .incoming_capabilities
            .iter()
            .any(|c| c == capability)
    }

    pub fn has_outgoing_capability(&self, capability: &str) -> bool {
        self.info
            .outgoing_capabilities
            .iter()
            .any(|c| c == capability)
    }
}

/// Owns all known devices and routes every packet and timer firing.
pub struct DeviceManager {
    config: Config,
    devices: HashMap<String, Device>,
    services: ServiceManager,
    pairing: PairingHandler,
    timer_rx: mpsc::UnboundedReceiver<String>,
    pairing_events: Option<mpsc::UnboundedReceiver<PairingEvent>>,
}

impl DeviceManager {
    /// `timers` must be the same table handed to timer-using services so
    /// their firings arrive on `timer_rx`.
    pub fn new(
        config: Config,
        services: ServiceManager,
        timers: TimerTable,
        timer_rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let (pairing_tx, pairing_rx) = mpsc::unbounded_channel();
        let pairing = PairingHandler::new(config.pairing_timeout(), timers, pairing_tx);
        Self {
            config,
            devices: HashMap::new(),
            services,
            pairing,
            timer_rx,
            pairing_events: Some(pairing_rx),
        }
    }

    /// Channel of pairing transitions, for the embedding UI. Can be taken
    /// once.
    pub fn take_pairing_events(&mut self) -> Option<mpsc::UnboundedReceiver<PairingEvent>> {
        self.pairing_events.take()
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceManager {
        &mut self.services
    }

    /// The host's own identity, with capabilities aggregated from the
    /// registered services.
    pub fn host_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.config.device.id.clone(),
            device_name: self.config.device.name.clone(),
            device_type: match self.config.device.device_type.as_str() {
                "laptop" => DeviceType::Laptop,
                "phone" => DeviceType::Phone,
                "tablet" => DeviceType::Tablet,
                "desktop" => DeviceType::Desktop,
                _ => DeviceType::Unknown,
            },
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: self.services.incoming_capabilities(),
            outgoing_capabilities: self.services.outgoing_capabilities(),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn paired_devices(&self) -> Vec<&Device> {
        self.devices.values().filter(|d| d.is_paired()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Entry point for provider notifications.
    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) -> Result<()> {
        match event {
            ConnectionEvent::Connected { info, connection } => {
                self.device_connected(info, connection);
                Ok(())
            }
            ConnectionEvent::PacketReceived { device_id, packet } => {
                self.handle_packet(&device_id, packet).await
            }
            ConnectionEvent::Disconnected { device_id } => {
                self.device_disconnected(&device_id).await
            }
        }
    }

    /// A peer completed the handshake. Creates or refreshes the device
    /// entry.
    pub fn device_connected(&mut self, info: DeviceInfo, connection: Arc<dyn Connection>) {
        let device_id = info.device_id.clone();
        let device = self
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| Device::new(info.clone()));
        device.update_info(info);
        device.mark_connected(connection);
        info!("Device connected: {} ({})", device.name(), device_id);
    }

    /// The link to a peer dropped: tear down pairing and service state.
    pub async fn device_disconnected(&mut self, device_id: &str) -> Result<()> {
        let device = match self.devices.get_mut(device_id) {
            Some(device) => device,
            None => {
                debug!("Disconnect for unknown device {}", device_id);
                return Ok(());
            }
        };
        if device.is_paired() {
            self.services.device_removed(device).await;
        }
        self.pairing.connection_lost(device)?;
        device.mark_disconnected();
        info!("Device disconnected: {}", device_id);
        Ok(())
    }

    /// Route one inbound packet: pairing traffic to the pairing handler,
    /// everything else through service dispatch (paired devices only).
    pub async fn handle_packet(&mut self, device_id: &str, packet: Packet) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        device.touch();

        if packet.is_type(PAIR_PACKET_TYPE) {
            let was_paired = device.is_paired();
            self.pairing.handle_packet(device, &packet).await?;
            if !was_paired && device.is_paired() {
                self.services.device_paired(device).await;
            } else if was_paired && !device.is_paired() {
                self.services.device_removed(device).await;
            }
            return Ok(());
        }

        if !device.is_paired() {
            debug!(
                "Dropping {} from unpaired device {}",
                packet.packet_type, device_id
            );
            return Ok(());
        }
        self.services.dispatch(&packet, device).await;
        Ok(())
    }

    /// Consume one fired timer key. `pair.*` keys resolve pairing
    /// timeouts; everything else is offered to the services.
    pub async fn handle_timer(&mut self, key: &str) -> Result<()> {
        if let Some(device_id) = key.strip_prefix("pair.") {
            if let Some(device) = self.devices.get_mut(device_id) {
                self.pairing.handle_timeout(device)?;
            } else {
                debug!("Pairing timeout for unknown device {}", device_id);
            }
            return Ok(());
        }
        self.services.handle_timer(key).await;
        Ok(())
    }

    /// Await the next timer firing. The embedding loop selects over this
    /// and the provider's events.
    pub async fn next_timer_key(&mut self) -> Option<String> {
        self.timer_rx.recv().await
    }

    pub async fn request_pairing(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        // A local request while the peer's request is pending resolves the
        // pairing immediately, so this path can reach Paired too.
        let was_paired = device.is_paired();
        self.pairing.request_pairing(device).await?;
        if !was_paired && device.is_paired() {
            self.services.device_paired(device).await;
        }
        Ok(())
    }

    pub async fn accept_pairing(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        let was_paired = device.is_paired();
        self.pairing.accept_pairing(device).await?;
        if !was_paired && device.is_paired() {
            self.services.device_paired(device).await;
        }
        Ok(())
    }

    pub async fn decline_pairing(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        self.pairing.decline_pairing(device).await
    }

    pub async fn unpair(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        let was_paired = device.is_paired();
        self.pairing.unpair(device).await?;
        if was_paired {
            self.services.device_removed(device).await;
        }
        Ok(())
    }

    /// Actions the registered services currently offer for a device.
    pub fn actions_for(&self, device_id: &str) -> Vec<ServiceAction> {
        match self.devices.get(device_id) {
            Some(device) => self.services.actions_for(device),
            None => Vec::new(),
        }
    }

    pub async fn perform_action(
        &mut self,
        device_id: &str,
        service_id: &str,
        action_id: &str,
    ) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        self.services
            .perform_action(service_id, action_id, device)
            .await
    }

    /// Persist the known-device registry. Connections and pairing state
    /// are runtime-only and not written.
    pub fn save_registry(&self) -> Result<()> {
        self.save_registry_to(&self.config.paths.device_registry)
    }

    pub fn save_registry_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let devices: Vec<&Device> = self.devices.values().collect();
        let json = serde_json::to_string_pretty(&devices)?;
        std::fs::write(path, json)?;
        debug!("Saved {} devices to registry", devices.len());
        Ok(())
    }

    /// Load previously seen devices. They come back unpaired and
    /// disconnected; trust is re-established by pairing again.
    pub fn load_registry(&mut self) -> Result<usize> {
        let path = self.config.paths.device_registry.clone();
        self.load_registry_from(&path)
    }

    pub fn load_registry_from(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let json = std::fs::read_to_string(path)?;
        let devices: Vec<Device> = serde_json::from_str(&json)?;
        let count = devices.len();
        for device in devices {
            self.devices.insert(device.id().to_string(), device);
        }
        info!("Loaded {} known devices from registry", count);
        Ok(count)
    }

    /// Drop devices not seen for `max_age`. Paired or connected devices
    /// are kept regardless.
    pub fn prune_stale_devices(&mut self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.devices.len();
        self.devices
            .retain(|_, d| d.is_paired() || d.is_connected() || d.last_seen() > cutoff);
        let removed = before - self.devices.len();
        if removed > 0 {
            info!("Pruned {} stale devices", removed);
        }
        removed
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let info = device_info("dev1");
        let packet = info.identity_packet().unwrap();
        assert!(packet.is_type(IDENTITY_PACKET_TYPE));
        let parsed = DeviceInfo::from_identity(&packet).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_identity_rejects_wrong_type() {
        let packet = Packet::new("peerlink.ping", serde_json::json!({}));
        assert!(DeviceInfo::from_identity(&packet).is_err());
    }

    #[test]
    fn test_cannot_pair_without_connection() {
        let mut device = Device::new(device_info("dev1"));
        let result = device.set_pairing_status(PairingStatus::Paired);
        assert!(matches!(result, Err(ProtocolError::InvalidState(_))));
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
    }

    #[test]
    fn test_disconnect_clears_pairing() {
        let (mut device, _outbox) = connected_device("dev1");
        device.set_pairing_status(PairingStatus::Paired).unwrap();
        device.mark_disconnected();
        assert!(!device.is_connected());
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let device = Device::new(device_info("dev1"));
        let packet = Packet::new("peerlink.ping", serde_json::json!({}));
        assert!(matches!(
            device.send(&packet).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_capability_queries() {
        let device = Device::new(device_info("dev1"));
        assert!(device.has_outgoing_capability("peerlink.notification"));
        assert!(device.has_incoming_capability("peerlink.sms.request"));
        assert!(!device.has_incoming_capability("peerlink.clipboard"));
    }

    fn manager() -> DeviceManager {
        let (timers, timer_rx) = crate::scheduler::TimerTable::new();
        DeviceManager::new(
            Config::default(),
            ServiceManager::new(),
            timers,
            timer_rx,
        )
    }

    #[tokio::test]
    async fn test_manager_connect_and_disconnect() {
        let mut manager = manager();
        let outbox = Arc::new(MockConnection::default());
        manager.device_connected(device_info("dev1"), outbox);
        assert_eq!(manager.device_count(), 1);
        assert!(manager.device("dev1").unwrap().is_connected());

        manager.device_disconnected("dev1").await.unwrap();
        assert!(!manager.device("dev1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_unknown_device_packet_errors() {
        let mut manager = manager();
        let packet = Packet::new("peerlink.ping", serde_json::json!({}));
        assert!(matches!(
            manager.handle_packet("ghost", packet).await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_round_trip_resets_runtime_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        let mut manager = manager();
        let outbox = Arc::new(MockConnection::default());
        manager.device_connected(device_info("dev1"), outbox);
        manager.request_pairing("dev1").await.unwrap();
        manager
            .handle_packet("dev1", crate::pairing::PairingPacket::accept())
            .await
            .unwrap();
        assert!(manager.device("dev1").unwrap().is_paired());
        manager.save_registry_to(&path).unwrap();

        let mut restored = self::manager();
        assert_eq!(restored.load_registry_from(&path).unwrap(), 1);
        let device = restored.device("dev1").unwrap();
        assert_eq!(device.name(), "dev1-name");
        assert!(!device.is_connected());
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
    }

    #[tokio::test]
    async fn test_prune_keeps_paired() {
        let mut manager = manager();
        let outbox = Arc::new(MockConnection::default());
        manager.device_connected(device_info("dev1"), outbox);
        assert_eq!(manager.prune_stale_devices(chrono::Duration::zero()), 0);
    }
}
