//! Ping service.
//!
//! The smallest capability family: a peer sends `peerlink.ping`, we show a
//! notification. Mostly useful for verifying that pairing and dispatch
//! work end to end.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::packet::Packet;
use crate::presentation::{NotificationPresenter, SystemNotification};
use crate::services::{Service, ServiceAction};

pub const PING_PACKET_TYPE: &str = "peerlink.ping";

pub const SERVICE_ID: &str = "ping";

pub struct PingService {
    presenter: Arc<dyn NotificationPresenter>,
    ping_count: u64,
}

impl PingService {
    pub fn new(presenter: Arc<dyn NotificationPresenter>) -> Self {
        Self {
            presenter,
            ping_count: 0,
        }
    }

    pub fn ping_count(&self) -> u64 {
        self.ping_count
    }

    /// Build an outgoing ping, optionally carrying a message.
    pub fn ping_packet(message: Option<&str>) -> Packet {
        let mut packet = Packet::new(PING_PACKET_TYPE, json!({}));
        if let Some(message) = message {
            packet = packet.with_body_field("message", message);
        }
        packet
    }

    pub async fn send_ping(&self, device: &Device, message: Option<&str>) -> Result<()> {
        device.send(&Self::ping_packet(message)).await
    }
}

#[async_trait]
impl Service for PingService {
    fn id(&self) -> &'static str {
        SERVICE_ID
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PING_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PING_PACKET_TYPE.to_string()]
    }

    async fn handle_packet(&mut self, packet: &Packet, device: &mut Device) -> Result<bool> {
        if !packet.is_type(PING_PACKET_TYPE) {
            return Ok(false);
        }
        self.ping_count += 1;
        let message = packet
            .field::<String>("message")?
            .unwrap_or_else(|| "Ping!".to_string());
        debug!("Ping from {}: {}", device.id(), message);
        let notification = SystemNotification::new(
            format!("{}.{}", SERVICE_ID, device.id()),
            device.name(),
            message,
        )
        .with_sound()
        .with_info("deviceId", device.id());
        self.presenter.show(&notification);
        Ok(true)
    }

    fn actions(&self, device: &Device) -> Vec<ServiceAction> {
        if !device.is_paired() || !device.has_incoming_capability(PING_PACKET_TYPE) {
            return Vec::new();
        }
        vec![ServiceAction::new(
            "send-ping",
            SERVICE_ID,
            device.id(),
            "Send Ping",
        )]
    }

    async fn perform_action(&mut self, action_id: &str, device: &mut Device) -> Result<()> {
        match action_id {
            "send-ping" => self.send_ping(device, None).await,
            other => Err(crate::error::ProtocolError::Service(format!(
                "unknown action: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{connected_device, sent_types};
    use crate::pairing::PairingStatus;
    use crate::presentation::testing::RecordingPresenter;

    #[tokio::test]
    async fn test_ping_shows_notification() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = PingService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        let packet = PingService::ping_packet(Some("hello"));
        let handled = service.handle_packet(&packet, &mut device).await.unwrap();
        assert!(handled);
        assert_eq!(service.ping_count(), 1);

        let shown = presenter.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].body, "hello");
        assert_eq!(shown[0].title, "dev1-name");
    }

    #[tokio::test]
    async fn test_other_types_ignored() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = PingService::new(presenter);
        let (mut device, _outbox) = connected_device("dev1");

        let packet = Packet::new("peerlink.notification", json!({}));
        let handled = service.handle_packet(&packet, &mut device).await.unwrap();
        assert!(!handled);
        assert_eq!(service.ping_count(), 0);
    }

    #[tokio::test]
    async fn test_send_ping_action() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = PingService::new(presenter);
        let (mut device, outbox) = connected_device("dev1");
        device.set_pairing_status(PairingStatus::Paired).unwrap();

        let actions = service.actions(&device);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, "send-ping");

        service.perform_action("send-ping", &mut device).await.unwrap();
        assert_eq!(sent_types(&outbox), vec![PING_PACKET_TYPE.to_string()]);
    }
}
