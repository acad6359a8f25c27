//! Notification mirroring.
//!
//! Peers push their notifications as `peerlink.notification` packets and
//! retract them with the `isCancel` flag. Everything shown locally is
//! tracked in a per-device ledger of composite ids so that an unpair or
//! disconnect can retract exactly what this service put on screen, and a
//! redelivered id replaces its previous presentation.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::presentation::{NotificationPresenter, SystemNotification};
use crate::services::Service;

pub const NOTIFICATION_PACKET_TYPE: &str = "peerlink.notification";
pub const NOTIFICATION_REQUEST_PACKET_TYPE: &str = "peerlink.notification.request";
pub const NOTIFICATION_ACTION_PACKET_TYPE: &str = "peerlink.notification.action";
pub const NOTIFICATION_REPLY_PACKET_TYPE: &str = "peerlink.notification.reply";

pub const SERVICE_ID: &str = "notifications";

/// App name the peer's own mirror client reports. Its notifications are
/// echoes of ours and are never presented.
pub const MIRROR_APP_NAME: &str = "Peerlink";

/// Percent-encode a composite-id segment down to `[A-Za-z0-9]` + escapes,
/// so the `.` separators can never collide with segment content.
pub(crate) fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

/// Globally unique presentation id for one peer notification.
pub(crate) fn composite_id(service_id: &str, device_id: &str, packet_id: &str) -> String {
    format!(
        "{}.{}.{}",
        service_id,
        encode_segment(device_id),
        encode_segment(packet_id)
    )
}

/// Body of an incoming notification packet.
#[derive(Debug, Clone, Deserialize)]
struct NotificationBody {
    id: String,
    #[serde(rename = "appName", default)]
    app_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(rename = "isClearable", default)]
    is_clearable: bool,
    #[serde(default)]
    silent: bool,
    #[serde(rename = "requestReplyId", default)]
    request_reply_id: Option<String>,
}

pub struct NotificationsService {
    presenter: Arc<dyn NotificationPresenter>,
    /// device id -> composite ids currently presented for it.
    ledger: HashMap<String, HashSet<String>>,
}

impl NotificationsService {
    pub fn new(presenter: Arc<dyn NotificationPresenter>) -> Self {
        Self {
            presenter,
            ledger: HashMap::new(),
        }
    }

    /// Ask a peer to (re)send its current notifications.
    pub fn request_packet() -> Packet {
        Packet::new(NOTIFICATION_REQUEST_PACKET_TYPE, json!({ "request": true }))
    }

    /// Dismiss a notification on the peer.
    pub fn dismiss_packet(peer_notification_id: &str) -> Packet {
        Packet::new(
            NOTIFICATION_REQUEST_PACKET_TYPE,
            json!({ "cancel": peer_notification_id }),
        )
    }

    /// Trigger a button of a peer notification.
    pub fn action_packet(peer_notification_id: &str, action: &str) -> Packet {
        Packet::new(
            NOTIFICATION_ACTION_PACKET_TYPE,
            json!({ "key": peer_notification_id, "action": action }),
        )
    }

    /// Send an inline reply to a peer notification that offered one.
    pub fn reply_packet(request_reply_id: &str, message: &str) -> Packet {
        Packet::new(
            NOTIFICATION_REPLY_PACKET_TYPE,
            json!({ "requestReplyId": request_reply_id, "message": message }),
        )
    }

    pub async fn dismiss(&self, device: &Device, peer_notification_id: &str) -> Result<()> {
        device.send(&Self::dismiss_packet(peer_notification_id)).await
    }

    pub async fn reply(&self, device: &Device, request_reply_id: &str, message: &str) -> Result<()> {
        device
            .send(&Self::reply_packet(request_reply_id, message))
            .await
    }

    /// Ids currently presented for a device. Test and introspection hook.
    pub fn presented_for(&self, device_id: &str) -> usize {
        self.ledger.get(device_id).map(HashSet::len).unwrap_or(0)
    }

    fn remember(&mut self, device_id: &str, id: String) {
        self.ledger.entry(device_id.to_string()).or_default().insert(id);
    }

    fn forget(&mut self, device_id: &str, id: &str) -> bool {
        match self.ledger.get_mut(device_id) {
            Some(ids) => ids.remove(id),
            None => false,
        }
    }

    fn handle_notification(&mut self, packet: &Packet, device: &mut Device) -> Result<()> {
        let body: NotificationBody = serde_json::from_value(packet.body.clone())
            .map_err(|e| ProtocolError::InvalidPacket(format!("notification body: {}", e)))?;
        let id = composite_id(SERVICE_ID, device.id(), &body.id);

        if packet.flag("isCancel")? {
            if self.forget(device.id(), &id) {
                self.presenter.hide(&id);
            }
            return Ok(());
        }

        if body.silent {
            debug!("Silent notification {} from {}", body.id, device.id());
            return Ok(());
        }

        if body.app_name.as_deref() == Some(MIRROR_APP_NAME) {
            debug!("Skipping mirror-client notification from {}", device.id());
            return Ok(());
        }

        // Redelivery of a known id replaces the presentation.
        if self.forget(device.id(), &id) {
            self.presenter.hide(&id);
        }

        let title = body
            .app_name
            .clone()
            .unwrap_or_else(|| device.name().to_string());
        let text = match (&body.ticker, &body.title, &body.text) {
            (Some(ticker), _, _) => ticker.clone(),
            (None, Some(title), Some(text)) => format!("{}: {}", title, text),
            (None, Some(title), None) => title.clone(),
            (None, None, Some(text)) => text.clone(),
            (None, None, None) => String::new(),
        };

        let mut notification = SystemNotification::new(id.clone(), title, text)
            .with_info("deviceId", device.id())
            .with_info("notificationId", body.id.clone())
            .with_info("isClearable", body.is_clearable.to_string());
        if let Some(reply_id) = &body.request_reply_id {
            notification = notification.with_info("requestReplyId", reply_id.clone());
        }
        self.presenter.show(&notification);
        self.remember(device.id(), id);
        Ok(())
    }
}

#[async_trait]
impl Service for NotificationsService {
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
        vec![
            NOTIFICATION_PACKET_TYPE.to_string(),
            NOTIFICATION_REQUEST_PACKET_TYPE.to_string(),
        ]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![
            NOTIFICATION_REQUEST_PACKET_TYPE.to_string(),
            NOTIFICATION_ACTION_PACKET_TYPE.to_string(),
            NOTIFICATION_REPLY_PACKET_TYPE.to_string(),
        ]
    }

    /// Ask the peer for its existing notifications as soon as we pair.
    async fn setup(&mut self, device: &Device) -> Result<()> {
        if device.has_incoming_capability(NOTIFICATION_REQUEST_PACKET_TYPE) {
            device.send(&Self::request_packet()).await?;
        }
        Ok(())
    }

    /// Retract everything this device put on screen.
    async fn cleanup(&mut self, device: &Device) -> Result<()> {
        if let Some(ids) = self.ledger.remove(device.id()) {
            for id in ids {
                self.presenter.hide(&id);
            }
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet, device: &mut Device) -> Result<bool> {
        if packet.is_type(NOTIFICATION_REQUEST_PACKET_TYPE) {
            // The desktop has no notification backlog to replay; the
            // peer's request is acknowledged by accepting the packet.
            debug!("Peer {} requested our notifications", device.id());
            return Ok(true);
        }
        if !packet.is_type(NOTIFICATION_PACKET_TYPE) {
            return Ok(false);
        }
        self.handle_notification(packet, device)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{connected_device, sent_types};
    use crate::presentation::testing::RecordingPresenter;

    fn notification_packet(id: &str, app: &str, ticker: &str) -> Packet {
        Packet::new(
            NOTIFICATION_PACKET_TYPE,
            json!({ "id": id, "appName": app, "ticker": ticker, "isClearable": true }),
        )
    }

    #[test]
    fn test_composite_ids_collision_free() {
        // Dots inside segments must not be confusable with separators.
        let a = composite_id(SERVICE_ID, "a.b", "c");
        let b = composite_id(SERVICE_ID, "a", "b.c");
        assert_ne!(a, b);
        assert!(a.contains("a%2Eb"));
    }

    #[tokio::test]
    async fn test_show_and_ledger() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        let packet = notification_packet("42", "Mail", "New message");
        assert!(service.handle_packet(&packet, &mut device).await.unwrap());
        assert_eq!(service.presented_for("dev1"), 1);

        let shown = presenter.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Mail");
        assert_eq!(shown[0].body, "New message");
        assert_eq!(shown[0].user_info["notificationId"], "42");
    }

    #[tokio::test]
    async fn test_cancel_hides_and_forgets() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        let packet = notification_packet("42", "Mail", "New message");
        service.handle_packet(&packet, &mut device).await.unwrap();

        let cancel = Packet::new(
            NOTIFICATION_PACKET_TYPE,
            json!({ "id": "42", "isCancel": true }),
        );
        service.handle_packet(&cancel, &mut device).await.unwrap();
        assert_eq!(service.presented_for("dev1"), 0);
        assert_eq!(presenter.hidden.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_for_unknown_id_is_silent() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        let cancel = Packet::new(
            NOTIFICATION_PACKET_TYPE,
            json!({ "id": "ghost", "isCancel": true }),
        );
        service.handle_packet(&cancel, &mut device).await.unwrap();
        assert!(presenter.hidden.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_replaces() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        service
            .handle_packet(&notification_packet("42", "Mail", "first"), &mut device)
            .await
            .unwrap();
        service
            .handle_packet(&notification_packet("42", "Mail", "second"), &mut device)
            .await
            .unwrap();

        assert_eq!(service.presented_for("dev1"), 1);
        assert_eq!(presenter.shown.lock().unwrap().len(), 2);
        assert_eq!(presenter.hidden.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_notifications_not_shown() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        let packet = Packet::new(
            NOTIFICATION_PACKET_TYPE,
            json!({ "id": "42", "appName": "Mail", "silent": true }),
        );
        service.handle_packet(&packet, &mut device).await.unwrap();
        assert!(presenter.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mirror_client_notifications_skipped() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");

        let echo = notification_packet("42", MIRROR_APP_NAME, "echo of our own");
        assert!(service.handle_packet(&echo, &mut device).await.unwrap());
        assert!(presenter.shown.lock().unwrap().is_empty());
        assert_eq!(service.presented_for("dev1"), 0);
    }

    #[tokio::test]
    async fn test_peer_request_acknowledged_without_effect() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, outbox) = connected_device("dev1");

        let request = Packet::new(NOTIFICATION_REQUEST_PACKET_TYPE, json!({ "request": true }));
        assert!(service.handle_packet(&request, &mut device).await.unwrap());
        assert!(presenter.shown.lock().unwrap().is_empty());
        assert!(sent_types(&outbox).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_retracts_everything() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter.clone());
        let (mut device, _outbox) = connected_device("dev1");
        let (mut other, _other_outbox) = connected_device("dev2");

        service
            .handle_packet(&notification_packet("1", "Mail", "a"), &mut device)
            .await
            .unwrap();
        service
            .handle_packet(&notification_packet("2", "Mail", "b"), &mut device)
            .await
            .unwrap();
        service
            .handle_packet(&notification_packet("1", "Mail", "c"), &mut other)
            .await
            .unwrap();

        service.cleanup(&device).await.unwrap();
        assert_eq!(service.presented_for("dev1"), 0);
        assert_eq!(service.presented_for("dev2"), 1);
        assert_eq!(presenter.hidden.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_setup_requests_existing_notifications() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter);
        let (device, outbox) = connected_device("dev1");

        service.setup(&device).await.unwrap();
        assert_eq!(
            sent_types(&outbox),
            vec![NOTIFICATION_REQUEST_PACKET_TYPE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_error() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut service = NotificationsService::new(presenter);
        let (mut device, _outbox) = connected_device("dev1");

        // Missing the mandatory id.
        let packet = Packet::new(NOTIFICATION_PACKET_TYPE, json!({ "appName": "Mail" }));
        assert!(service.handle_packet(&packet, &mut device).await.is_err());
    }

    #[tokio::test]
    async fn test_outgoing_packet_shapes() {
        let dismiss = NotificationsService::dismiss_packet("42");
        assert_eq!(dismiss.field::<String>("cancel").unwrap().unwrap(), "42");

        let action = NotificationsService::action_packet("42", "Archive");
        assert!(action.is_type(NOTIFICATION_ACTION_PACKET_TYPE));
        assert_eq!(action.field::<String>("action").unwrap().unwrap(), "Archive");

        let reply = NotificationsService::reply_packet("uuid-1", "on my way");
        assert!(reply.is_type(NOTIFICATION_REPLY_PACKET_TYPE));
        assert_eq!(
            reply.field::<String>("message").unwrap().unwrap(),
            "on my way"
        );
    }
}
