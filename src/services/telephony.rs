//! Telephony events and SMS reassembly.
//!
//! Phones report call state and incoming SMS as `peerlink.telephony`
//! events. Long SMS arrive split into several packets in quick succession;
//! the service buffers fragments per conversation and closes a burst after
//! a quiet period (default 5 s), delivering one merged notification
//! instead of a stack of partial ones. Each new fragment restarts the
//! window.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::presentation::{NotificationPresenter, SystemNotification};
use crate::scheduler::TimerTable;
use crate::services::notifications::encode_segment;
use crate::services::{Service, ServiceAction};

pub const TELEPHONY_PACKET_TYPE: &str = "peerlink.telephony";
pub const TELEPHONY_REQUEST_PACKET_TYPE: &str = "peerlink.telephony.request";
pub const SMS_REQUEST_PACKET_TYPE: &str = "peerlink.sms.request";

pub const SERVICE_ID: &str = "telephony";

/// Quiet period that closes an SMS fragment burst.
pub const SMS_DEBOUNCE: Duration = Duration::from_secs(5);

/// Presentation id for a device's call notification. One per device: a
/// newer call state replaces the older one.
fn call_id(device_id: &str) -> String {
    format!("{}.{}.call", SERVICE_ID, encode_segment(device_id))
}

/// Presentation id for SMS from one contact on one device.
fn sms_id(device_id: &str, phone_number: &str) -> String {
    format!(
        "{}.{}.sms.{}",
        SERVICE_ID,
        encode_segment(device_id),
        encode_segment(phone_number)
    )
}

fn sms_timer_key(conversation: &str) -> String {
    format!("sms.{}", conversation)
}

/// Sort fragments by packet id and concatenate their bodies into a packet
/// that keeps the latest fragment's metadata.
fn merge_fragments(mut fragments: Vec<Packet>) -> Option<Packet> {
    if fragments.is_empty() {
        return None;
    }
    fragments.sort_by_key(|p| p.id);
    let text: String = fragments
        .iter()
        .map(|p| {
            p.field::<String>("messageBody")
                .ok()
                .flatten()
                .unwrap_or_default()
        })
        .collect();
    let last = fragments.pop()?;
    Some(last.with_body_field("messageBody", text))
}

struct PendingSms {
    fragments: Vec<Packet>,
    device_id: String,
    device_name: String,
}

pub struct TelephonyService {
    presenter: Arc<dyn NotificationPresenter>,
    timers: TimerTable,
    debounce: Duration,
    /// conversation id -> buffered fragments awaiting the quiet period.
    pending_sms: HashMap<String, PendingSms>,
    /// device id -> notification ids this service put on screen.
    shown: HashMap<String, HashSet<String>>,
}

impl TelephonyService {
    pub fn new(presenter: Arc<dyn NotificationPresenter>, timers: TimerTable) -> Self {
        Self::with_debounce(presenter, timers, SMS_DEBOUNCE)
    }

    pub fn with_debounce(
        presenter: Arc<dyn NotificationPresenter>,
        timers: TimerTable,
        debounce: Duration,
    ) -> Self {
        Self {
            presenter,
            timers,
            debounce,
            pending_sms: HashMap::new(),
            shown: HashMap::new(),
        }
    }

    /// Ask the phone to silence the current ringer.
    pub fn mute_packet() -> Packet {
        Packet::new(TELEPHONY_REQUEST_PACKET_TYPE, json!({ "action": "mute" }))
    }

    pub fn sms_packet(phone_number: &str, message: &str) -> Packet {
        Packet::new(
            SMS_REQUEST_PACKET_TYPE,
            json!({
                "sendSms": true,
                "phoneNumber": phone_number,
                "messageBody": message,
            }),
        )
    }

    pub async fn mute_call(&self, device: &Device) -> Result<()> {
        device.send(&Self::mute_packet()).await
    }

    /// Send an SMS through the phone. The action surface advertises this;
    /// the embedding UI collects the inputs and calls here.
    pub async fn send_sms(&self, device: &Device, phone_number: &str, message: &str) -> Result<()> {
        device.send(&Self::sms_packet(phone_number, message)).await
    }

    pub fn pending_count(&self) -> usize {
        self.pending_sms.len()
    }

    fn show(&mut self, device_id: &str, notification: SystemNotification) {
        self.shown
            .entry(device_id.to_string())
            .or_default()
            .insert(notification.id.clone());
        self.presenter.show(&notification);
    }

    fn hide(&mut self, device_id: &str, id: &str) {
        if let Some(ids) = self.shown.get_mut(device_id) {
            ids.remove(id);
        }
        self.presenter.hide(id);
    }

    fn caller(packet: &Packet) -> String {
        packet
            .field::<String>("contactName")
            .ok()
            .flatten()
            .or_else(|| packet.field::<String>("phoneNumber").ok().flatten())
            .unwrap_or_else(|| "unknown number".to_string())
    }

    fn handle_event(&mut self, packet: &Packet, device: &mut Device) -> Result<()> {
        let event = packet.field::<String>("event")?.ok_or_else(|| {
            ProtocolError::InvalidPacket("telephony packet missing 'event' field".to_string())
        })?;

        if packet.flag("isCancel")? {
            if event != "sms" {
                let id = call_id(device.id());
                self.hide(device.id(), &id);
            }
            return Ok(());
        }

        match event.as_str() {
            "ringing" => {
                let caller = Self::caller(packet);
                let notification = SystemNotification::new(
                    call_id(device.id()),
                    device.name(),
                    format!("Incoming call from {}", caller),
                )
                .with_sound()
                .with_info("deviceId", device.id())
                .with_info("event", "ringing");
                self.show(device.id(), notification);
            }
            "talking" => {
                // Call was answered; the ringing notification is stale.
                let id = call_id(device.id());
                self.hide(device.id(), &id);
            }
            "missedCall" => {
                let caller = Self::caller(packet);
                let notification = SystemNotification::new(
                    call_id(device.id()),
                    device.name(),
                    format!("Missed call from {}", caller),
                )
                .with_info("deviceId", device.id())
                .with_info("event", "missedCall");
                self.show(device.id(), notification);
            }
            "sms" => self.buffer_sms(packet, device),
            other => debug!("Unknown telephony event '{}' from {}", other, device.id()),
        }
        Ok(())
    }

    fn buffer_sms(&mut self, packet: &Packet, device: &Device) {
        let phone = packet
            .field::<String>("phoneNumber")
            .ok()
            .flatten()
            .unwrap_or_else(|| "unknown".to_string());
        let conversation = sms_id(device.id(), &phone);
        let entry = self
            .pending_sms
            .entry(conversation.clone())
            .or_insert_with(|| PendingSms {
                fragments: Vec::new(),
                device_id: device.id().to_string(),
                device_name: device.name().to_string(),
            });
        entry.fragments.push(packet.clone());
        // Every fragment restarts the quiet period.
        self.timers
            .schedule(sms_timer_key(&conversation), self.debounce);
    }

    fn flush_sms(&mut self, conversation: &str) {
        let Some(pending) = self.pending_sms.remove(conversation) else {
            debug!("Stale SMS timer for '{}'", conversation);
            return;
        };
        let count = pending.fragments.len();
        let Some(merged) = merge_fragments(pending.fragments) else {
            return;
        };
        debug!(
            "Delivering SMS burst of {} fragment(s) for '{}'",
            count, conversation
        );
        let caller = Self::caller(&merged);
        let text = merged
            .field::<String>("messageBody")
            .ok()
            .flatten()
            .unwrap_or_default();
        let notification = SystemNotification::new(
            conversation.to_string(),
            format!("SMS from {} ({})", caller, pending.device_name),
            text,
        )
        .with_sound()
        .with_info("deviceId", pending.device_id.clone())
        .with_info("event", "sms");
        self.show(&pending.device_id, notification);
    }
}

#[async_trait]
impl Service for TelephonyService {
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
        vec![TELEPHONY_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![
            TELEPHONY_REQUEST_PACKET_TYPE.to_string(),
            SMS_REQUEST_PACKET_TYPE.to_string(),
        ]
    }

    async fn handle_packet(&mut self, packet: &Packet, device: &mut Device) -> Result<bool> {
        if !packet.is_type(TELEPHONY_PACKET_TYPE) {
            return Ok(false);
        }
        self.handle_event(packet, device)?;
        Ok(true)
    }

    async fn handle_timer(&mut self, key: &str) -> Result<()> {
        if let Some(conversation) = key.strip_prefix("sms.") {
            let conversation = conversation.to_string();
            self.flush_sms(&conversation);
        }
        Ok(())
    }

    /// Drop buffered fragments and retract notifications for the device.
    async fn cleanup(&mut self, device: &Device) -> Result<()> {
        let device_prefix = format!("{}.{}.", SERVICE_ID, encode_segment(device.id()));
        self.pending_sms
            .retain(|conversation, _| !conversation.starts_with(&device_prefix));
        self.timers
            .cancel_prefix(&format!("sms.{}", device_prefix));
        if let Some(ids) = self.shown.remove(device.id()) {
            for id in ids {
                self.presenter.hide(&id);
            }
        }
        Ok(())
    }

    fn actions(&self, device: &Device) -> Vec<ServiceAction> {
        if !device.is_paired() || !device.has_incoming_capability(SMS_REQUEST_PACKET_TYPE) {
            return Vec::new();
        }
        vec![ServiceAction::new(
            "send-sms",
            SERVICE_ID,
            device.id(),
            "Send SMS",
        )]
    }

    async fn perform_action(&mut self, action_id: &str, _device: &mut Device) -> Result<()> {
        match action_id {
            // The UI collects recipient and text, then calls send_sms.
            "send-sms" => Ok(()),
            other => Err(ProtocolError::Service(format!(
                "unknown action: {}",
                other
            ))),
        }
    }
}
