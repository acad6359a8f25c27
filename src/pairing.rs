//! Pairing state machine.
//!
//! Pairing is symmetric: either side may request, the other accepts or
//! declines, and an unanswered request times out. All pairing traffic uses
//! a single packet type with a boolean body:
//!
//! ```json
//! {"id":...,"type":"peerlink.pair","body":{"pair":true}}
//! ```
//!
//! Per-device state lives on the [`Device`]; the process-wide
//! [`PairingHandler`] drives transitions, owns the timeout timers (one per
//! device, keyed `pair.<device-id>` in the shared [`TimerTable`]), and
//! reports transitions on an event channel for the embedding UI.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::scheduler::TimerTable;

/// Packet type for all pairing traffic.
pub const PAIR_PACKET_TYPE: &str = "peerlink.pair";

/// Default lifetime of an unanswered pairing request.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// No trust relationship and nothing pending.
    #[default]
    Unpaired,
    /// We sent a request and are waiting for the peer's answer.
    RequestedByLocal,
    /// The peer sent a request and is waiting for ours.
    RequestedByPeer,
    /// Both sides accepted.
    Paired,
}

impl PairingStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PairingStatus::RequestedByLocal | PairingStatus::RequestedByPeer
        )
    }
}

/// Constructors for the four pairing packets.
pub struct PairingPacket;

impl PairingPacket {
    pub fn request() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": true }))
    }

    pub fn accept() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": true }))
    }

    pub fn reject() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": false }))
    }

    pub fn unpair() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": false }))
    }
}

/// Transition notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    RequestSent { device_id: String },
    RequestReceived { device_id: String, device_name: String },
    Paired { device_id: String },
    Declined { device_id: String },
    Timeout { device_id: String },
    Unpaired { device_id: String },
}

/// Timer key for a device's pending pairing request.
pub fn pairing_timer_key(device_id: &str) -> String {
    format!("pair.{}", device_id)
}

/// Drives pairing transitions for all devices.
pub struct PairingHandler {
    timeout: Duration,
    timers: TimerTable,
    events: mpsc::UnboundedSender<PairingEvent>,
}

impl PairingHandler {
    pub fn new(
        timeout: Duration,
        timers: TimerTable,
        events: mpsc::UnboundedSender<PairingEvent>,
    ) -> Self {
        Self {
            timeout,
            timers,
            events,
        }
    }

    fn emit(&self, event: PairingEvent) {
        // Receiver gone means nobody is observing pairing; fine.
        let _ = self.events.send(event);
    }

    /// Start a locally-initiated pairing request.
    pub async fn request_pairing(&self, device: &mut Device) -> Result<()> {
        match device.pairing_status() {
            PairingStatus::Unpaired => {
                device.send(&PairingPacket::request()).await?;
                device.set_pairing_status(PairingStatus::RequestedByLocal)?;
                self.timers.schedule(pairing_timer_key(device.id()), self.timeout);
                info!("Pairing requested with device {}", device.id());
                self.emit(PairingEvent::RequestSent {
                    device_id: device.id().to_string(),
                });
                Ok(())
            }
            // Both sides want to pair; treat our request as the acceptance.
            PairingStatus::RequestedByPeer => self.accept_pairing(device).await,
            PairingStatus::RequestedByLocal => {
                debug!("Pairing already requested with {}, ignoring", device.id());
                Ok(())
            }
            PairingStatus::Paired => {
                debug!("Device {} already paired", device.id());
                Ok(())
            }
        }
    }

    /// Accept a peer's pending request. A no-op in any other state, so a
    /// second acceptance (or one racing a timeout) is harmless.
    pub async fn accept_pairing(&self, device: &mut Device) -> Result<()> {
        if device.pairing_status() != PairingStatus::RequestedByPeer {
            debug!(
                "Ignoring pairing acceptance for {} in state {:?}",
                device.id(),
                device.pairing_status()
            );
            return Ok(());
        }
        device.send(&PairingPacket::accept()).await?;
        self.timers.cancel(&pairing_timer_key(device.id()));
        device.set_pairing_status(PairingStatus::Paired)?;
        info!("Paired with device {}", device.id());
        self.emit(PairingEvent::Paired {
            device_id: device.id().to_string(),
        });
        Ok(())
    }

    /// Decline a peer's pending request. Idempotent like acceptance.
    pub async fn decline_pairing(&self, device: &mut Device) -> Result<()> {
        if device.pairing_status() != PairingStatus::RequestedByPeer {
            debug!(
                "Ignoring pairing decline for {} in state {:?}",
                device.id(),
                device.pairing_status()
            );
            return Ok(());
        }
        device.send(&PairingPacket::reject()).await?;
        self.timers.cancel(&pairing_timer_key(device.id()));
        device.set_pairing_status(PairingStatus::Unpaired)?;
        info!("Declined pairing with device {}", device.id());
        self.emit(PairingEvent::Declined {
            device_id: device.id().to_string(),
        });
        Ok(())
    }

    /// Tear down an existing pairing (or withdraw a pending request) and
    /// tell the peer.
    pub async fn unpair(&self, device: &mut Device) -> Result<()> {
        if device.pairing_status() == PairingStatus::Unpaired {
            return Ok(());
        }
        // Best effort; the peer may already be gone.
        if let Err(e) = device.send(&PairingPacket::unpair()).await {
            warn!("Could not notify {} of unpair: {}", device.id(), e);
        }
        self.timers.cancel(&pairing_timer_key(device.id()));
        device.set_pairing_status(PairingStatus::Unpaired)?;
        info!("Unpaired device {}", device.id());
        self.emit(PairingEvent::Unpaired {
            device_id: device.id().to_string(),
        });
        Ok(())
    }

    /// Process an incoming `peerlink.pair` packet.
    pub async fn handle_packet(&self, device: &mut Device, packet: &Packet) -> Result<()> {
        let pair = packet.field::<bool>("pair")?.ok_or_else(|| {
            ProtocolError::InvalidPacket("pair packet missing 'pair' field".to_string())
        })?;

        if pair {
            match device.pairing_status() {
                PairingStatus::Unpaired => {
                    device.set_pairing_status(PairingStatus::RequestedByPeer)?;
                    self.timers.schedule(pairing_timer_key(device.id()), self.timeout);
                    info!("Pairing request received from {}", device.id());
                    self.emit(PairingEvent::RequestReceived {
                        device_id: device.id().to_string(),
                        device_name: device.name().to_string(),
                    });
                }
                PairingStatus::RequestedByLocal => {
                    // The peer answered our request.
                    self.timers.cancel(&pairing_timer_key(device.id()));
                    device.set_pairing_status(PairingStatus::Paired)?;
                    info!("Pairing accepted by {}", device.id());
                    self.emit(PairingEvent::Paired {
                        device_id: device.id().to_string(),
                    });
                }
                PairingStatus::RequestedByPeer => {
                    // Duplicate request restarts the peer's window.
                    debug!("Duplicate pairing request from {}", device.id());
                    self.timers.schedule(pairing_timer_key(device.id()), self.timeout);
                }
                PairingStatus::Paired => {
                    debug!("Pairing request from already-paired {}", device.id());
                    device.send(&PairingPacket::accept()).await?;
                }
            }
        } else {
            match device.pairing_status() {
                PairingStatus::RequestedByLocal => {
                    self.timers.cancel(&pairing_timer_key(device.id()));
                    device.set_pairing_status(PairingStatus::Unpaired)?;
                    info!("Pairing declined by {}", device.id());
                    self.emit(PairingEvent::Declined {
                        device_id: device.id().to_string(),
                    });
                }
                PairingStatus::RequestedByPeer | PairingStatus::Paired => {
                    self.timers.cancel(&pairing_timer_key(device.id()));
                    device.set_pairing_status(PairingStatus::Unpaired)?;
                    info!("Device {} unpaired", device.id());
                    self.emit(PairingEvent::Unpaired {
                        device_id: device.id().to_string(),
                    });
                }
                PairingStatus::Unpaired => {
                    debug!("Unpair from already-unpaired {}", device.id());
                }
            }
        }
        Ok(())
    }

    /// Handle a fired `pair.<device-id>` timer. A firing that raced the
    /// request's resolution finds the device out of the pending state and
    /// does nothing.
    pub fn handle_timeout(&self, device: &mut Device) -> Result<()> {
        if !device.pairing_status().is_pending() {
            debug!(
                "Stale pairing timeout for {} in state {:?}",
                device.id(),
                device.pairing_status()
            );
            return Ok(());
        }
        device.set_pairing_status(PairingStatus::Unpaired)?;
        info!("Pairing request with {} timed out", device.id());
        self.emit(PairingEvent::Timeout {
            device_id: device.id().to_string(),
        });
        Ok(())
    }

    /// React to a transport drop: pairing does not survive the connection.
    pub fn connection_lost(&self, device: &mut Device) -> Result<()> {
        self.timers.cancel(&pairing_timer_key(device.id()));
        if device.pairing_status() == PairingStatus::Unpaired {
            return Ok(());
        }
        device.set_pairing_status(PairingStatus::Unpaired)?;
        self.emit(PairingEvent::Unpaired {
            device_id: device.id().to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{connected_device, sent_types};

    fn handler() -> (PairingHandler, mpsc::UnboundedReceiver<PairingEvent>, TimerTable) {
        let (timers, _timer_rx) = TimerTable::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PairingHandler::new(PAIRING_TIMEOUT, timers.clone(), tx),
            rx,
            timers,
        )
    }

    #[tokio::test]
    async fn test_local_request_then_accept() {
        let (handler, mut events, timers) = handler();
        let (mut device, outbox) = connected_device("dev1");

        handler.request_pairing(&mut device).await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::RequestedByLocal);
        assert!(timers.is_scheduled("pair.dev1"));
        assert_eq!(
            events.recv().await.unwrap(),
            PairingEvent::RequestSent {
                device_id: "dev1".into()
            }
        );

        let accept = PairingPacket::accept();
        handler.handle_packet(&mut device, &accept).await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);
        assert!(!timers.is_scheduled("pair.dev1"));
        assert_eq!(sent_types(&outbox), vec![PAIR_PACKET_TYPE.to_string()]);
    }

    #[tokio::test]
    async fn test_peer_request_accept_idempotent() {
        let (handler, mut events, timers) = handler();
        let (mut device, outbox) = connected_device("dev1");

        let request = PairingPacket::request();
        handler.handle_packet(&mut device, &request).await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::RequestedByPeer);
        assert!(matches!(
            events.recv().await.unwrap(),
            PairingEvent::RequestReceived { .. }
        ));

        handler.accept_pairing(&mut device).await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);
        assert!(!timers.is_scheduled("pair.dev1"));
        assert_eq!(sent_types(&outbox).len(), 1);

        // Second acceptance changes nothing and sends nothing.
        handler.accept_pairing(&mut device).await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);
        assert_eq!(sent_types(&outbox).len(), 1);
    }

    #[tokio::test]
    async fn test_decline_after_resolution_is_noop() {
        let (handler, _events, _timers) = handler();
        let (mut device, outbox) = connected_device("dev1");

        handler
            .handle_packet(&mut device, &PairingPacket::request())
            .await
            .unwrap();
        handler.accept_pairing(&mut device).await.unwrap();

        handler.decline_pairing(&mut device).await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);
        assert_eq!(sent_types(&outbox).len(), 1);
    }

    #[tokio::test]
    async fn test_peer_reject_returns_to_unpaired() {
        let (handler, mut events, _timers) = handler();
        let (mut device, _outbox) = connected_device("dev1");

        handler.request_pairing(&mut device).await.unwrap();
        events.recv().await.unwrap();
        handler
            .handle_packet(&mut device, &PairingPacket::reject())
            .await
            .unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
        assert_eq!(
            events.recv().await.unwrap(),
            PairingEvent::Declined {
                device_id: "dev1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unpair_packet_while_paired() {
        let (handler, mut events, _timers) = handler();
        let (mut device, _outbox) = connected_device("dev1");

        handler.request_pairing(&mut device).await.unwrap();
        handler
            .handle_packet(&mut device, &PairingPacket::accept())
            .await
            .unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);

        handler
            .handle_packet(&mut device, &PairingPacket::unpair())
            .await
            .unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
        let mut saw_unpaired = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PairingEvent::Unpaired { .. }) {
                saw_unpaired = true;
            }
        }
        assert!(saw_unpaired);
    }

    #[tokio::test]
    async fn test_timeout_fires_exactly_once() {
        let (handler, mut events, _timers) = handler();
        let (mut device, _outbox) = connected_device("dev1");

        handler.request_pairing(&mut device).await.unwrap();
        events.recv().await.unwrap();

        handler.handle_timeout(&mut device).unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
        assert_eq!(
            events.recv().await.unwrap(),
            PairingEvent::Timeout {
                device_id: "dev1".into()
            }
        );

        // A stale second firing is ignored.
        handler.handle_timeout(&mut device).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mutual_request_pairs_both() {
        let (handler, _events, _timers) = handler();
        let (mut device, _outbox) = connected_device("dev1");

        handler.request_pairing(&mut device).await.unwrap();
        // Peer's own request arrives while ours is pending.
        handler
            .handle_packet(&mut device, &PairingPacket::request())
            .await
            .unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);
    }

    #[tokio::test]
    async fn test_pair_packet_missing_field() {
        let (handler, _events, _timers) = handler();
        let (mut device, _outbox) = connected_device("dev1");
        let bad = Packet::new(PAIR_PACKET_TYPE, serde_json::json!({}));
        assert!(handler.handle_packet(&mut device, &bad).await.is_err());
    }
}
