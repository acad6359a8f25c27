//! Service layer.
//!
//! A [`Service`] implements one capability family (notifications,
//! telephony, media, ...). The [`ServiceManager`] owns all registered
//! services and fans every inbound packet out to each of them in
//! registration order; a service inspects the packet type and reports
//! whether it handled it. One service failing never affects its siblings
//! or the connection.

pub mod media;
pub mod notifications;
pub mod ping;
pub mod telephony;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;

/// A user-invokable operation a service offers for a specific device
/// (e.g. "Send SMS"). Routed back through
/// [`ServiceManager::perform_action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAction {
    pub id: String,
    pub service_id: String,
    pub device_id: String,
    pub title: String,
}

impl ServiceAction {
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        device_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service_id: service_id.into(),
            device_id: device_id.into(),
            title: title.into(),
        }
    }
}

/// One capability family.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable identifier, also the routing key for actions and timers.
    fn id(&self) -> &'static str;

    /// Downcast hooks so the embedding application can reach
    /// service-specific surfaces (e.g. sending an SMS) behind `dyn Service`.
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Packet types this service consumes.
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this service may emit.
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Called once when a device with overlapping capabilities becomes
    /// paired.
    async fn setup(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Called once when a set-up device unpairs or disconnects. Must drop
    /// every trace of the device.
    async fn cleanup(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Inspect one packet. Return `Ok(false)` quickly when the type is not
    /// one of this service's; `Ok(true)` when consumed.
    async fn handle_packet(&mut self, packet: &Packet, device: &mut Device) -> Result<bool>;

    /// A timer scheduled by this service fired. Keys not owned by the
    /// service must be ignored.
    async fn handle_timer(&mut self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Actions currently available for a paired device.
    fn actions(&self, _device: &Device) -> Vec<ServiceAction> {
        Vec::new()
    }

    async fn perform_action(&mut self, action_id: &str, _device: &mut Device) -> Result<()> {
        Err(ProtocolError::Service(format!(
            "unknown action: {}",
            action_id
        )))
    }
}

/// Whether a service and a device can talk to each other at all.
fn capabilities_intersect(service: &dyn Service, device: &Device) -> bool {
    service
        .incoming_capabilities()
        .iter()
        .any(|c| device.has_outgoing_capability(c))
        || service
            .outgoing_capabilities()
            .iter()
            .any(|c| device.has_incoming_capability(c))
}

/// Registry and dispatcher for all services in the process.
pub struct ServiceManager {
    services: Vec<Box<dyn Service>>,
    /// device id -> services set up for it. Guards exactly-once
    /// setup/cleanup.
    active: HashMap<String, HashSet<&'static str>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            active: HashMap::new(),
        }
    }

    /// Register a service. Dispatch order is registration order.
    pub fn register(&mut self, service: Box<dyn Service>) -> Result<()> {
        if self.services.iter().any(|s| s.id() == service.id()) {
            return Err(ProtocolError::Service(format!(
                "service '{}' already registered",
                service.id()
            )));
        }
        debug!("Registered service '{}'", service.id());
        self.services.push(service);
        Ok(())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Typed access to a registered service, for wiring boundary callbacks
    /// (e.g. the media bridge observer).
    pub fn service_mut(&mut self, id: &str) -> Option<&mut Box<dyn Service>> {
        self.services.iter_mut().find(|s| s.id() == id)
    }

    /// Union of all services' incoming packet types, sorted and deduped,
    /// for the identity handshake.
    pub fn incoming_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .services
            .iter()
            .flat_map(|s| s.incoming_capabilities())
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    pub fn outgoing_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .services
            .iter()
            .flat_map(|s| s.outgoing_capabilities())
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// A device became paired: set up every service whose capabilities
    /// overlap the device's, once each.
    pub async fn device_paired(&mut self, device: &Device) {
        let entry = self.active.entry(device.id().to_string()).or_default();
        for service in &mut self.services {
            if entry.contains(service.id()) || !capabilities_intersect(service.as_ref(), device) {
                continue;
            }
            match service.setup(device).await {
                Ok(()) => {
                    entry.insert(service.id());
                    debug!("Service '{}' set up for {}", service.id(), device.id());
                }
                Err(e) => warn!(
                    "Service '{}' setup failed for {}: {}",
                    service.id(),
                    device.id(),
                    e
                ),
            }
        }
    }

    /// A paired device went away: clean up every service that was set up
    /// for it.
    pub async fn device_removed(&mut self, device: &Device) {
        let Some(entry) = self.active.remove(device.id()) else {
            return;
        };
        for service in &mut self.services {
            if !entry.contains(service.id()) {
                continue;
            }
            if let Err(e) = service.cleanup(device).await {
                warn!(
                    "Service '{}' cleanup failed for {}: {}",
                    service.id(),
                    device.id(),
                    e
                );
            }
        }
    }

    /// Offer a packet to every service. Errors are contained per service;
    /// dispatch always runs to completion.
    pub async fn dispatch(&mut self, packet: &Packet, device: &mut Device) {
        let mut handled = false;
        for service in &mut self.services {
            match service.handle_packet(packet, device).await {
                Ok(true) => {
                    debug!(
                        "Service '{}' handled {} from {}",
                        service.id(),
                        packet.packet_type,
                        device.id()
                    );
                    handled = true;
                }
                Ok(false) => {}
                Err(e) if e.is_recoverable() => warn!(
                    "Service '{}' failed on {}: {}",
                    service.id(),
                    packet.packet_type,
                    e
                ),
                Err(e) => error!(
                    "Service '{}' failed on {}: {}",
                    service.id(),
                    packet.packet_type,
                    e
                ),
            }
        }
        if !handled {
            debug!(
                "No service handled {} from {}",
                packet.packet_type,
                device.id()
            );
        }
    }

    /// Route a fired timer key. Every service sees it; owners act, others
    /// ignore it.
    pub async fn handle_timer(&mut self, key: &str) {
        for service in &mut self.services {
            if let Err(e) = service.handle_timer(key).await {
                warn!("Service '{}' timer '{}' failed: {}", service.id(), key, e);
            }
        }
    }

    /// Aggregate actions across services. Empty unless the device is
    /// paired.
    pub fn actions_for(&self, device: &Device) -> Vec<ServiceAction> {
        if !device.is_paired() {
            return Vec::new();
        }
        self.services
            .iter()
            .flat_map(|s| s.actions(device))
            .collect()
    }

    pub async fn perform_action(
        &mut self,
        service_id: &str,
        action_id: &str,
        device: &mut Device,
    ) -> Result<()> {
        let service = self
            .services
            .iter_mut()
            .find(|s| s.id() == service_id)
            .ok_or_else(|| ProtocolError::Service(format!("unknown service: {}", service_id)))?;
        service.perform_action(action_id, device).await
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
