//! Media remote control.
//!
//! Peers steer the local media player with `peerlink.mpris.request`
//! packets and receive state as `peerlink.mpris`. The actual player sits
//! behind the [`MediaPlayerBridge`] boundary; this service owns the
//! reconciliation rules: clamped relative seeks with a previous-track
//! shortcut near the start of a track, broadcast deduplication, and echo
//! suppression so the device that caused a change does not get it mirrored
//! back.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::device::Device;
use crate::error::Result;
use crate::packet::Packet;
use crate::services::Service;

pub const MPRIS_PACKET_TYPE: &str = "peerlink.mpris";
pub const MPRIS_REQUEST_PACKET_TYPE: &str = "peerlink.mpris.request";

pub const SERVICE_ID: &str = "media";

/// Seeks that land this close to the current position are treated as
/// "jump to track start" gestures; near the start they mean previous
/// track.
pub const SEEK_TOLERANCE: i64 = 5;

/// Player state as reported by the bridge. `id` identifies the current
/// content and drives echo suppression; position and length share one
/// unit, chosen by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSnapshot {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub is_playing: bool,
    pub position: i64,
    pub length: i64,
    pub volume: i64,
    pub shuffle: bool,
}

/// Boundary to the platform media player. Implementations must not block;
/// slow player automation belongs behind the async calls.
#[async_trait]
pub trait MediaPlayerBridge: Send + Sync {
    /// Current state, or `None` when nothing is loaded.
    async fn snapshot(&self) -> Result<Option<MediaSnapshot>>;
    async fn position(&self) -> Result<i64>;
    async fn set_position(&self, position: i64) -> Result<()>;
    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn play_pause(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn next(&self) -> Result<()>;
    async fn previous(&self) -> Result<()>;
    async fn set_volume(&self, volume: i64) -> Result<()>;
    async fn set_shuffle(&self, enabled: bool) -> Result<()>;
}

pub struct MediaService {
    bridge: Arc<dyn MediaPlayerBridge>,
    player_name: String,
    /// Paired devices subscribed to state broadcasts.
    devices: HashMap<String, Arc<dyn Connection>>,
    last_broadcast: Option<MediaSnapshot>,
    /// (snapshot id, device id) of the last externally-caused change.
    last_external: Option<(String, String)>,
}

impl MediaService {
    pub fn new(bridge: Arc<dyn MediaPlayerBridge>, player_name: impl Into<String>) -> Self {
        Self {
            bridge,
            player_name: player_name.into(),
            devices: HashMap::new(),
            last_broadcast: None,
            last_external: None,
        }
    }

    fn player_list_packet(&self) -> Packet {
        Packet::new(
            MPRIS_PACKET_TYPE,
            json!({
                "playerList": [self.player_name],
                "supportAlbumArtPayload": false,
            }),
        )
    }

    fn now_playing_packet(&self, snapshot: &MediaSnapshot) -> Packet {
        let now_playing = match &snapshot.artist {
            Some(artist) => format!("{} - {}", artist, snapshot.title),
            None => snapshot.title.clone(),
        };
        Packet::new(
            MPRIS_PACKET_TYPE,
            json!({
                "player": self.player_name,
                "nowPlaying": now_playing,
                "title": snapshot.title,
                "artist": snapshot.artist,
                "album": snapshot.album,
                "isPlaying": snapshot.is_playing,
                "pos": snapshot.position,
                "length": snapshot.length,
                "volume": snapshot.volume,
                "shuffle": snapshot.shuffle,
            }),
        )
    }

    /// Relative seek. The target is clamped into track bounds; a jump that
    /// ends up within [`SEEK_TOLERANCE`] of the current position while the
    /// track has barely started means "previous track".
    async fn seek(&self, delta: i64) -> Result<()> {
        let Some(snapshot) = self.bridge.snapshot().await? else {
            return Ok(());
        };
        let position = self.bridge.position().await?;
        let upper = (snapshot.length - 1).max(0);
        let target = (position + delta).clamp(0, upper);
        if (target - position).abs() <= SEEK_TOLERANCE {
            if position <= SEEK_TOLERANCE {
                self.bridge.previous().await?;
            }
        } else {
            self.bridge.set_position(target).await?;
        }
        Ok(())
    }

    /// Remember that `device` caused the current state, so the next
    /// broadcast of it skips that device.
    async fn record_external_change(&mut self, device_id: &str) {
        match self.bridge.snapshot().await {
            Ok(Some(snapshot)) => {
                self.last_external = Some((snapshot.id, device_id.to_string()));
            }
            Ok(None) => self.last_external = None,
            Err(e) => debug!("Could not snapshot after external change: {}", e),
        }
    }

    /// Push current state to all subscribed devices. Called by the bridge
    /// observer whenever the local player changes. Unchanged state is not
    /// re-sent, and the device that sourced the change is skipped.
    pub async fn update_now_playing(&mut self) -> Result<()> {
        let Some(snapshot) = self.bridge.snapshot().await? else {
            return Ok(());
        };
        if self.last_broadcast.as_ref() == Some(&snapshot) {
            return Ok(());
        }
        let packet = self.now_playing_packet(&snapshot);
        for (device_id, connection) in &self.devices {
            if let Some((external_id, external_device)) = &self.last_external {
                if *external_id == snapshot.id && external_device == device_id {
                    debug!("Suppressing echo of '{}' to {}", snapshot.id, device_id);
                    continue;
                }
            }
            if let Err(e) = connection.send(&packet).await {
                warn!("Media broadcast to {} failed: {}", device_id, e);
            }
        }
        self.last_broadcast = Some(snapshot);
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.devices.len()
    }

    async fn handle_request(&mut self, packet: &Packet, device: &mut Device) -> Result<()> {
        if let Some(action) = packet.field::<String>("action")? {
            match action.as_str() {
                "Play" => self.bridge.play().await?,
                "Pause" => self.bridge.pause().await?,
                "PlayPause" => self.bridge.play_pause().await?,
                "Stop" => self.bridge.stop().await?,
                "Next" => self.bridge.next().await?,
                "Previous" => self.bridge.previous().await?,
                other => debug!("Unknown media action '{}' from {}", other, device.id()),
            }
            self.record_external_change(device.id()).await;
        }

        if let Some(delta) = packet.field::<i64>("Seek")? {
            self.seek(delta).await?;
            self.record_external_change(device.id()).await;
        }

        if let Some(position) = packet.field::<i64>("SetPosition")? {
            if let Some(snapshot) = self.bridge.snapshot().await? {
                let upper = (snapshot.length - 1).max(0);
                self.bridge.set_position(position.clamp(0, upper)).await?;
                self.record_external_change(device.id()).await;
            }
        }

        if let Some(volume) = packet.field::<i64>("setVolume")? {
            self.bridge.set_volume(volume.clamp(0, 100)).await?;
            self.record_external_change(device.id()).await;
        }

        if let Some(shuffle) = packet.field::<bool>("setShuffle")? {
            self.bridge.set_shuffle(shuffle).await?;
            self.record_external_change(device.id()).await;
        }

        if packet.flag("requestPlayerList")? {
            device.send(&self.player_list_packet()).await?;
        }

        if packet.flag("requestNowPlaying")? {
            if let Some(snapshot) = self.bridge.snapshot().await? {
                device.send(&self.now_playing_packet(&snapshot)).await?;
            }
        }

        if packet.flag("requestVolume")? {
            if let Some(snapshot) = self.bridge.snapshot().await? {
                let volume = Packet::new(
                    MPRIS_PACKET_TYPE,
                    json!({ "player": self.player_name, "volume": snapshot.volume }),
                );
                device.send(&volume).await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Service for MediaService {
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
        vec![MPRIS_REQUEST_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![MPRIS_PACKET_TYPE.to_string()]
    }

    /// Subscribe the device to state broadcasts and give it the player
    /// list right away.
    async fn setup(&mut self, device: &Device) -> Result<()> {
        if let Some(connection) = device.connection_handle() {
            self.devices.insert(device.id().to_string(), connection);
        }
        device.send(&self.player_list_packet()).await?;
        Ok(())
    }

    async fn cleanup(&mut self, device: &Device) -> Result<()> {
        self.devices.remove(device.id());
        if let Some((_, external_device)) = &self.last_external {
            if external_device == device.id() {
                self.last_external = None;
            }
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet, device: &mut Device) -> Result<bool> {
        if !packet.is_type(MPRIS_REQUEST_PACKET_TYPE) {
            return Ok(false);
        }
        self.handle_request(packet, device).await?;
        Ok(true)
    }
}
