// In-process representation of the host push channel.
//
// The transport that actually delivers device and flashing events is opaque
// to this crate; the hub is the seam it plugs into. Inbound events fan out
// over broadcast channels, outbound notifications (version selection, user
// notices) travel the other way. Dropping a receiver revokes the
// subscription.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{DeviceMap, DownloadState, UploadState};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeviceWatchPayload {
    pub devices: DeviceMap,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub log: Option<String>,
    pub size: u64,
    pub state: DownloadState,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UploadProgress {
    pub log: Option<String>,
    pub state: UploadState,
}

// Externally tagged, matching the wire shape {"Downloading": {..}} /
// {"Uploading": {..}}.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlashingEvent {
    Downloading(DownloadProgress),
    Uploading(UploadProgress),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VersionSelectedPayload {
    pub path: String,
    pub version: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSeverity {
    Info,
    Warning,
    Error,
}

// A single transient, user-visible notification. The presentation layer
// decides how long it stays on screen.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Notice {
    pub severity: NoticeSeverity,
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: NoticeSeverity::Error,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OutboundEvent {
    VersionSelected(VersionSelectedPayload),
    Notice(Notice),
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("event channel is closed")]
    Closed,
}

#[derive(Clone)]
pub struct EventHub {
    device_tx: broadcast::Sender<DeviceWatchPayload>,
    flashing_tx: broadcast::Sender<FlashingEvent>,
    outbound_tx: broadcast::Sender<OutboundEvent>,
    closed: Arc<AtomicBool>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (device_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (flashing_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            device_tx,
            flashing_tx,
            outbound_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the hub closed. Existing subscriptions keep draining whatever
    /// was already in flight; new registrations fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!("event hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe<T: Clone>(
        &self,
        tx: &broadcast::Sender<T>,
    ) -> Result<broadcast::Receiver<T>, ListenError> {
        if self.is_closed() {
            return Err(ListenError::Closed);
        }

        Ok(tx.subscribe())
    }

    pub fn subscribe_devices(
        &self,
    ) -> Result<broadcast::Receiver<DeviceWatchPayload>, ListenError> {
        self.subscribe(&self.device_tx)
    }

    pub fn subscribe_flashing(&self) -> Result<broadcast::Receiver<FlashingEvent>, ListenError> {
        self.subscribe(&self.flashing_tx)
    }

    pub fn subscribe_outbound(&self) -> Result<broadcast::Receiver<OutboundEvent>, ListenError> {
        self.subscribe(&self.outbound_tx)
    }

    // Host-side injection points. A send with no live subscriber is not an
    // error; the payload is simply dropped, like an unwatched push event.

    pub fn publish_devices(&self, payload: DeviceWatchPayload) {
        let _ = self.device_tx.send(payload);
    }

    pub fn publish_flashing(&self, event: FlashingEvent) {
        let _ = self.flashing_tx.send(event);
    }

    // Raw-payload variants for transports that deliver JSON strings. A
    // payload that fails to decode is rejected here, before it can reach a
    // reducer.

    pub fn publish_devices_json(&self, payload: &str) -> Result<(), serde_json::Error> {
        self.publish_devices(serde_json::from_str(payload)?);
        Ok(())
    }

    pub fn publish_flashing_json(&self, payload: &str) -> Result<(), serde_json::Error> {
        self.publish_flashing(serde_json::from_str(payload)?);
        Ok(())
    }

    pub fn emit_version_selected(&self, payload: VersionSelectedPayload) {
        debug!(version = %payload.version, "emitting version-selected");
        let _ = self
            .outbound_tx
            .send(OutboundEvent::VersionSelected(payload));
    }

    pub fn emit_notice(&self, notice: Notice) {
        let _ = self.outbound_tx.send(OutboundEvent::Notice(notice));
    }
}
