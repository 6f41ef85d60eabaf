// Device map reconciliation.
//
// The hardware watcher rescans aggressively and emits several near-duplicate
// presence events per physical change. The reconciler coalesces those bursts
// behind a short debounce window, filters transport-artifact capabilities,
// and only rewrites the published map when something actually changed.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::device::status::{DeviceStatus, device_status};
use crate::events::DeviceWatchPayload;
use crate::installation::InstallationTracker;
use crate::models::{Capability, DeviceMap, DeviceSnapshot};

/// Raw events arriving within this window collapse to the most recent one.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

pub struct DeviceReconciler {
    devices: Arc<DeviceMap>,
    selected_tag: Option<String>,
    installation: Arc<Mutex<InstallationTracker>>,
}

impl DeviceReconciler {
    pub fn new(installation: Arc<Mutex<InstallationTracker>>) -> Self {
        Self {
            devices: Arc::new(DeviceMap::new()),
            selected_tag: None,
            installation,
        }
    }

    /// The published map. Unchanged payloads preserve pointer identity, so
    /// downstream consumers can skip work on `Arc::ptr_eq`.
    pub fn devices(&self) -> Arc<DeviceMap> {
        Arc::clone(&self.devices)
    }

    pub fn selected_tag(&self) -> Option<&str> {
        self.selected_tag.as_deref()
    }

    pub fn selected_device(&self) -> Option<&DeviceSnapshot> {
        self.devices.get(self.selected_tag.as_deref()?)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Applies one coalesced payload. Pure with respect to time: `now` is
    /// the classification instant, passed in by the run loop.
    pub fn apply(&mut self, mut payload: DeviceWatchPayload, now: DateTime<Utc>) {
        // rtc/unique appear and disappear independently of flashing state;
        // they must not influence diffing or anything downstream.
        for device in payload.devices.values_mut() {
            device
                .capabilities
                .retain(|c| !matches!(c, Capability::Rtc | Capability::Unique));
        }

        if *self.devices != payload.devices {
            debug!(count = payload.devices.len(), "device map changed");
            self.devices = Arc::new(payload.devices);
        } else {
            debug!("device map unchanged, skipping store write");
        }

        match &self.selected_tag {
            Some(tag) => {
                // Stickiness: the selection survives map churn. If the board
                // came back with serial connectivity, the installation
                // tracker gets to close out a finalizing flash cycle; the
                // tracker owns that state, we only deliver the signal.
                let has_serial = self
                    .devices
                    .get(tag)
                    .is_some_and(|d| d.capabilities.contains(&Capability::Serial));

                if has_serial {
                    self.installation.lock().unwrap().finish_flash_cycle();
                }
            }
            None => {
                let ready = self
                    .devices
                    .iter()
                    .find(|(_, device)| device_status(Some(*device), now) == DeviceStatus::Ready);

                if let Some((tag, _)) = ready {
                    debug!(%tag, "auto-selecting ready device");
                    self.selected_tag = Some(tag.clone());
                }
            }
        }
    }
}

/// Debounced drain of the device-presence channel. Within a window only the
/// last payload survives; across windows application is strictly FIFO.
/// Aborting the task cancels any pending window.
pub async fn run(
    reconciler: Arc<Mutex<DeviceReconciler>>,
    mut events: broadcast::Receiver<DeviceWatchPayload>,
) {
    let mut pending: Option<DeviceWatchPayload> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(payload) => {
                    if pending.is_none() {
                        deadline = Instant::now() + DEBOUNCE_WINDOW;
                    }
                    pending = Some(payload);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "device event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                if let Some(payload) = pending.take() {
                    reconciler.lock().unwrap().apply(payload, Utc::now());
                }
            }
        }
    }

    debug!("device event listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::models::{DeviceAction, DownloadState, UploadState};
    use std::collections::BTreeMap;

    fn snapshot(tag: &str, capabilities: &[Capability]) -> DeviceSnapshot {
        DeviceSnapshot {
            tag: tag.to_string(),
            action_history: vec![DeviceAction::Add],
            capabilities: capabilities.to_vec(),
            description: "M8".to_string(),
            model: "Teensy 4.0".to_string(),
            updated_at: Utc::now(),
        }
    }

    fn payload(devices: &[DeviceSnapshot]) -> DeviceWatchPayload {
        DeviceWatchPayload {
            devices: devices
                .iter()
                .map(|d| (d.tag.clone(), d.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn reconciler() -> DeviceReconciler {
        let tracker = Arc::new(Mutex::new(InstallationTracker::new(EventHub::new())));
        DeviceReconciler::new(tracker)
    }

    #[test]
    fn strips_transport_artifact_capabilities() {
        let mut reconciler = reconciler();
        reconciler.apply(
            payload(&[snapshot(
                "a",
                &[
                    Capability::Unique,
                    Capability::Run,
                    Capability::Rtc,
                    Capability::Serial,
                ],
            )]),
            Utc::now(),
        );

        let stored = reconciler.devices();
        assert_eq!(
            stored.get("a").unwrap().capabilities,
            vec![Capability::Run, Capability::Serial]
        );
    }

    #[test]
    fn identical_payload_preserves_pointer_identity() {
        let mut reconciler = reconciler();
        let event = payload(&[snapshot("a", &[Capability::Serial, Capability::Rtc])]);

        reconciler.apply(event.clone(), Utc::now());
        let first = reconciler.devices();

        reconciler.apply(event, Utc::now());
        let second = reconciler.devices();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn changed_payload_replaces_the_map() {
        let mut reconciler = reconciler();
        reconciler.apply(payload(&[snapshot("a", &[Capability::Serial])]), Utc::now());
        let first = reconciler.devices();

        reconciler.apply(payload(&[snapshot("a", &[Capability::Upload])]), Utc::now());
        let second = reconciler.devices();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn auto_selects_first_ready_device() {
        let mut reconciler = reconciler();

        // "a" sorts first but is mid-flash; "b" is the first Ready entry.
        let flashing = DeviceSnapshot {
            action_history: vec![DeviceAction::Add, DeviceAction::Change],
            capabilities: vec![Capability::Upload],
            ..snapshot("a", &[])
        };
        reconciler.apply(
            payload(&[flashing, snapshot("b", &[Capability::Serial])]),
            Utc::now(),
        );

        assert_eq!(reconciler.selected_tag(), Some("b"));
    }

    #[test]
    fn no_selection_when_nothing_is_ready() {
        let mut reconciler = reconciler();
        let rebooting = DeviceSnapshot {
            action_history: vec![DeviceAction::Miss],
            ..snapshot("a", &[])
        };

        reconciler.apply(payload(&[rebooting]), Utc::now());

        assert_eq!(reconciler.selected_tag(), None);
    }

    #[test]
    fn selection_is_sticky_across_updates() {
        let mut reconciler = reconciler();
        reconciler.apply(payload(&[snapshot("b", &[Capability::Serial])]), Utc::now());
        assert_eq!(reconciler.selected_tag(), Some("b"));

        // A new, lexicographically earlier ready device must not steal it.
        reconciler.apply(
            payload(&[
                snapshot("a", &[Capability::Serial]),
                snapshot("b", &[Capability::Serial]),
            ]),
            Utc::now(),
        );

        assert_eq!(reconciler.selected_tag(), Some("b"));
    }

    #[test]
    fn regained_serial_finishes_finalizing_upload() {
        let hub = EventHub::new();
        let tracker = Arc::new(Mutex::new(InstallationTracker::new(hub)));
        tracker.lock().unwrap().upload_state = UploadState::Finalizing;

        let mut reconciler = DeviceReconciler::new(Arc::clone(&tracker));
        reconciler.apply(payload(&[snapshot("a", &[Capability::Serial])]), Utc::now());
        assert_eq!(reconciler.selected_tag(), Some("a"));

        // Second update: still selected, still serial-capable.
        reconciler.apply(payload(&[snapshot("a", &[Capability::Serial])]), Utc::now());

        assert_eq!(tracker.lock().unwrap().upload_state, UploadState::Stopped);
    }

    #[test]
    fn serial_without_finalizing_leaves_tracker_alone() {
        let hub = EventHub::new();
        let tracker = Arc::new(Mutex::new(InstallationTracker::new(hub)));
        tracker.lock().unwrap().download_status.state = DownloadState::Downloading;

        let mut reconciler = DeviceReconciler::new(Arc::clone(&tracker));
        reconciler.apply(payload(&[snapshot("a", &[Capability::Serial])]), Utc::now());
        reconciler.apply(payload(&[snapshot("a", &[Capability::Serial])]), Utc::now());

        let tracker = tracker.lock().unwrap();
        assert_eq!(tracker.upload_state, UploadState::Stopped);
        assert_eq!(tracker.download_status.state, DownloadState::Downloading);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_applies_only_the_last_payload() {
        let hub = EventHub::new();
        let reconciler = Arc::new(Mutex::new(reconciler()));
        let rx = hub.subscribe_devices().unwrap();
        let task = tokio::spawn(run(Arc::clone(&reconciler), rx));

        hub.publish_devices(payload(&[snapshot("a", &[Capability::Serial])]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.publish_devices(payload(&[]));

        // Still inside the window: nothing applied yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.lock().unwrap().device_count(), 0);

        // Past the window: only the empty payload landed.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let guard = reconciler.lock().unwrap();
        assert_eq!(guard.device_count(), 0);
        assert!(guard.devices().is_empty());
        drop(guard);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn events_across_windows_apply_in_order() {
        let hub = EventHub::new();
        let reconciler = Arc::new(Mutex::new(reconciler()));
        let rx = hub.subscribe_devices().unwrap();
        let task = tokio::spawn(run(Arc::clone(&reconciler), rx));

        hub.publish_devices(payload(&[snapshot("a", &[Capability::Serial])]));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(reconciler.lock().unwrap().device_count(), 1);

        hub.publish_devices(payload(&[
            snapshot("a", &[Capability::Serial]),
            snapshot("b", &[Capability::Serial]),
        ]));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(reconciler.lock().unwrap().device_count(), 2);

        task.abort();
    }
}
