// Installation progress tracker.
//
// A single reducer owns the canonical download/upload state and the flash
// log. Download and upload progress arrive interleaved on the flashing
// channel; the tracker canonicalizes transient states so the rest of the
// application only ever sees rest states once a phase is over.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{EventHub, FlashingEvent, VersionSelectedPayload};
use crate::firmware::catalog::remote_download_link;
use crate::firmware::filename::parse_firmware_filename;
use crate::models::{
    DownloadState, DownloadStatus, FirmwareSource, LogEntry, SelectedFirmware, UploadState,
};

// Lines worth keeping from the uploader's raw output look like
// "  upload@board42  Firmware: 445kB". Everything after the worker token is
// the payload.
static UPLOAD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*upload@\S+\s+(?P<log>.*)$").unwrap());

const PROGRESS_LINE_PREFIX: &str = "Downloading... ";

pub struct InstallationTracker {
    pub cached_local_firmware: Option<SelectedFirmware>,
    pub download_status: DownloadStatus,
    pub selected_firmware: Option<SelectedFirmware>,
    pub upload_log: Vec<LogEntry>,
    pub upload_state: UploadState,
    hub: EventHub,
}

impl InstallationTracker {
    pub fn new(hub: EventHub) -> Self {
        Self {
            cached_local_firmware: None,
            download_status: DownloadStatus::default(),
            selected_firmware: None,
            upload_log: Vec::new(),
            upload_state: UploadState::Stopped,
            hub,
        }
    }

    /// Fraction of the current download, or -1.0 while the size is unknown.
    pub fn download_progress(&self) -> f64 {
        self.download_status.progress()
    }

    /// True while either phase of a flash cycle is active.
    pub fn is_flashing(&self) -> bool {
        self.download_status.state != DownloadState::Stopped
            || self.upload_state != UploadState::Stopped
    }

    /// Final path component of the cached local firmware selection.
    pub fn local_filename(&self) -> Option<String> {
        let cached = self.cached_local_firmware.as_ref()?;

        Path::new(&cached.path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn apply(&mut self, event: FlashingEvent) {
        match event {
            FlashingEvent::Downloading(status) => {
                // Complete is a transient signal, not a rest state.
                let stored_state = if status.state == DownloadState::Complete {
                    DownloadState::Stopped
                } else {
                    status.state
                };

                self.download_status = DownloadStatus {
                    bytes_downloaded: status.bytes_downloaded,
                    size: status.size,
                    state: stored_state,
                };

                if status.state == DownloadState::Downloading {
                    self.push_progress_line();
                }
            }
            FlashingEvent::Uploading(status) => {
                if let Some(log) = &status.log {
                    for captures in UPLOAD_LINE.captures_iter(log) {
                        self.upload_log.push(LogEntry {
                            line: captures["log"].to_string(),
                            state: status.state,
                        });
                    }
                }

                // The raw Error detail stays visible through the appended log
                // line; the canonical field goes back to rest.
                self.upload_state = if status.state == UploadState::Error {
                    UploadState::Stopped
                } else {
                    status.state
                };

                // An upload beginning implies the download phase has ended,
                // even if that transition event was never observed.
                if status.state == UploadState::Starting
                    && self.download_status.state == DownloadState::Complete
                {
                    debug!("upload started with download still Complete, forcing Stopped");
                    self.download_status.state = DownloadState::Stopped;
                }
            }
        }
    }

    // One synthetic progress line, replaced in place while the download is
    // active so the log does not fill up with percentages.
    fn push_progress_line(&mut self) {
        let entry = LogEntry {
            line: format!(
                "{}{:.2}%",
                PROGRESS_LINE_PREFIX,
                self.download_progress() * 100.0
            ),
            state: UploadState::Starting,
        };

        match self.upload_log.last_mut() {
            Some(last)
                if last.state == UploadState::Starting
                    && last.line.starts_with(PROGRESS_LINE_PREFIX) =>
            {
                *last = entry;
            }
            _ => self.upload_log.push(entry),
        }
    }

    /// Called by the device reconciler when the selected board re-enumerates
    /// with serial connectivity. That is the only externally observable
    /// signal that a flash cycle finished.
    pub fn finish_flash_cycle(&mut self) {
        if self.upload_state == UploadState::Finalizing {
            info!("serial connectivity regained, flash cycle finished");
            self.upload_state = UploadState::Stopped;
        }
    }

    /// Resolved link for the current selection: local paths verbatim, remote
    /// paths expanded through the contents API.
    pub fn selected_firmware_download_link(&self) -> Option<String> {
        let selected = self.selected_firmware.as_ref()?;

        match selected.source {
            FirmwareSource::Local => Some(selected.path.clone()),
            FirmwareSource::Remote => Some(remote_download_link(&selected.path)),
        }
    }

    /// Stores the selection wholesale and notifies the host process.
    pub fn select_version(&mut self, selection: SelectedFirmware) {
        if selection.source == FirmwareSource::Local {
            self.cached_local_firmware = Some(selection.clone());
        }

        let version = selection.version.clone();
        self.selected_firmware = Some(selection);

        let path = self
            .selected_firmware_download_link()
            .unwrap_or_default();

        self.hub
            .emit_version_selected(VersionSelectedPayload { path, version });
    }

    /// Selects a locally picked firmware file, deriving the version from its
    /// filename. An unparseable filename is a normal out-of-band user action
    /// and leaves the selection untouched.
    pub fn select_custom_path(&mut self, path: &str, version: Option<String>) {
        let parsed = version.or_else(|| {
            let filename = Path::new(path).file_name()?.to_str()?;
            parse_firmware_filename(filename).map(|info| info.version)
        });

        let Some(version) = parsed else {
            debug!(path, "custom firmware path did not yield a version, ignoring");
            return;
        };

        self.select_version(SelectedFirmware {
            path: path.to_string(),
            version,
            source: FirmwareSource::Local,
        });
    }
}

/// Drains the flashing channel into the tracker until the channel closes.
pub async fn run(
    tracker: Arc<Mutex<InstallationTracker>>,
    mut events: broadcast::Receiver<FlashingEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => tracker.lock().unwrap().apply(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "flashing event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("flashing event listener stopped");
}
