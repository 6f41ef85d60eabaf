// Shared data model for the reconciliation core.
//
// Everything in here crosses the push-channel or HTTP boundary, so all
// types derive serde with the wire field names. Event and state fields are
// closed enums; an unknown discriminant fails deserialization instead of
// leaking into the reducers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    // add   	This board was plugged in or was already there
    // change 	Something changed, maybe the board rebooted
    // miss 	This board is missing, either it was unplugged or it is changing mode
    // remove 	This board has been missing for some time, consider it removed
    Add,
    Change,
    Miss,
    Remove,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Reboot,
    Reset,
    Rtc,
    Run,
    Serial,
    Unique,
    Upload,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub tag: String,
    pub action_history: Vec<DeviceAction>,
    pub capabilities: Vec<Capability>,
    pub description: String,
    pub model: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

// Keyed by the tag that is stable per physical connection. BTreeMap keeps
// iteration deterministic; insertion order is not meaningful for this map.
pub type DeviceMap = BTreeMap<String, DeviceSnapshot>;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DownloadState {
    Stopped,
    Starting,
    Downloading,
    Complete,
    Error,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DownloadStatus {
    pub bytes_downloaded: u64,
    pub size: u64,
    pub state: DownloadState,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self {
            bytes_downloaded: 0,
            size: 0,
            state: DownloadState::Stopped,
        }
    }
}

impl DownloadStatus {
    /// Fraction downloaded, or -1.0 when the total size is unknown.
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            -1.0
        } else {
            self.bytes_downloaded as f64 / self.size as f64
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum UploadState {
    Stopped,
    Initializing,
    Starting,
    Uploading,
    Finalizing,
    Error,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogEntry {
    pub line: String,
    pub state: UploadState,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Change,
    Fix,
    Improved,
    New,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChangelogEntry {
    pub description: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChangelogSection {
    pub entries: Vec<ChangelogEntry>,
    pub id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Firmware {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<Vec<ChangelogSection>>,
    // Empty path means the entry is not independently downloadable; its
    // archive lives on another member of the same base-version group.
    #[serde(default)]
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareSource {
    Local,
    Remote,
}

// Created on explicit user/deep-link selection, replaced wholesale.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SelectedFirmware {
    pub path: String,
    pub version: String,
    pub source: FirmwareSource,
}
