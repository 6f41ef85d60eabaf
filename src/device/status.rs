// Presence classification for connected boards.
//
// The watcher reports a noisy encoding of the board's hidden state machine
// (boot -> ready -> flash-start -> flashing -> reboot -> ready). Only two
// signals survive the transport: the last lifecycle action and the current
// capability set. Combined with time since the last update they are enough
// to recover a discrete status.
//
// Observed capability traces, after stripping the transport artifacts:
//
// Plugged in and ready to flash:   add                  [run reboot serial]
// Flashing started (reboot):       add|miss             []
// Flashing:                        add|miss|change      [upload reset]
// Reboot:                          add|miss|change|miss []
// Done:                            add|miss|change      [run reboot serial]
// Flash failure (HalfKay):         add                  [upload reset]

use chrono::{DateTime, Utc};

use crate::models::{Capability, DeviceAction, DeviceSnapshot};

/// A board with no capabilities for at least this long is gone, not merely
/// rebooting between flash phases.
pub const MISSING_AFTER_MS: i64 = 2000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceStatus {
    Flashing,
    Missing,
    Ready,
    Shutdown,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceType {
    Headless,
    Model01,
    Model02,
    Unknown,
}

fn has_flashing_capability(device: &DeviceSnapshot) -> bool {
    if device.capabilities.contains(&Capability::Serial) {
        return true;
    }

    // Capabilities are empty during shutdown/reboot, so a populated set on a
    // HalfKay bootloader still counts as flashable.
    device.description == "HalfKay" && !device.capabilities.is_empty()
}

/// True when the board has dropped all capabilities and stayed silent past
/// the reboot-blip threshold. Presentation uses this to decide when to show
/// troubleshooting guidance.
pub fn device_is_missing(device: &DeviceSnapshot, now: DateTime<Utc>) -> bool {
    device.capabilities.is_empty()
        && (now - device.updated_at).num_milliseconds() >= MISSING_AFTER_MS
}

/// Classifies a snapshot. Total over any input; `now` is passed in so the
/// classification stays deterministic.
pub fn device_status(device: Option<&DeviceSnapshot>, now: DateTime<Utc>) -> DeviceStatus {
    let Some(device) = device else {
        return DeviceStatus::Unknown;
    };

    match device.action_history.last() {
        Some(DeviceAction::Add) => {
            if has_flashing_capability(device) {
                DeviceStatus::Ready
            } else {
                DeviceStatus::Unknown
            }
        }
        Some(DeviceAction::Change) => {
            if has_flashing_capability(device) {
                DeviceStatus::Ready
            } else {
                // A change without the serial/HalfKay signal means mid-flash.
                DeviceStatus::Flashing
            }
        }
        Some(DeviceAction::Miss) => {
            if device_is_missing(device, now) {
                DeviceStatus::Missing
            } else {
                DeviceStatus::Shutdown
            }
        }
        Some(DeviceAction::Remove) | None => DeviceStatus::Unknown,
    }
}

/// Maps the reported description/model pair onto a hardware variant.
pub fn device_type(device: &DeviceSnapshot) -> DeviceType {
    if device.description != "M8" && device.description != "HalfKay" {
        return DeviceType::Unknown;
    }

    match device.model.as_str() {
        "Teensy MicroMod" => DeviceType::Model02,
        "Teensy 4.0" => DeviceType::Model01,
        "Teensy 4.1" => DeviceType::Headless,
        _ => DeviceType::Unknown,
    }
}
