// Device presence: classification of raw watcher snapshots and the
// debounced reconciler that owns the canonical device map.

pub mod reconciler;
pub mod status;

pub use reconciler::{DEBOUNCE_WINDOW, DeviceReconciler};
pub use status::{DeviceStatus, DeviceType, device_is_missing, device_status, device_type};
