// State-reconciliation core of the M8 firmware updater.
//
// Raw device-presence events, flashing progress events and the remote
// firmware catalog come in; stable, canonical application state comes out.
// Presentation, the event transport and hardware access live in the host.

pub mod context;
pub mod device;
pub mod events;
pub mod firmware;
pub mod installation;
pub mod models;

pub use context::UpdaterCore;
