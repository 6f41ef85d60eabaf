// Explicit application context.
//
// One UpdaterCore is constructed by the host and owns every reducer, the
// catalog service and the listener registrations. There are no module-level
// singletons: startup is an explicit, idempotent call and teardown revokes
// the subscriptions and cancels any pending debounce window.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::device::{DeviceReconciler, reconciler};
use crate::events::{EventHub, ListenError};
use crate::firmware::CatalogService;
use crate::installation::{self, InstallationTracker};

#[derive(Default)]
struct ListenerTasks {
    device_task: Option<JoinHandle<()>>,
    flashing_task: Option<JoinHandle<()>>,
}

pub struct UpdaterCore {
    hub: EventHub,
    devices: Arc<Mutex<DeviceReconciler>>,
    installation: Arc<Mutex<InstallationTracker>>,
    catalog: CatalogService,
    listeners: Mutex<Option<ListenerTasks>>,
}

impl UpdaterCore {
    pub fn new(hub: EventHub) -> Self {
        let installation = Arc::new(Mutex::new(InstallationTracker::new(hub.clone())));
        let devices = Arc::new(Mutex::new(DeviceReconciler::new(Arc::clone(&installation))));
        let catalog = CatalogService::new(hub.clone());

        Self {
            hub,
            devices,
            installation,
            catalog,
            listeners: Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn devices(&self) -> Arc<Mutex<DeviceReconciler>> {
        Arc::clone(&self.devices)
    }

    pub fn installation(&self) -> Arc<Mutex<InstallationTracker>> {
        Arc::clone(&self.installation)
    }

    pub fn catalog(&self) -> &CatalogService {
        &self.catalog
    }

    /// Registers the push-event listeners. Idempotent: a listener that is
    /// already running is left alone, so repeated start calls are no-ops and
    /// a partially failed startup can be retried.
    ///
    /// A flashing-channel failure leaves the whole flash workflow dead and
    /// is returned immediately; a device-channel failure is logged and
    /// returned, but the rest of the core keeps running without it.
    pub async fn start_listeners(&self) -> Result<(), ListenError> {
        let mut guard = self.listeners.lock().unwrap();
        let tasks = guard.get_or_insert_with(ListenerTasks::default);

        if tasks.flashing_task.is_none() {
            let flashing_rx = self.hub.subscribe_flashing().map_err(|err| {
                error!("flashing listener registration failed: {err}");
                err
            })?;

            tasks.flashing_task = Some(tokio::spawn(installation::run(
                Arc::clone(&self.installation),
                flashing_rx,
            )));
            debug!("flashing listener registered");
        }

        if tasks.device_task.is_none() {
            match self.hub.subscribe_devices() {
                Ok(device_rx) => {
                    tasks.device_task = Some(tokio::spawn(reconciler::run(
                        Arc::clone(&self.devices),
                        device_rx,
                    )));
                    debug!("device listener registered");
                }
                Err(err) => {
                    error!("device listener registration failed: {err}");
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Revokes every subscription and cancels pending debounce timers.
    /// A later [`UpdaterCore::start_listeners`] registers fresh listeners.
    pub fn teardown(&self) {
        if let Some(tasks) = self.listeners.lock().unwrap().take() {
            if let Some(task) = tasks.device_task {
                task.abort();
            }
            if let Some(task) = tasks.flashing_task {
                task.abort();
            }

            info!("updater core listeners torn down");
        }
    }
}

impl Drop for UpdaterCore {
    fn drop(&mut self) {
        self.teardown();
    }
}
