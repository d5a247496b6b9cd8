use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, VolumeError};
use crate::target::{TargetExport, TargetObserver};
use crate::types::Credentials;

/// A configured device that can hand out connections to one target.
#[async_trait]
pub trait TargetDevice: Send + Sync {
    fn uuid(&self) -> Uuid;

    fn name(&self) -> &str;

    fn is_attached(&self) -> bool;

    fn is_set_up(&self) -> bool;

    /// Administratively disabled devices are not connected until re-enabled.
    fn is_disabled(&self) -> bool;

    async fn connect(&self, cred: &Credentials) -> Result<Arc<dyn TargetExport>>;

    /// Installs (or with `None`, removes) the observer that hears about
    /// this device's activation changes.
    fn register_observer(&self, observer: Option<Weak<dyn TargetObserver>>) -> Result<()>;
}

#[derive(Default)]
pub struct DeviceTable {
    devices: RwLock<HashMap<Uuid, Arc<dyn TargetDevice>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, device: Arc<dyn TargetDevice>) -> Result<()> {
        let uuid = device.uuid();
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.contains_key(&uuid) {
            return Err(VolumeError::invalid(format!(
                "device {uuid} is already attached"
            )));
        }
        debug!(%uuid, name = device.name(), "attach device");
        devices.insert(uuid, device);
        Ok(())
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<Arc<dyn TargetDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
    }

    pub fn detach(&self, uuid: &Uuid) -> Option<Arc<dyn TargetDevice>> {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uuid)
    }

    pub fn clear(&self) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
