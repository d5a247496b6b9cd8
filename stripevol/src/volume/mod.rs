//! Striped volume
//!
//! A [`Volume`] presents one logical object namespace over an ordered set of
//! targets. It owns the target descriptors and their liveness, and exposes
//! the logical-object operations, each of which fans out to the targets that
//! hold the object's stripes and folds the replies back into one result.
//!
//! Submodules:
//! - `lifecycle`: setup, connect/disconnect, liveness notifications
//! - `ops`: object operations (create family, destroy, getattr, setattr,
//!   punch, sync, statfs)
//! - `io`: striped reads and writes
//! - `lock`: extent lock enqueue/match/cancel
//! - `info`: iocontrol, get_info and set_info

mod info;
mod io;
mod lifecycle;
mod lock;
mod ops;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::warn;
use uuid::Uuid;

use crate::config::VolumeDesc;
use crate::error::{Result, VolumeError};
use crate::registry::DeviceTable;
use crate::target::{TargetExport, TargetObserver};
use crate::types::Credentials;

pub use info::{ConfigReport, InfoQuery, InfoValue, IoctlCmd, IoctlReply, SetInfo, TargetStatus};

/// Where a volume is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Placement parameters for a new object. Unset fields fall back to the
/// volume defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripeOptions {
    pub stripe_count: Option<usize>,
    pub stripe_size: Option<u64>,
    /// Target index of the first stripe; without it a rotating cursor picks.
    pub stripe_offset: Option<usize>,
}

/// Proof of one successful [`Volume::connect`]; give it back to
/// [`Volume::disconnect`].
#[derive(Debug)]
#[must_use = "a connection handle must be passed back to disconnect"]
pub struct VolumeHandle {
    volume_id: Uuid,
    client: String,
}

impl VolumeHandle {
    pub fn volume_id(&self) -> Uuid {
        self.volume_id
    }

    pub fn client(&self) -> &str {
        &self.client
    }
}

pub(crate) struct TargetDesc {
    pub(crate) uuid: Uuid,
    pub(crate) export: Option<Arc<dyn TargetExport>>,
    pub(crate) active: bool,
}

pub(crate) struct VolumeState {
    /// Sized once at setup and never reallocated.
    pub(crate) targets: Vec<TargetDesc>,
    pub(crate) active_count: usize,
    pub(crate) refcount: usize,
    pub(crate) conn: ConnState,
    pub(crate) credentials: Option<Credentials>,
}

pub struct Volume {
    this: Weak<Volume>,
    desc: VolumeDesc,
    devices: Arc<DeviceTable>,
    state: Mutex<VolumeState>,
    /// Serializes connect, disconnect and reactivation.
    lifecycle: tokio::sync::Mutex<()>,
    observer: RwLock<Option<Weak<dyn TargetObserver>>>,
    next_start: AtomicUsize,
}

impl Volume {
    fn state(&self) -> MutexGuard<'_, VolumeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arc(&self) -> Option<Arc<Volume>> {
        self.this.upgrade()
    }

    pub fn desc(&self) -> &VolumeDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn target_count(&self) -> usize {
        self.desc.targets.len()
    }

    pub fn target_uuid(&self, idx: usize) -> Option<Uuid> {
        self.desc.targets.get(idx).copied()
    }

    pub fn target_index(&self, uuid: &Uuid) -> Option<usize> {
        self.desc.targets.iter().position(|t| t == uuid)
    }

    pub fn conn_state(&self) -> ConnState {
        self.state().conn
    }

    pub fn refcount(&self) -> usize {
        self.state().refcount
    }

    pub fn active_target_count(&self) -> usize {
        self.state().active_count
    }

    pub fn is_active(&self, idx: usize) -> bool {
        self.state().targets.get(idx).is_some_and(|t| t.active)
    }

    pub fn is_connected(&self, idx: usize) -> bool {
        self.state()
            .targets
            .get(idx)
            .is_some_and(|t| t.export.is_some())
    }

    /// Installs the upstream observer that hears about liveness changes
    /// after this volume has applied them.
    pub fn set_observer(&self, observer: Option<Weak<dyn TargetObserver>>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }

    /// Connection handle of target `idx` and whether it is active, copied
    /// out so the remote call can run without the lock.
    pub(crate) fn snapshot(&self, idx: usize) -> Option<(Arc<dyn TargetExport>, bool)> {
        let state = self.state();
        let target = state.targets.get(idx)?;
        target.export.clone().map(|e| (e, target.active))
    }

    /// Indices of active targets, in target order.
    pub(crate) fn active_targets(&self) -> Vec<usize> {
        self.state()
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.active && t.export.is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// Marks target `idx` inactive when `err` means its connection is gone,
    /// and passes the change upstream.
    pub(crate) async fn record_failure(&self, idx: usize, err: &VolumeError) {
        let Some(uuid) = self.mark_lost(idx, err) else {
            return;
        };
        if let Err(e) = self.notify_upstream(uuid, false).await {
            warn!(volume = %self.desc.name, target = %uuid, idx, err = %e, "upstream observer rejected deactivation");
        }
    }

    /// Flips target `idx` inactive for a connection-loss error. Returns its
    /// uuid when the flag actually changed.
    fn mark_lost(&self, idx: usize, err: &VolumeError) -> Option<Uuid> {
        if !err.is_connection_loss() {
            return None;
        }
        let mut state = self.state();
        let VolumeState {
            targets,
            active_count,
            ..
        } = &mut *state;
        let target = targets.get_mut(idx)?;
        if !target.active {
            return None;
        }
        target.active = false;
        *active_count -= 1;
        warn!(
            volume = %self.desc.name,
            target = %target.uuid,
            idx,
            %err,
            active = *active_count,
            "target marked inactive after connection loss"
        );
        Some(target.uuid)
    }

    /// Hands a liveness change to the upstream observer, if one is set.
    pub(crate) async fn notify_upstream(&self, target: Uuid, active: bool) -> Result<()> {
        let upstream = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match upstream {
            Some(observer) => observer.notify(target, active).await,
            None => Ok(()),
        }
    }
}
