use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ConnState, TargetDesc, Volume, VolumeHandle, VolumeState};
use crate::config::VolumeConfig;
use crate::error::{Result, VolumeError};
use crate::registry::{DeviceTable, TargetDevice};
use crate::target::{TargetExport, TargetObserver};
use crate::types::Credentials;

/// Steps a first connect has taken, undone in reverse on failure.
enum Undo {
    Observer(usize),
    Connection(usize),
}

impl Volume {
    /// Validates `config` and builds an unconnected volume over `devices`.
    pub fn setup(config: &VolumeConfig, devices: Arc<DeviceTable>) -> Result<Arc<Volume>> {
        let desc = config.validate()?;
        let targets = desc
            .targets
            .iter()
            .map(|uuid| TargetDesc {
                uuid: *uuid,
                export: None,
                active: false,
            })
            .collect();
        info!(
            volume = %desc.name,
            targets = desc.targets.len(),
            stripe_size = desc.default_stripe_size,
            stripe_count = desc.default_stripe_count,
            "volume set up"
        );
        Ok(Arc::new_cyclic(|this| Volume {
            this: this.clone(),
            desc,
            devices,
            state: Mutex::new(VolumeState {
                targets,
                active_count: 0,
                refcount: 0,
                conn: ConnState::Unconnected,
                credentials: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            observer: RwLock::new(None),
            next_start: AtomicUsize::new(0),
        }))
    }

    fn as_observer(&self) -> Weak<dyn TargetObserver> {
        self.this.clone()
    }

    fn device(&self, uuid: &Uuid) -> Result<Arc<dyn TargetDevice>> {
        self.devices
            .lookup(uuid)
            .ok_or(VolumeError::UnknownTarget(*uuid))
    }

    /// Takes a reference on the volume's target connections, opening them
    /// on the first call.
    ///
    /// The reference is only taken once every target has been walked, so a
    /// first connect that fails or is dropped part way leaves the volume
    /// unconnected with its count unchanged.
    pub async fn connect(&self, cred: &Credentials) -> Result<VolumeHandle> {
        let _lifecycle = self.lifecycle.lock().await;
        let handle = VolumeHandle {
            volume_id: self.desc.volume_id,
            client: cred.client.clone(),
        };
        {
            let mut state = self.state();
            if state.refcount > 0 {
                state.refcount += 1;
                debug!(volume = %self.desc.name, refcount = state.refcount, "connect: already connected");
                return Ok(handle);
            }
            state.conn = ConnState::Connecting;
            state.credentials = Some(cred.clone());
        }

        let mut walk = ConnectGuard {
            volume: self,
            undo: Vec::new(),
            committed: false,
        };
        for (idx, uuid) in self.desc.targets.iter().enumerate() {
            if let Err(err) = self.connect_target(idx, uuid, cred, &mut walk.undo).await {
                error!(volume = %self.desc.name, target = %uuid, idx, %err, "connect failed, rolling back");
                walk.rollback().await;
                return Err(err);
            }
        }
        walk.commit();

        let mut state = self.state();
        state.refcount += 1;
        state.conn = ConnState::Connected;
        info!(
            volume = %self.desc.name,
            active = state.active_count,
            targets = self.desc.targets.len(),
            "volume connected"
        );
        Ok(handle)
    }

    async fn connect_target(
        &self,
        idx: usize,
        uuid: &Uuid,
        cred: &Credentials,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        let device = self.device(uuid)?;
        if !device.is_attached() {
            return Err(VolumeError::NotReady(*uuid, "device not attached".into()));
        }
        if !device.is_set_up() {
            return Err(VolumeError::NotReady(*uuid, "device not set up".into()));
        }

        if device.is_disabled() {
            // stay registered so a later activation reaches us
            device.register_observer(Some(self.as_observer()))?;
            undo.push(Undo::Observer(idx));
            debug!(volume = %self.desc.name, target = %uuid, idx, "target disabled, not connecting");
            return Ok(());
        }

        let export = device.connect(cred).await?;
        if let Err(err) = device.register_observer(Some(self.as_observer())) {
            if let Err(e) = export.disconnect().await {
                warn!(target = %uuid, %e, "disconnect after failed observer registration");
            }
            return Err(err);
        }
        undo.push(Undo::Observer(idx));

        let mut state = self.state();
        let VolumeState {
            targets,
            active_count,
            ..
        } = &mut *state;
        let target = &mut targets[idx];
        target.export = Some(export);
        if !target.active {
            target.active = true;
            *active_count += 1;
        }
        undo.push(Undo::Connection(idx));
        debug!(volume = %self.desc.name, target = %uuid, idx, "target connected");
        Ok(())
    }

    /// Deactivates target `idx` and takes its connection handle.
    fn release_target(&self, idx: usize) -> Option<Arc<dyn TargetExport>> {
        let mut state = self.state();
        let VolumeState {
            targets,
            active_count,
            ..
        } = &mut *state;
        let target = &mut targets[idx];
        if target.active {
            target.active = false;
            *active_count -= 1;
        }
        target.export.take()
    }

    fn unregister_observer(&self, idx: usize) {
        let uuid = self.desc.targets[idx];
        if let Some(device) = self.devices.lookup(&uuid) {
            if let Err(err) = device.register_observer(None) {
                warn!(volume = %self.desc.name, target = %uuid, %err, "unregister observer failed");
            }
        }
    }

    /// Disconnects handles that were taken out of the volume by an
    /// operation that never finished.
    fn spawn_disconnects(&self, exports: Vec<(usize, Arc<dyn TargetExport>)>) {
        if exports.is_empty() {
            return;
        }
        let name = self.desc.name.clone();
        match Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    for (idx, export) in exports {
                        if let Err(err) = export.disconnect().await {
                            warn!(volume = %name, idx, %err, "background disconnect failed");
                        }
                    }
                });
            }
            Err(_) => {
                warn!(volume = %name, count = exports.len(), "no runtime, dropping target connections");
            }
        }
    }

    /// Drops one reference; the last one tears every target connection down.
    pub async fn disconnect(&self, handle: VolumeHandle) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if handle.volume_id != self.desc.volume_id {
            return Err(VolumeError::invalid("handle belongs to another volume"));
        }
        // every target leaves the volume in one step; only the remote
        // disconnects run afterwards
        let pending = {
            let mut state = self.state();
            if state.refcount == 0 {
                return Err(VolumeError::invalid("volume is not connected"));
            }
            state.refcount -= 1;
            if state.refcount > 0 {
                debug!(volume = %self.desc.name, refcount = state.refcount, "disconnect: still referenced");
                return Ok(());
            }
            state.conn = ConnState::Disconnecting;
            let VolumeState {
                targets,
                active_count,
                ..
            } = &mut *state;
            *active_count = 0;
            targets
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, target)| {
                    let was_active = mem::replace(&mut target.active, false);
                    target.export.take().map(|export| (idx, export, was_active))
                })
                .collect::<VecDeque<_>>()
        };
        for idx in 0..self.desc.targets.len() {
            self.unregister_observer(idx);
        }

        let mut teardown = Teardown {
            volume: self,
            pending,
        };
        let mut rc = Ok(());
        while let Some((idx, export, was_active)) = teardown.pending.pop_front() {
            if let Err(err) = export.disconnect().await {
                let uuid = self.desc.targets[idx];
                if was_active {
                    error!(volume = %self.desc.name, target = %uuid, idx, %err, "target disconnect failed");
                    if rc.is_ok() {
                        rc = Err(err);
                    }
                } else {
                    warn!(volume = %self.desc.name, target = %uuid, idx, %err, "inactive target disconnect failed");
                }
            }
        }
        drop(teardown);

        info!(volume = %self.desc.name, client = handle.client(), "volume disconnected");
        rc
    }

    /// Applies a liveness change for `target`, then passes it upstream.
    pub async fn notify(&self, target: Uuid, active: bool) -> Result<()> {
        let idx = self
            .target_index(&target)
            .ok_or(VolumeError::UnknownTarget(target))?;

        {
            let _guard = self.lifecycle.lock().await;
            let needs_connect = {
                let state = self.state();
                let desc = &state.targets[idx];
                if desc.active == active {
                    debug!(volume = %self.desc.name, %target, active, "notify: no change");
                    return Ok(());
                }
                active && desc.export.is_none()
            };

            let export = if needs_connect {
                let cred = self.state().credentials.clone().ok_or_else(|| {
                    VolumeError::NotReady(target, "volume is not connected".into())
                })?;
                Some(self.device(&target)?.connect(&cred).await?)
            } else {
                None
            };

            let mut state = self.state();
            let VolumeState {
                targets,
                active_count,
                ..
            } = &mut *state;
            let desc = &mut targets[idx];
            if let Some(export) = export {
                desc.export.get_or_insert(export);
            }
            if desc.active != active {
                desc.active = active;
                if active {
                    *active_count += 1;
                } else {
                    *active_count -= 1;
                }
            }
            info!(
                volume = %self.desc.name,
                %target,
                idx,
                active,
                active_count = *active_count,
                "target liveness changed"
            );
        }

        self.notify_upstream(target, active).await
    }
}

/// Rolls a first connect back unless it reaches [`commit`](Self::commit),
/// including when the connecting future is dropped.
struct ConnectGuard<'a> {
    volume: &'a Volume,
    undo: Vec<Undo>,
    committed: bool,
}

impl ConnectGuard<'_> {
    /// Undoes the recorded steps in reverse, waiting for each disconnect.
    async fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Connection(idx) => {
                    if let Some(export) = self.volume.release_target(idx) {
                        if let Err(err) = export.disconnect().await {
                            warn!(volume = %self.volume.desc.name, idx, %err, "rollback disconnect failed");
                        }
                    }
                }
                Undo::Observer(idx) => self.volume.unregister_observer(idx),
            }
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut orphaned = Vec::new();
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Connection(idx) => {
                    if let Some(export) = self.volume.release_target(idx) {
                        orphaned.push((idx, export));
                    }
                }
                Undo::Observer(idx) => self.volume.unregister_observer(idx),
            }
        }
        {
            let mut state = self.volume.state();
            state.conn = ConnState::Unconnected;
            state.credentials = None;
        }
        if !orphaned.is_empty() {
            warn!(volume = %self.volume.desc.name, count = orphaned.len(), "connect abandoned, undoing");
        }
        self.volume.spawn_disconnects(orphaned);
    }
}

/// Connections still to be closed by a last disconnect. Whatever is left
/// when it is dropped is closed in the background.
struct Teardown<'a> {
    volume: &'a Volume,
    pending: VecDeque<(usize, Arc<dyn TargetExport>, bool)>,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.volume.state();
            state.conn = ConnState::Unconnected;
            state.credentials = None;
        }
        let rest = self
            .pending
            .drain(..)
            .map(|(idx, export, _)| (idx, export))
            .collect();
        self.volume.spawn_disconnects(rest);
    }
}

#[async_trait]
impl TargetObserver for Volume {
    async fn notify(&self, target: Uuid, active: bool) -> Result<()> {
        Volume::notify(self, target, active).await
    }
}
