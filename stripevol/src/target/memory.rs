//! In-memory target.
//!
//! Behaves like a small object store: sub-objects are byte vectors keyed by
//! id, unwritten ranges read back as zeros. Every call is counted per
//! [`TargetOp`], and any operation can be made to fail, which is how the
//! volume's partial-failure paths are exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{TargetExport, TargetObserver, TargetOp};
use crate::error::{Result, VolumeError};
use crate::registry::TargetDevice;
use crate::types::{
    AttrValid, CancelFlags, Credentials, Extent, IoExtent, LockHandle, LockMode, LockPolicy,
    OBJECT_EOF, ObjectAttr, ObjectFlags, StatFs,
};

const BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Default)]
struct MemObject {
    attr: ObjectAttr,
    data: Vec<u8>,
}

impl MemObject {
    fn reply(&self, id: u64) -> ObjectAttr {
        let mut attr = self.attr.clone();
        attr.id = id;
        attr.size = self.data.len() as u64;
        attr.blocks = (self.data.len() as u64).div_ceil(512);
        attr.blksize = BLOCK_SIZE;
        attr.valid |= AttrValid::ID | AttrValid::SIZE | AttrValid::BLOCKS | AttrValid::BLKSIZE;
        attr
    }
}

#[derive(Debug, Default)]
struct MemState {
    objects: HashMap<u64, MemObject>,
    locks: HashMap<u64, (u64, LockPolicy)>,
    next_handle: u64,
    last_id: u64,
    info: HashMap<String, Option<u64>>,
}

struct Inner {
    uuid: Uuid,
    name: String,
    attached: AtomicBool,
    set_up: AtomicBool,
    disabled: AtomicBool,
    connected: AtomicBool,
    state: Mutex<MemState>,
    statfs: Mutex<StatFs>,
    calls: Mutex<HashMap<TargetOp, usize>>,
    faults: Mutex<HashMap<TargetOp, VolumeError>>,
    latency: Mutex<Option<Duration>>,
    observer: Mutex<Option<Weak<dyn TargetObserver>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloning shares the same store; a clone is what `connect` hands out.
#[derive(Clone)]
pub struct MemTarget {
    inner: Arc<Inner>,
}

impl MemTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name)
    }

    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                uuid,
                name: name.into(),
                attached: AtomicBool::new(true),
                set_up: AtomicBool::new(true),
                disabled: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                state: Mutex::new(MemState::default()),
                statfs: Mutex::new(StatFs {
                    blocks: 1 << 20,
                    bfree: 1 << 19,
                    bavail: 1 << 19,
                    files: 1 << 16,
                    ffree: 1 << 15,
                    bsize: BLOCK_SIZE,
                    namelen: 255,
                }),
                calls: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                latency: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn set_attached(&self, attached: bool) {
        self.inner.attached.store(attached, Ordering::SeqCst);
    }

    pub fn set_set_up(&self, set_up: bool) {
        self.inner.set_up.store(set_up, Ordering::SeqCst);
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.inner.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Drops the connection from the target side; later calls fail with
    /// [`VolumeError::NotConnected`].
    pub fn sever(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    /// Enables or disables the device and tells its observer.
    pub async fn set_active(&self, active: bool) -> Result<()> {
        self.set_disabled(!active);
        let observer = lock(&self.inner.observer).as_ref().and_then(Weak::upgrade);
        match observer {
            Some(observer) => observer.notify(self.inner.uuid, active).await,
            None => Ok(()),
        }
    }

    pub fn has_observer(&self) -> bool {
        lock(&self.inner.observer)
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Makes every later `op` call fail with `err` until [`clear_faults`](Self::clear_faults).
    pub fn fail(&self, op: TargetOp, err: VolumeError) {
        lock(&self.inner.faults).insert(op, err);
    }

    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = Some(latency);
    }

    pub fn set_statfs(&self, statfs: StatFs) {
        *lock(&self.inner.statfs) = statfs;
    }

    pub fn calls(&self, op: TargetOp) -> usize {
        lock(&self.inner.calls).get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        lock(&self.inner.calls).clear();
    }

    pub fn has_object(&self, id: u64) -> bool {
        lock(&self.inner.state).objects.contains_key(&id)
    }

    pub fn object_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = lock(&self.inner.state).objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn object_data(&self, id: u64) -> Option<Vec<u8>> {
        lock(&self.inner.state).objects.get(&id).map(|o| o.data.clone())
    }

    pub fn lock_count(&self) -> usize {
        lock(&self.inner.state).locks.len()
    }

    pub fn info_value(&self, key: &str) -> Option<Option<u64>> {
        lock(&self.inner.state).info.get(key).copied()
    }

    pub fn last_id(&self) -> u64 {
        lock(&self.inner.state).last_id
    }

    /// Counts the call, applies latency, then fails if the op is faulted or
    /// the connection is gone.
    async fn enter(&self, op: TargetOp) -> Result<()> {
        *lock(&self.inner.calls).entry(op).or_insert(0) += 1;
        let latency = *lock(&self.inner.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = lock(&self.inner.faults).get(&op).cloned() {
            trace!(target_name = %self.inner.name, %op, %err, "injected fault");
            return Err(err);
        }
        if op != TargetOp::Connect && !self.is_connected() {
            return Err(VolumeError::NotConnected);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        lock(&self.inner.state)
    }
}

#[async_trait]
impl TargetDevice for MemTarget {
    fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    fn is_set_up(&self) -> bool {
        self.inner.set_up.load(Ordering::SeqCst)
    }

    fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::SeqCst)
    }

    async fn connect(&self, cred: &Credentials) -> Result<Arc<dyn TargetExport>> {
        self.enter(TargetOp::Connect).await?;
        debug!(target_name = %self.inner.name, client = %cred.client, "connect");
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }

    fn register_observer(&self, observer: Option<Weak<dyn TargetObserver>>) -> Result<()> {
        *lock(&self.inner.observer) = observer;
        Ok(())
    }
}

#[async_trait]
impl TargetExport for MemTarget {
    async fn disconnect(&self) -> Result<()> {
        self.enter(TargetOp::Disconnect).await?;
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, attr: &ObjectAttr) -> Result<ObjectAttr> {
        self.enter(TargetOp::Create).await?;
        let mut state = self.state();

        if attr.flags.contains(ObjectFlags::DELORPHAN) {
            // everything above the caller's last id is an orphan
            state.objects.retain(|id, _| *id <= attr.id);
            state.last_id = attr.id;
            return Ok(attr.clone());
        }

        let id = if attr.valid.contains(AttrValid::ID) {
            attr.id
        } else {
            state.last_id + 1
        };
        if state.objects.contains_key(&id) && !attr.flags.contains(ObjectFlags::RECREATE) {
            return Err(VolumeError::Remote(-libc::EEXIST));
        }
        state.last_id = state.last_id.max(id);
        let mut stored = attr.clone();
        stored.flags = ObjectFlags::empty();
        let object = MemObject {
            attr: stored,
            data: Vec::new(),
        };
        let reply = object.reply(id);
        state.objects.insert(id, object);
        Ok(reply)
    }

    async fn destroy(&self, attr: &ObjectAttr) -> Result<()> {
        self.enter(TargetOp::Destroy).await?;
        let mut state = self.state();
        state
            .objects
            .remove(&attr.id)
            .map(|_| ())
            .ok_or(VolumeError::NotFound(attr.id))?;
        state.locks.retain(|_, (sub_id, _)| *sub_id != attr.id);
        Ok(())
    }

    async fn getattr(&self, attr: &ObjectAttr) -> Result<ObjectAttr> {
        self.enter(TargetOp::Getattr).await?;
        self.state()
            .objects
            .get(&attr.id)
            .map(|o| o.reply(attr.id))
            .ok_or(VolumeError::NotFound(attr.id))
    }

    async fn setattr(&self, attr: &ObjectAttr) -> Result<ObjectAttr> {
        self.enter(TargetOp::Setattr).await?;
        let mut state = self.state();
        let object = state
            .objects
            .get_mut(&attr.id)
            .ok_or(VolumeError::NotFound(attr.id))?;
        if attr.valid.contains(AttrValid::SIZE) {
            object.data.resize(attr.size as usize, 0);
        }
        if attr.valid.contains(AttrValid::MODE) {
            object.attr.mode = attr.mode;
        }
        if attr.valid.contains(AttrValid::ATIME) {
            object.attr.atime = attr.atime;
        }
        if attr.valid.contains(AttrValid::MTIME) {
            object.attr.mtime = attr.mtime;
        }
        if attr.valid.contains(AttrValid::CTIME) {
            object.attr.ctime = attr.ctime;
        }
        object.attr.valid |= attr.valid & !AttrValid::SIZE;
        Ok(object.reply(attr.id))
    }

    async fn punch(&self, attr: &ObjectAttr, extent: Extent) -> Result<()> {
        self.enter(TargetOp::Punch).await?;
        let mut state = self.state();
        let object = state
            .objects
            .get_mut(&attr.id)
            .ok_or(VolumeError::NotFound(attr.id))?;
        let len = object.data.len() as u64;
        if extent.end == OBJECT_EOF {
            object.data.truncate(extent.start.min(len) as usize);
        } else if extent.start < len {
            let end = extent.end.min(len) as usize;
            object.data[extent.start as usize..end].fill(0);
        }
        Ok(())
    }

    async fn sync(&self, attr: &ObjectAttr, _extent: Extent) -> Result<()> {
        self.enter(TargetOp::Sync).await?;
        if !self.state().objects.contains_key(&attr.id) {
            return Err(VolumeError::NotFound(attr.id));
        }
        Ok(())
    }

    async fn write(&self, sub_id: u64, io: Vec<IoExtent>) -> Result<()> {
        self.enter(TargetOp::Write).await?;
        let mut state = self.state();
        let object = state
            .objects
            .get_mut(&sub_id)
            .ok_or(VolumeError::NotFound(sub_id))?;
        for ext in io {
            if ext.data.len() != ext.len {
                return Err(VolumeError::Fault);
            }
            let start = ext.offset as usize;
            let end = start + ext.len;
            if object.data.len() < end {
                object.data.resize(end, 0);
            }
            object.data[start..end].copy_from_slice(&ext.data);
        }
        Ok(())
    }

    async fn read(&self, sub_id: u64, io: Vec<IoExtent>) -> Result<Vec<Bytes>> {
        self.enter(TargetOp::Read).await?;
        let state = self.state();
        let object = state
            .objects
            .get(&sub_id)
            .ok_or(VolumeError::NotFound(sub_id))?;
        let out = io
            .iter()
            .map(|ext| {
                let mut buf = vec![0u8; ext.len];
                let start = ext.offset as usize;
                let end = (start + ext.len).min(object.data.len());
                if end > start {
                    buf[..end - start].copy_from_slice(&object.data[start..end]);
                }
                Bytes::from(buf)
            })
            .collect();
        Ok(out)
    }

    async fn enqueue(&self, sub_id: u64, policy: LockPolicy) -> Result<LockHandle> {
        self.enter(TargetOp::Enqueue).await?;
        let mut state = self.state();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.locks.insert(handle, (sub_id, policy));
        Ok(LockHandle(handle))
    }

    async fn lock_match(&self, sub_id: u64, policy: LockPolicy) -> Result<Option<LockHandle>> {
        self.enter(TargetOp::Match).await?;
        let mut state = self.state();
        let found = state.locks.values().any(|(id, held)| {
            *id == sub_id
                && (held.mode == policy.mode || held.mode == LockMode::Write)
                && held.extent.contains(&policy.extent)
        });
        if !found {
            return Ok(None);
        }
        // a match takes its own reference, released through cancel
        state.next_handle += 1;
        let handle = state.next_handle;
        state.locks.insert(handle, (sub_id, policy));
        Ok(Some(LockHandle(handle)))
    }

    async fn cancel(&self, sub_id: u64, _mode: LockMode, handle: LockHandle) -> Result<()> {
        self.enter(TargetOp::Cancel).await?;
        let mut state = self.state();
        match state.locks.get(&handle.0) {
            Some((id, _)) if *id == sub_id => {
                state.locks.remove(&handle.0);
                Ok(())
            }
            _ => Err(VolumeError::invalid(format!(
                "no lock {} on object {sub_id:#x}",
                handle.0
            ))),
        }
    }

    async fn cancel_unused(&self, sub_id: Option<u64>, flags: CancelFlags) -> Result<()> {
        self.enter(TargetOp::CancelUnused).await?;
        trace!(target_name = %self.inner.name, ?sub_id, ?flags, "cancel unused");
        let mut state = self.state();
        match sub_id {
            Some(sub_id) => state.locks.retain(|_, (id, _)| *id != sub_id),
            None => state.locks.clear(),
        }
        Ok(())
    }

    async fn statfs(&self) -> Result<StatFs> {
        self.enter(TargetOp::Statfs).await?;
        Ok(*lock(&self.inner.statfs))
    }

    async fn iocontrol(&self, _code: u32, buf: Bytes) -> Result<Bytes> {
        self.enter(TargetOp::Iocontrol).await?;
        Ok(buf)
    }

    async fn get_info(&self, key: &str) -> Result<u64> {
        self.enter(TargetOp::GetInfo).await?;
        match key {
            "last_id" => Ok(self.state().last_id),
            _ => Err(VolumeError::NotSupported),
        }
    }

    async fn set_info(&self, key: &str, value: Option<u64>) -> Result<()> {
        self.enter(TargetOp::SetInfo).await?;
        let mut state = self.state();
        if key == "next_id" {
            if let Some(next) = value {
                state.last_id = next.saturating_sub(1);
            }
        }
        state.info.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> (MemTarget, Arc<dyn TargetExport>) {
        let t = MemTarget::new("ost");
        let exp = t.connect(&Credentials::new("test")).await.unwrap();
        (t, exp)
    }

    #[tokio::test]
    async fn test_write_read_zero_fills_holes() {
        let (_t, exp) = connected().await;
        exp.create(&ObjectAttr::with_id(5)).await.unwrap();
        exp.write(
            5,
            vec![IoExtent {
                offset: 4,
                len: 3,
                data: Bytes::from_static(b"abc"),
            }],
        )
        .await
        .unwrap();
        let out = exp
            .read(
                5,
                vec![IoExtent {
                    offset: 2,
                    len: 8,
                    data: Bytes::new(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(&out[0][..], b"\0\0abc\0\0\0");
        let attr = exp.getattr(&ObjectAttr::with_id(5)).await.unwrap();
        assert_eq!(attr.size, 7);
    }

    #[tokio::test]
    async fn test_fault_and_counters() {
        let (t, exp) = connected().await;
        t.fail(TargetOp::Create, VolumeError::NoSpace);
        assert_eq!(
            exp.create(&ObjectAttr::with_id(1)).await,
            Err(VolumeError::NoSpace)
        );
        assert_eq!(t.calls(TargetOp::Create), 1);
        t.clear_faults();
        exp.create(&ObjectAttr::with_id(1)).await.unwrap();
        assert!(t.has_object(1));
    }

    #[tokio::test]
    async fn test_severed_target_reports_not_connected() {
        let (t, exp) = connected().await;
        t.sever();
        assert_eq!(exp.statfs().await, Err(VolumeError::NotConnected));
    }

    #[tokio::test]
    async fn test_match_takes_reference() {
        let (t, exp) = connected().await;
        let policy = LockPolicy::new(LockMode::Write, Extent::new(0, 100));
        let h = exp.enqueue(9, policy).await.unwrap();
        let read = LockPolicy::new(LockMode::Read, Extent::new(10, 20));
        let m = exp.lock_match(9, read).await.unwrap().unwrap();
        assert_ne!(h, m);
        assert_eq!(t.lock_count(), 2);
        exp.cancel(9, LockMode::Read, m).await.unwrap();
        assert_eq!(t.lock_count(), 1);
        assert!(exp.lock_match(9, LockPolicy::new(LockMode::Read, Extent::new(50, 200))).await.unwrap().is_none());
    }
}
