//! Parameter and reply types shared by the volume and its targets.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Open end of a range: "up to the end of the object".
pub const OBJECT_EOF: u64 = u64::MAX;

bitflags! {
    /// Which fields of an [`ObjectAttr`] carry meaning.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrValid: u32 {
        const ID = 1 << 0;
        const SIZE = 1 << 1;
        const BLOCKS = 1 << 2;
        const BLKSIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
        const CTIME = 1 << 6;
        const MODE = 1 << 7;
        const FLAGS = 1 << 8;
        const TYPE = 1 << 9;
    }
}

impl AttrValid {
    /// Fields a striped setattr may change.
    pub fn settable() -> Self {
        Self::ID
            | Self::TYPE
            | Self::MODE
            | Self::ATIME
            | Self::MTIME
            | Self::CTIME
            | Self::FLAGS
            | Self::SIZE
    }
}

bitflags! {
    /// Intent flags carried on create requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        /// Orphan cleanup probe rather than a real create.
        const DELORPHAN = 1 << 0;
        /// Recreate a known sub-object id in place.
        const RECREATE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CancelFlags: u32 {
        const LOCAL_ONLY = 1 << 0;
        const ASYNC = 1 << 1;
    }
}

/// Object attributes as exchanged with targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttr {
    pub id: u64,
    pub valid: AttrValid,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub mode: u32,
    pub flags: ObjectFlags,
}

impl Default for ObjectAttr {
    fn default() -> Self {
        Self {
            id: 0,
            valid: AttrValid::empty(),
            size: 0,
            blocks: 0,
            blksize: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            mode: 0,
            flags: ObjectFlags::empty(),
        }
    }
}

impl ObjectAttr {
    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            valid: AttrValid::ID,
            ..Default::default()
        }
    }

    pub fn set_size(mut self, size: u64) -> Self {
        self.size = size;
        self.valid |= AttrValid::SIZE;
        self
    }

    pub fn set_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self.valid |= AttrValid::MTIME;
        self
    }

    pub fn set_ctime(mut self, ctime: i64) -> Self {
        self.ctime = ctime;
        self.valid |= AttrValid::CTIME;
        self
    }

    pub fn set_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self.valid |= AttrValid::MODE;
        self
    }

    /// Copy of `self` re-addressed to a sub-object.
    pub(crate) fn narrowed(&self, sub_id: u64) -> Self {
        let mut attr = self.clone();
        attr.id = sub_id;
        attr.valid |= AttrValid::ID;
        attr
    }
}

/// Half-open byte range `[start, end)`; `end == OBJECT_EOF` means open ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn to_eof(start: u64) -> Self {
        Self {
            start,
            end: OBJECT_EOF,
        }
    }

    pub fn whole() -> Self {
        Self::to_eof(0)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, other: &Extent) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One contiguous piece of a read or write, addressed in stripe-local bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoExtent {
    pub offset: u64,
    pub len: usize,
    /// Payload for writes; empty for reads.
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub mode: LockMode,
    pub extent: Extent,
}

impl LockPolicy {
    pub fn new(mode: LockMode, extent: Extent) -> Self {
        Self { mode, extent }
    }

    pub(crate) fn narrowed(&self, extent: Extent) -> Self {
        Self {
            mode: self.mode,
            extent,
        }
    }
}

/// Lock handle as issued by a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(pub u64);

/// Volume-level lock: one optional target handle per stripe, indexed by
/// stripe number regardless of the order in which targets answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLockHandle {
    mode: LockMode,
    handles: Vec<Option<LockHandle>>,
}

impl VolumeLockHandle {
    pub(crate) fn new(mode: LockMode, stripe_count: usize) -> Self {
        Self {
            mode,
            handles: vec![None; stripe_count],
        }
    }

    pub(crate) fn set(&mut self, stripe: usize, handle: LockHandle) {
        if let Some(slot) = self.handles.get_mut(stripe) {
            *slot = Some(handle);
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn get(&self, stripe: usize) -> Option<LockHandle> {
        self.handles.get(stripe).copied().flatten()
    }

    pub fn held(&self) -> impl Iterator<Item = (usize, LockHandle)> + '_ {
        self.handles
            .iter()
            .enumerate()
            .filter_map(|(stripe, h)| h.map(|h| (stripe, h)))
    }

    pub fn is_empty(&self) -> bool {
        self.handles.iter().all(Option::is_none)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client: String,
}

impl Credentials {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrowed_attr_keeps_fields() {
        let attr = ObjectAttr::with_id(7).set_size(100).set_mode(0o644);
        let sub = attr.narrowed(99);
        assert_eq!(sub.id, 99);
        assert_eq!(sub.size, 100);
        assert!(sub.valid.contains(AttrValid::ID | AttrValid::SIZE | AttrValid::MODE));
    }

    #[test]
    fn test_lock_handle_keyed_by_stripe() {
        let mut lockh = VolumeLockHandle::new(LockMode::Write, 3);
        assert!(lockh.is_empty());
        lockh.set(2, LockHandle(20));
        lockh.set(0, LockHandle(5));
        assert_eq!(lockh.get(1), None);
        let held: Vec<_> = lockh.held().collect();
        assert_eq!(held, vec![(0, LockHandle(5)), (2, LockHandle(20))]);
    }
}
