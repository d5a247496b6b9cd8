//! Storage target abstraction
//!
//! A target is one independent object store that holds sub-objects. The
//! volume never talks to a target's transport directly; it holds one
//! [`TargetExport`] per connected target and issues every per-stripe call
//! through it.
//!
//! Submodules:
//! - `memory`: in-process target used by the demo binary and tests

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    CancelFlags, Extent, IoExtent, LockHandle, LockMode, LockPolicy, ObjectAttr, StatFs,
};

pub use memory::MemTarget;

/// Names every per-target operation; used for attribution in logs and by
/// the in-memory target's counters and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOp {
    Connect,
    Disconnect,
    Create,
    Destroy,
    Getattr,
    Setattr,
    Punch,
    Sync,
    Write,
    Read,
    Enqueue,
    Match,
    Cancel,
    CancelUnused,
    Statfs,
    Iocontrol,
    GetInfo,
    SetInfo,
}

impl TargetOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Getattr => "getattr",
            Self::Setattr => "setattr",
            Self::Punch => "punch",
            Self::Sync => "sync",
            Self::Write => "write",
            Self::Read => "read",
            Self::Enqueue => "enqueue",
            Self::Match => "match",
            Self::Cancel => "cancel",
            Self::CancelUnused => "cancel_unused",
            Self::Statfs => "statfs",
            Self::Iocontrol => "iocontrol",
            Self::GetInfo => "get_info",
            Self::SetInfo => "set_info",
        }
    }
}

impl fmt::Display for TargetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live connection to one target.
///
/// All calls address sub-objects by their target-local id. Ranges are
/// already translated into the sub-object's byte space.
#[async_trait]
pub trait TargetExport: Send + Sync {
    async fn disconnect(&self) -> Result<()>;

    async fn create(&self, attr: &ObjectAttr) -> Result<ObjectAttr>;
    async fn destroy(&self, attr: &ObjectAttr) -> Result<()>;
    async fn getattr(&self, attr: &ObjectAttr) -> Result<ObjectAttr>;
    async fn setattr(&self, attr: &ObjectAttr) -> Result<ObjectAttr>;
    async fn punch(&self, attr: &ObjectAttr, extent: Extent) -> Result<()>;
    async fn sync(&self, attr: &ObjectAttr, extent: Extent) -> Result<()>;

    async fn write(&self, sub_id: u64, io: Vec<IoExtent>) -> Result<()>;
    /// Returns one buffer per extent, zero-filled where nothing was written.
    async fn read(&self, sub_id: u64, io: Vec<IoExtent>) -> Result<Vec<Bytes>>;

    async fn enqueue(&self, sub_id: u64, policy: LockPolicy) -> Result<LockHandle>;
    async fn lock_match(&self, sub_id: u64, policy: LockPolicy) -> Result<Option<LockHandle>>;
    async fn cancel(&self, sub_id: u64, mode: LockMode, handle: LockHandle) -> Result<()>;
    async fn cancel_unused(&self, sub_id: Option<u64>, flags: CancelFlags) -> Result<()>;

    async fn statfs(&self) -> Result<StatFs>;
    async fn iocontrol(&self, code: u32, buf: Bytes) -> Result<Bytes>;
    async fn get_info(&self, key: &str) -> Result<u64>;
    async fn set_info(&self, key: &str, value: Option<u64>) -> Result<()>;
}

/// Receives target activation changes.
#[async_trait]
pub trait TargetObserver: Send + Sync {
    async fn notify(&self, target: Uuid, active: bool) -> Result<()>;
}
