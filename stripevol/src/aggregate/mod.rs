//! Reduction of per-stripe replies into logical results.
//!
//! The merge rules live here: attribute merge for getattr/setattr, layout
//! assembly for create, buffer reassembly for reads and counter sums for
//! statfs. Anything that needs to call targets again (lock release on
//! abort) stays with the volume.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CreateError, Result, VolumeError};
use crate::layout::{StripeInfo, StripeLayout};
use crate::request::RequestSet;
use crate::types::{AttrValid, ObjectAttr, StatFs};

/// How timestamps from different stripes are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrMergePolicy {
    /// The lowest answering stripe is authoritative.
    #[default]
    FirstStripe,
    /// The newest timestamp over all stripes.
    Latest,
}

/// Folds the reply of `stripe` into `merged`.
///
/// The first reply seeds the result and is re-addressed to the logical
/// object; later replies widen the size, add up block counts and, under
/// [`AttrMergePolicy::Latest`], advance the timestamps.
pub fn merge_attrs(
    layout: &StripeLayout,
    merged: &mut Option<ObjectAttr>,
    stripe: usize,
    reply: &ObjectAttr,
    policy: AttrMergePolicy,
) {
    let size = layout.stripe_size_to_object(stripe, reply.size);
    let Some(attr) = merged.as_mut() else {
        let mut attr = reply.clone();
        attr.id = layout.object_id();
        attr.size = size;
        *merged = Some(attr);
        return;
    };

    if reply.valid.contains(AttrValid::SIZE) {
        attr.size = attr.size.max(size);
        attr.valid |= AttrValid::SIZE;
    }
    if reply.valid.contains(AttrValid::BLOCKS) {
        attr.blocks = attr.blocks.saturating_add(reply.blocks);
        attr.valid |= AttrValid::BLOCKS;
    }
    if reply.valid.contains(AttrValid::BLKSIZE) {
        attr.blksize = attr.blksize.saturating_add(reply.blksize);
        attr.valid |= AttrValid::BLKSIZE;
    }
    if policy == AttrMergePolicy::Latest {
        attr.atime = attr.atime.max(reply.atime);
        attr.mtime = attr.mtime.max(reply.mtime);
        attr.ctime = attr.ctime.max(reply.ctime);
    }
}

/// Merged attributes of every stripe that answered.
pub(crate) fn fini_attrs(set: &RequestSet<ObjectAttr>, policy: AttrMergePolicy) -> Result<ObjectAttr> {
    set.status()?;
    let layout = set.layout.as_deref().ok_or(VolumeError::Fault)?;
    let mut merged = None;
    for (req, reply) in set.replies() {
        merge_attrs(layout, &mut merged, req.stripe, reply, policy);
    }
    merged.ok_or(VolumeError::Unavailable)
}

/// Turns a finished create set into the object's layout.
///
/// Every attempted stripe stays in the layout. Failed stripes keep the id
/// they were asked for and carry their error in the async slot, so a
/// partial failure can be repaired with recreate.
pub(crate) fn fini_create(
    set: &RequestSet<ObjectAttr>,
    stripe_size: u64,
) -> std::result::Result<Arc<StripeLayout>, CreateError> {
    let stripes = set
        .reqs
        .iter()
        .map(|req| {
            let sub_id = req.reply.as_ref().map_or(req.sub_id(), |r| r.id);
            let info = StripeInfo::new(req.target_idx, sub_id);
            if let Some(Err(err)) = req.rc() {
                info.record_error(err);
            }
            info
        })
        .collect();
    let layout = StripeLayout::new(set.object_id, stripe_size, stripes)
        .map(Arc::new)
        .map_err(|e| CreateError::before_dispatch(set.object_id, e))?;
    match set.status() {
        Ok(()) => Ok(layout),
        Err(source) => Err(CreateError {
            object_id: set.object_id,
            source,
            layout: Some(layout),
        }),
    }
}

/// Reassembles a striped read into one buffer in logical order.
pub(crate) fn fini_read(set: &RequestSet<Vec<Bytes>>, offset: u64, len: usize) -> Result<Bytes> {
    set.status()?;
    let mut out = BytesMut::zeroed(len);
    for (req, bufs) in set.replies() {
        if bufs.len() != req.spans.len() {
            return Err(VolumeError::Fault);
        }
        for (span, buf) in req.spans.iter().zip(bufs) {
            let at = (span.logical_offset - offset) as usize;
            let n = span.len.min(buf.len());
            out[at..at + n].copy_from_slice(&buf[..n]);
        }
    }
    Ok(out.freeze())
}

/// Running statfs totals over the targets that answered.
#[derive(Debug, Default)]
pub struct StatfsMerge {
    acc: StatFs,
    answered: usize,
}

impl StatfsMerge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, st: &StatFs) {
        let acc = &mut self.acc;
        if self.answered == 0 {
            acc.bsize = st.bsize;
            acc.namelen = st.namelen;
        } else {
            acc.namelen = acc.namelen.min(st.namelen);
        }
        acc.blocks = acc.blocks.saturating_add(st.blocks);
        acc.bfree = acc.bfree.saturating_add(st.bfree);
        acc.bavail = acc.bavail.saturating_add(st.bavail);
        acc.files = acc.files.saturating_add(st.files);
        acc.ffree = acc.ffree.saturating_add(st.ffree);
        self.answered += 1;
    }

    pub fn answered(&self) -> usize {
        self.answered
    }

    /// Final figures. Object counts are spread over `expected_stripes`
    /// since every object consumes one on each of that many targets;
    /// saturated counts are left as they are.
    pub fn finish(self, expected_stripes: usize) -> Result<StatFs> {
        if self.answered == 0 {
            return Err(VolumeError::Unavailable);
        }
        let mut st = self.acc;
        if expected_stripes > 1 {
            let div = expected_stripes as u64;
            if st.files != u64::MAX {
                st.files /= div;
            }
            if st.ffree != u64::MAX {
                st.ffree /= div;
            }
        }
        debug!(answered = self.answered, expected_stripes, ?st, "statfs merged");
        Ok(st)
    }
}
