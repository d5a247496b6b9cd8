use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use super::Volume;
use crate::dispatch::{Dispatched, ErrorPolicy, InactivePolicy, dispatch_one, run_sequential};
use crate::error::{Result, VolumeError};
use crate::layout::StripeLayout;
use crate::request::builder::prep_lock_set;
use crate::request::{RequestSet, SubRequest};
use crate::target::{TargetExport, TargetOp};
use crate::types::{CancelFlags, LockHandle, LockPolicy, ObjectAttr, VolumeLockHandle};

impl Volume {
    /// Takes an extent lock on every stripe the policy's range touches.
    ///
    /// Stripes are locked in order; if one fails, the locks already granted
    /// are cancelled before the error is returned.
    pub async fn enqueue(
        &self,
        layout: &Arc<StripeLayout>,
        policy: LockPolicy,
    ) -> Result<VolumeLockHandle> {
        layout.check_magic()?;
        let mut set: RequestSet<LockHandle> = prep_lock_set(TargetOp::Enqueue, layout, &policy);
        let rc = run_sequential(
            self,
            &mut set,
            ErrorPolicy::Abort,
            InactivePolicy::Fail,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<LockHandle>| {
                let (sub_id, lock) = (req.sub_id(), req.lock.unwrap_or(policy));
                async move { exp.enqueue(sub_id, lock).await }.boxed()
            },
        )
        .await;

        let lockh = collect_handles(&set, layout, &policy);
        if let Err(err) = rc {
            self.release_locks(layout, &lockh).await;
            return Err(err);
        }
        Ok(lockh)
    }

    /// Looks for an existing lock covering the policy on every touched
    /// stripe. All stripes have to match; otherwise the references taken so
    /// far are dropped and `None` is returned.
    pub async fn lock_match(
        &self,
        layout: &Arc<StripeLayout>,
        policy: LockPolicy,
    ) -> Result<Option<VolumeLockHandle>> {
        layout.check_magic()?;
        let mut set: RequestSet<Option<LockHandle>> = prep_lock_set(TargetOp::Match, layout, &policy);
        let mut call = |exp: Arc<dyn TargetExport>, req: &SubRequest<Option<LockHandle>>| {
            let (sub_id, lock) = (req.sub_id(), req.lock.unwrap_or(policy));
            async move { exp.lock_match(sub_id, lock).await }.boxed()
        };

        let mut matched = !set.is_empty();
        let mut rc = Ok(());
        for pos in 0..set.len() {
            if !self.is_active(set.reqs[pos].target_idx) {
                debug!(object = layout.object_id(), stripe = set.reqs[pos].stripe, "match: stripe inactive");
                matched = false;
                break;
            }
            match dispatch_one(self, &mut set, pos, InactivePolicy::Fail, &mut call).await {
                Dispatched::Done(Ok(())) => {
                    if matches!(set.reqs[pos].reply, Some(None)) {
                        matched = false;
                        break;
                    }
                }
                Dispatched::Done(Err(err)) => {
                    rc = Err(err);
                    break;
                }
                Dispatched::Skipped => {
                    matched = false;
                    break;
                }
            }
        }

        let mut lockh = VolumeLockHandle::new(policy.mode, layout.stripe_count());
        for (req, handle) in set.replies() {
            if let Some(handle) = handle {
                lockh.set(req.stripe, *handle);
            }
        }
        if rc.is_err() || !matched {
            self.release_locks(layout, &lockh).await;
            return rc.map(|_| None);
        }
        Ok(Some(lockh))
    }

    /// Releases every stripe lock held in `lockh`. All stripes are
    /// attempted; the first failure is returned.
    pub async fn cancel(&self, layout: &Arc<StripeLayout>, lockh: &VolumeLockHandle) -> Result<()> {
        layout.check_magic()?;
        let mut set: RequestSet<()> =
            RequestSet::new(TargetOp::Cancel, layout.object_id(), Some(layout.clone()));
        for (stripe, _) in lockh.held() {
            let info = layout
                .stripe(stripe)
                .ok_or_else(|| VolumeError::invalid(format!("lock handle names stripe {stripe}")))?;
            set.push(SubRequest::new(info.target_idx, stripe, ObjectAttr::with_id(info.sub_id)));
        }
        if set.is_empty() {
            return Ok(());
        }
        let mode = lockh.mode();
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Skip,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<()>| {
                let (sub_id, handle) = (req.sub_id(), lockh.get(req.stripe));
                async move {
                    match handle {
                        Some(handle) => exp.cancel(sub_id, mode, handle).await,
                        None => Ok(()),
                    }
                }
                .boxed()
            },
        )
        .await
    }

    pub(crate) async fn release_locks(&self, layout: &Arc<StripeLayout>, lockh: &VolumeLockHandle) {
        if lockh.is_empty() {
            return;
        }
        if let Err(err) = self.cancel(layout, lockh).await {
            warn!(object = layout.object_id(), %err, "releasing partially acquired locks failed");
        }
    }

    /// Drops unused locks on the object's stripes, or with no layout on
    /// every active target. Succeeds when at least one target answered.
    pub async fn cancel_unused(
        &self,
        layout: Option<&Arc<StripeLayout>>,
        flags: CancelFlags,
    ) -> Result<()> {
        let mut set: RequestSet<()> = match layout {
            Some(layout) => {
                layout.check_magic()?;
                let mut set = RequestSet::new(TargetOp::CancelUnused, layout.object_id(), Some(layout.clone()));
                for (stripe, info) in layout.stripes().iter().enumerate() {
                    set.push(SubRequest::new(info.target_idx, stripe, ObjectAttr::with_id(info.sub_id)));
                }
                set
            }
            None => {
                let mut set = RequestSet::new(TargetOp::CancelUnused, 0, None);
                for idx in 0..self.target_count() {
                    set.push(SubRequest::new(idx, idx, ObjectAttr::default()));
                }
                set
            }
        };
        let scoped = layout.is_some();
        let rc = run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Skip,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<()>| {
                let sub_id = scoped.then_some(req.sub_id());
                async move { exp.cancel_unused(sub_id, flags).await }.boxed()
            },
        )
        .await;
        if set.success_count() > 0 {
            return Ok(());
        }
        rc
    }
}

fn collect_handles(
    set: &RequestSet<LockHandle>,
    layout: &StripeLayout,
    policy: &LockPolicy,
) -> VolumeLockHandle {
    let mut lockh = VolumeLockHandle::new(policy.mode, layout.stripe_count());
    for (req, handle) in set.replies() {
        lockh.set(req.stripe, *handle);
    }
    lockh
}
