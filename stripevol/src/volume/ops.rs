use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{StripeOptions, Volume};
use crate::aggregate::{StatfsMerge, fini_attrs, fini_create};
use crate::config::MIN_TRANSFER_SIZE;
use crate::dispatch::{AsyncReply, CallSet, ErrorPolicy, InactivePolicy, dispatch_async, run_sequential};
use crate::error::{CreateError, Result, VolumeError};
use crate::layout::{StripeLayout, check_stripe_width};
use crate::request::SubRequest;
use crate::request::builder::{prep_create_set, prep_object_set, prep_range_set, prep_setattr_set};
use crate::target::{TargetExport, TargetOp};
use crate::types::{AttrValid, Extent, ObjectAttr, ObjectFlags, StatFs};

impl Volume {
    /// Stripe size for a new object, either requested or the default.
    fn placement_stripe_size(&self, opts: &StripeOptions) -> Result<u64> {
        match opts.stripe_size {
            None => Ok(self.desc.default_stripe_size),
            Some(size) if size == 0 || size % MIN_TRANSFER_SIZE != 0 => Err(VolumeError::invalid(
                format!("stripe size {size} is not a multiple of {MIN_TRANSFER_SIZE}"),
            )),
            Some(size) => Ok(size),
        }
    }

    /// Picks the targets for a new object's stripes, in stripe order.
    fn place_stripes(&self, opts: &StripeOptions) -> Result<Vec<usize>> {
        let total = self.target_count();
        if let Some(offset) = opts.stripe_offset {
            if offset >= total {
                return Err(VolumeError::invalid(format!(
                    "stripe offset {offset} beyond {total} targets"
                )));
            }
        }
        let active = self.active_targets();
        if active.is_empty() {
            return Err(VolumeError::Unavailable);
        }
        let wanted = opts
            .stripe_count
            .filter(|&c| c > 0)
            .or((self.desc.default_stripe_count > 0).then_some(self.desc.default_stripe_count))
            .unwrap_or(active.len());
        let count = wanted.min(active.len());
        let start = match opts.stripe_offset {
            Some(offset) => offset,
            None => self.next_start.fetch_add(count, Ordering::Relaxed) % total,
        };
        let chosen = (0..total)
            .map(|i| (start + i) % total)
            .filter(|idx| active.contains(idx))
            .take(count)
            .collect();
        Ok(chosen)
    }

    /// Creates a logical object with one sub-object per stripe.
    ///
    /// Every chosen target is attempted. If some fail, the error carries the
    /// layout with the successful sub-objects kept in place.
    pub async fn create(
        &self,
        attr: &ObjectAttr,
        opts: &StripeOptions,
    ) -> std::result::Result<Arc<StripeLayout>, CreateError> {
        let object_id = attr.id;
        let before = |e| CreateError::before_dispatch(object_id, e);
        if !attr.valid.contains(AttrValid::ID) {
            return Err(before(VolumeError::invalid("create needs an object id")));
        }
        if attr.flags.contains(ObjectFlags::DELORPHAN) {
            return Err(before(VolumeError::invalid("orphan cleanup goes through clear_orphans")));
        }
        let stripe_size = self.placement_stripe_size(opts).map_err(before)?;
        let targets = self.place_stripes(opts).map_err(before)?;
        check_stripe_width(stripe_size, targets.len() as u64).map_err(before)?;

        let mut set = prep_create_set(attr, &targets);
        debug!(object = format_args!("{object_id:#x}"), ?targets, stripe_size, "create");
        let _ = run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Fail,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<ObjectAttr>| {
                let attr = req.attr.clone();
                async move { exp.create(&attr).await }.boxed()
            },
        )
        .await;
        fini_create(&set, stripe_size)
    }

    /// Asks one target, or every active one, to drop objects above
    /// `attr.id`. Failures on individual targets are logged; only a failure
    /// on an explicitly named target is returned.
    pub async fn clear_orphans(&self, attr: &ObjectAttr, target: Option<Uuid>) -> Result<()> {
        let indices: Vec<usize> = match target {
            Some(uuid) => vec![self
                .target_index(&uuid)
                .ok_or(VolumeError::UnknownTarget(uuid))?],
            None => (0..self.target_count()).collect(),
        };
        let mut probe = attr.clone();
        probe.flags |= ObjectFlags::DELORPHAN;
        probe.valid |= AttrValid::ID | AttrValid::FLAGS;

        let mut probed = 0;
        for idx in indices {
            let Some((export, true)) = self.snapshot(idx) else {
                debug!(idx, "clear_orphans: target inactive, skipped");
                if target.is_some() {
                    return Err(VolumeError::Unavailable);
                }
                continue;
            };
            probed += 1;
            if let Err(err) = export.create(&probe).await {
                self.record_failure(idx, &err).await;
                error!(idx, last_id = probe.id, %err, "orphan recovery failed");
                if target.is_some() {
                    return Err(err);
                }
            }
        }
        if probed == 0 {
            return Err(VolumeError::Unavailable);
        }
        Ok(())
    }

    /// Recreates the sub-object that stripe on `target_idx` should hold.
    /// `attr.id` and `sub_id` must name the object and sub-object recorded
    /// in `layout`.
    pub async fn recreate(
        &self,
        layout: &Arc<StripeLayout>,
        attr: &ObjectAttr,
        target_idx: usize,
        sub_id: u64,
    ) -> Result<()> {
        layout.check_magic()?;
        if attr.id != layout.object_id() {
            return Err(VolumeError::invalid(format!(
                "object {:#x} does not match layout {:#x}",
                attr.id,
                layout.object_id()
            )));
        }
        let stripe = layout
            .stripe_for_target(target_idx)
            .ok_or_else(|| VolumeError::invalid(format!("no stripe on target {target_idx}")))?;
        let info = &layout.stripes()[stripe];
        if info.sub_id != sub_id {
            return Err(VolumeError::invalid(format!(
                "sub-object {sub_id:#x} does not match stripe {stripe} ({:#x})",
                info.sub_id
            )));
        }
        let Some((export, true)) = self.snapshot(target_idx) else {
            return Err(VolumeError::Unavailable);
        };

        let mut sub = attr.narrowed(sub_id);
        sub.flags |= ObjectFlags::RECREATE;
        match export.create(&sub).await {
            Ok(_) => {
                info.clear_error();
                info!(object = format_args!("{:#x}", attr.id), stripe, target_idx, "sub-object recreated");
                Ok(())
            }
            Err(err) => {
                self.record_failure(target_idx, &err).await;
                info.record_error(&err);
                Err(err)
            }
        }
    }

    pub async fn destroy(&self, layout: &Arc<StripeLayout>, attr: &ObjectAttr) -> Result<()> {
        layout.check_magic()?;
        let mut set = prep_object_set(TargetOp::Destroy, layout, attr);
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Skip,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<()>| {
                let attr = req.attr.clone();
                async move { exp.destroy(&attr).await }.boxed()
            },
        )
        .await
    }

    /// Attributes of the logical object; stops at the first failing stripe.
    pub async fn getattr(&self, layout: &Arc<StripeLayout>) -> Result<ObjectAttr> {
        layout.check_magic()?;
        let attr = ObjectAttr::with_id(layout.object_id());
        let mut set = prep_object_set(TargetOp::Getattr, layout, &attr);
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Abort,
            InactivePolicy::Skip,
            &mut getattr_call,
        )
        .await?;
        fini_attrs(&set, self.desc.attr_merge)
    }

    /// Queues a getattr of every stripe on `call_set`.
    pub fn getattr_async(
        &self,
        layout: &Arc<StripeLayout>,
        call_set: &mut CallSet,
    ) -> Result<AsyncReply<ObjectAttr>> {
        layout.check_magic()?;
        let volume = self.arc().ok_or(VolumeError::NotConnected)?;
        let attr = ObjectAttr::with_id(layout.object_id());
        let set = prep_object_set(TargetOp::Getattr, layout, &attr);
        let policy = self.desc.attr_merge;
        dispatch_async(
            volume,
            set,
            InactivePolicy::Skip,
            call_set,
            &mut getattr_call,
            move |set, set_rc| {
                async move {
                    if let Err(err) = set_rc {
                        return Err(set.first_error().cloned().unwrap_or(err));
                    }
                    fini_attrs(&set, policy)
                }
                .boxed()
            },
        )
    }

    /// Applies `attr` to every stripe. A size is translated into each
    /// stripe's own sub-object size.
    pub async fn setattr(&self, layout: &Arc<StripeLayout>, attr: &ObjectAttr) -> Result<ObjectAttr> {
        layout.check_magic()?;
        let unsupported = attr.valid - AttrValid::settable();
        if !unsupported.is_empty() {
            return Err(VolumeError::invalid(format!(
                "attributes {unsupported:?} cannot be set"
            )));
        }
        let mut set = prep_setattr_set(layout, attr);
        let _ = run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Skip,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<ObjectAttr>| {
                let attr = req.attr.clone();
                async move { exp.setattr(&attr).await }.boxed()
            },
        )
        .await;
        fini_attrs(&set, self.desc.attr_merge)
    }

    /// Deallocates `[extent.start, extent.end)`; an open end truncates.
    pub async fn punch(&self, layout: &Arc<StripeLayout>, attr: &ObjectAttr, extent: Extent) -> Result<()> {
        layout.check_magic()?;
        let mut set = prep_range_set(TargetOp::Punch, layout, attr, extent);
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Skip,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<()>| {
                let attr = req.attr.clone();
                let extent = req.extent.unwrap_or(Extent::whole());
                async move { exp.punch(&attr, extent).await }.boxed()
            },
        )
        .await
    }

    pub async fn sync(&self, layout: &Arc<StripeLayout>, attr: &ObjectAttr, extent: Extent) -> Result<()> {
        layout.check_magic()?;
        let mut set = prep_range_set(TargetOp::Sync, layout, attr, extent);
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Continue,
            InactivePolicy::Skip,
            &mut |exp: Arc<dyn TargetExport>, req: &SubRequest<()>| {
                let attr = req.attr.clone();
                let extent = req.extent.unwrap_or(Extent::whole());
                async move { exp.sync(&attr, extent).await }.boxed()
            },
        )
        .await
    }

    /// Space usage summed over the active targets that answer.
    pub async fn statfs(&self) -> Result<StatFs> {
        let mut merge = StatfsMerge::new();
        let mut first_err = None;
        for idx in 0..self.target_count() {
            let Some((export, true)) = self.snapshot(idx) else {
                continue;
            };
            match export.statfs().await {
                Ok(st) => merge.add(&st),
                Err(err) => {
                    self.record_failure(idx, &err).await;
                    warn!(volume = %self.desc.name, idx, %err, "statfs failed on target");
                    first_err.get_or_insert(err);
                }
            }
        }
        if merge.answered() == 0 {
            return Err(first_err.unwrap_or(VolumeError::Unavailable));
        }
        let expected = match self.desc.default_stripe_count {
            0 => self.active_target_count(),
            n => n,
        };
        merge.finish(expected)
    }
}

fn getattr_call(
    exp: Arc<dyn TargetExport>,
    req: &SubRequest<ObjectAttr>,
) -> futures::future::BoxFuture<'static, Result<ObjectAttr>> {
    let attr = req.attr.clone();
    async move { exp.getattr(&attr).await }.boxed()
}
