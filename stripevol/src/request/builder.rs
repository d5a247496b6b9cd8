//! Request-set construction, one builder per operation shape.

use std::sync::Arc;

use bytes::Bytes;

use super::{RequestSet, SubRequest};
use crate::error::{Result, VolumeError};
use crate::layout::StripeLayout;
use crate::target::TargetOp;
use crate::types::{AttrValid, Extent, IoExtent, LockPolicy, ObjectAttr};

/// Create: one sub-request per chosen target, stripe `i` on `targets[i]`.
/// The layout does not exist until the replies are in.
pub(crate) fn prep_create_set(attr: &ObjectAttr, targets: &[usize]) -> RequestSet<ObjectAttr> {
    let mut set = RequestSet::new(TargetOp::Create, attr.id, None);
    for (stripe, &target_idx) in targets.iter().enumerate() {
        // sub-objects share the logical id, each in its own target namespace
        set.push(SubRequest::new(target_idx, stripe, attr.narrowed(attr.id)));
    }
    set
}

/// Every stripe of the object, carrying `attr` re-addressed to the
/// stripe's sub-object.
pub(crate) fn prep_object_set<T>(
    op: TargetOp,
    layout: &Arc<StripeLayout>,
    attr: &ObjectAttr,
) -> RequestSet<T> {
    let mut set = RequestSet::new(op, layout.object_id(), Some(layout.clone()));
    for (stripe, info) in layout.stripes().iter().enumerate() {
        set.push(SubRequest::new(info.target_idx, stripe, attr.narrowed(info.sub_id)));
    }
    set
}

/// Like [`prep_object_set`], with a logical size turned into each stripe's
/// own sub-object size.
pub(crate) fn prep_setattr_set(
    layout: &Arc<StripeLayout>,
    attr: &ObjectAttr,
) -> RequestSet<ObjectAttr> {
    let mut set = prep_object_set(TargetOp::Setattr, layout, attr);
    if attr.valid.contains(AttrValid::SIZE) {
        for req in &mut set.reqs {
            req.attr.size = layout.size_to_stripe(req.stripe, attr.size);
        }
    }
    set
}

/// Stripes whose share of the object intersects `extent`, each with the
/// stripe-local sub-range.
pub(crate) fn prep_range_set<T>(
    op: TargetOp,
    layout: &Arc<StripeLayout>,
    attr: &ObjectAttr,
    extent: Extent,
) -> RequestSet<T> {
    let mut set = RequestSet::new(op, layout.object_id(), Some(layout.clone()));
    for (stripe, info) in layout.stripes().iter().enumerate() {
        let Some((start, end)) = layout.intersecting_range(stripe, extent.start, extent.end)
        else {
            continue;
        };
        let mut req = SubRequest::new(info.target_idx, stripe, attr.narrowed(info.sub_id));
        req.extent = Some(Extent::new(start, end));
        set.push(req);
    }
    set
}

/// Range-scoped lock requests: the policy is narrowed per stripe.
pub(crate) fn prep_lock_set<T>(
    op: TargetOp,
    layout: &Arc<StripeLayout>,
    policy: &LockPolicy,
) -> RequestSet<T> {
    let attr = ObjectAttr::with_id(layout.object_id());
    let mut set = prep_range_set(op, layout, &attr, policy.extent);
    for req in &mut set.reqs {
        if let Some(extent) = req.extent {
            req.lock = Some(policy.narrowed(extent));
        }
    }
    set
}

/// Reads and writes: the logical range is cut into stripe units, and the
/// units are grouped per stripe. With `data` the set carries the payload;
/// without it every unit is a read of `len` bytes.
pub(crate) fn prep_brw_set<T>(
    op: TargetOp,
    layout: &Arc<StripeLayout>,
    offset: u64,
    len: usize,
    data: Option<&Bytes>,
) -> Result<RequestSet<T>> {
    if let Some(data) = data {
        if data.len() != len {
            return Err(VolumeError::Fault);
        }
    }
    if offset.checked_add(len as u64).is_none() {
        return Err(VolumeError::invalid("i/o range overflows"));
    }
    let mut set = RequestSet::new(op, layout.object_id(), Some(layout.clone()));
    let spans = layout.split_range(offset, len);
    for (stripe, info) in layout.stripes().iter().enumerate() {
        let mut req = SubRequest::new(
            info.target_idx,
            stripe,
            ObjectAttr::with_id(info.sub_id),
        );
        for span in spans.iter().filter(|s| s.stripe == stripe) {
            let payload = match data {
                Some(data) => {
                    let at = (span.logical_offset - offset) as usize;
                    data.slice(at..at + span.len)
                }
                None => Bytes::new(),
            };
            req.io.push(IoExtent {
                offset: span.local_offset,
                len: span.len,
                data: payload,
            });
            req.spans.push(*span);
        }
        if !req.io.is_empty() {
            set.push(req);
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LockMode, OBJECT_EOF};

    const SS: u64 = 65536;

    fn layout(count: usize) -> Arc<StripeLayout> {
        Arc::new(StripeLayout::from_targets(0x42, SS, (0..count).map(|i| (i + 1, 0x100 + i as u64))).unwrap())
    }

    #[test]
    fn test_object_set_one_per_stripe_in_order() {
        let l = layout(3);
        let set: RequestSet<()> = prep_object_set(TargetOp::Destroy, &l, &ObjectAttr::with_id(0x42));
        let got: Vec<_> = set.reqs.iter().map(|r| (r.stripe, r.target_idx, r.sub_id())).collect();
        assert_eq!(got, vec![(0, 1, 0x100), (1, 2, 0x101), (2, 3, 0x102)]);
    }

    #[test]
    fn test_range_set_only_intersecting_stripes() {
        let l = layout(4);
        let set: RequestSet<()> = prep_range_set(
            TargetOp::Punch,
            &l,
            &ObjectAttr::with_id(0x42),
            Extent::new(SS + 10, 2 * SS + 10),
        );
        let stripes: Vec<_> = set.reqs.iter().map(|r| r.stripe).collect();
        assert_eq!(stripes, vec![1, 2]);
        assert_eq!(set.reqs[0].extent, Some(Extent::new(10, SS)));
        assert_eq!(set.reqs[1].extent, Some(Extent::new(0, 10)));
    }

    #[test]
    fn test_setattr_size_narrowed_per_stripe() {
        let l = layout(2);
        let attr = ObjectAttr::with_id(0x42).set_size(SS + 100);
        let set = prep_setattr_set(&l, &attr);
        assert_eq!(set.reqs[0].attr.size, SS);
        assert_eq!(set.reqs[1].attr.size, 100);
    }

    #[test]
    fn test_lock_set_narrows_policy() {
        let l = layout(2);
        let policy = LockPolicy::new(LockMode::Write, Extent::whole());
        let set: RequestSet<()> = prep_lock_set(TargetOp::Enqueue, &l, &policy);
        assert_eq!(set.len(), 2);
        for req in &set.reqs {
            assert_eq!(req.lock.unwrap().extent, Extent::new(0, OBJECT_EOF));
        }
    }

    #[test]
    fn test_brw_set_groups_units_by_stripe() {
        let l = layout(2);
        let data = Bytes::from(vec![1u8; (3 * SS) as usize]);
        let set: RequestSet<()> =
            prep_brw_set(TargetOp::Write, &l, 0, data.len(), Some(&data)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.reqs[0].io.len(), 2);
        assert_eq!(set.reqs[0].io[1].offset, SS);
        assert_eq!(set.reqs[1].io.len(), 1);
        assert!(prep_brw_set::<()>(TargetOp::Write, &l, 0, 5, Some(&data)).is_err());
    }
}
