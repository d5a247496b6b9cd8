//! Per-operation fan-out state.
//!
//! A [`RequestSet`] binds one logical operation to the sub-requests it was
//! split into, one per participating stripe, in ascending stripe order. The
//! dispatcher fills in each sub-request's outcome exactly once; the
//! aggregator then reads the set to produce the logical result.

pub(crate) mod builder;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, VolumeError};
use crate::layout::{StripeLayout, StripeSpan};
use crate::target::TargetOp;
use crate::types::{Extent, IoExtent, LockPolicy, ObjectAttr};

#[derive(Debug)]
pub struct SubRequest<T> {
    pub target_idx: usize,
    pub stripe: usize,
    /// Operation attributes addressed to the stripe's sub-object.
    pub attr: ObjectAttr,
    /// Stripe-local byte range for range-scoped operations.
    pub extent: Option<Extent>,
    pub lock: Option<LockPolicy>,
    pub io: Vec<IoExtent>,
    /// Logical placement of each `io` entry.
    pub spans: Vec<StripeSpan>,
    rc: Option<Result<()>>,
    skipped: bool,
    pub reply: Option<T>,
}

impl<T> SubRequest<T> {
    pub fn new(target_idx: usize, stripe: usize, attr: ObjectAttr) -> Self {
        Self {
            target_idx,
            stripe,
            attr,
            extent: None,
            lock: None,
            io: Vec::new(),
            spans: Vec::new(),
            rc: None,
            skipped: false,
            reply: None,
        }
    }

    pub fn sub_id(&self) -> u64 {
        self.attr.id
    }

    pub fn rc(&self) -> Option<&Result<()>> {
        self.rc.as_ref()
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.rc, Some(Ok(())))
    }
}

#[derive(Debug)]
pub struct RequestSet<T> {
    pub op: TargetOp,
    pub object_id: u64,
    pub layout: Option<Arc<StripeLayout>>,
    pub reqs: Vec<SubRequest<T>>,
    completes: usize,
    success: usize,
    first_error: Option<VolumeError>,
}

impl<T> RequestSet<T> {
    pub fn new(op: TargetOp, object_id: u64, layout: Option<Arc<StripeLayout>>) -> Self {
        Self {
            op,
            object_id,
            layout,
            reqs: Vec::new(),
            completes: 0,
            success: 0,
            first_error: None,
        }
    }

    pub(crate) fn push(&mut self, req: SubRequest<T>) {
        debug_assert!(self.reqs.last().is_none_or(|last| last.stripe < req.stripe));
        self.reqs.push(req);
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn completes(&self) -> usize {
        self.completes
    }

    pub fn success_count(&self) -> usize {
        self.success
    }

    pub fn first_error(&self) -> Option<&VolumeError> {
        self.first_error.as_ref()
    }

    /// Records the outcome of sub-request `pos`.
    ///
    /// The result lands on the sub-request, in the stripe's async-error slot
    /// when it is an error, and in the set's counters. A second outcome for
    /// the same sub-request is ignored.
    pub(crate) fn update(&mut self, pos: usize, res: Result<T>) -> Result<()> {
        let req = &mut self.reqs[pos];
        if req.rc.is_some() {
            warn!(op = %self.op, object = self.object_id, stripe = req.stripe, "duplicate completion ignored");
            return req.rc.clone().unwrap_or(Ok(()));
        }
        self.completes += 1;
        let rc = match res {
            Ok(reply) => {
                req.reply = Some(reply);
                self.success += 1;
                Ok(())
            }
            Err(err) => {
                warn!(
                    op = %self.op,
                    object = format_args!("{:#x}", self.object_id),
                    stripe = req.stripe,
                    target = req.target_idx,
                    sub_id = format_args!("{:#x}", req.attr.id),
                    %err,
                    "sub-request failed"
                );
                if let Some(stripe) = self.layout.as_ref().and_then(|l| l.stripe(req.stripe)) {
                    stripe.record_error(&err);
                }
                if self.first_error.is_none() {
                    self.first_error = Some(err.clone());
                }
                Err(err)
            }
        };
        req.rc = Some(rc.clone());
        rc
    }

    /// Marks sub-request `pos` as not sent because its target is inactive.
    pub(crate) fn skip(&mut self, pos: usize) {
        let req = &mut self.reqs[pos];
        debug!(op = %self.op, object = self.object_id, stripe = req.stripe, target = req.target_idx, "skipping inactive target");
        req.skipped = true;
    }

    /// Aggregate status: the first error in stripe order, or unavailable
    /// when every sub-request was skipped.
    pub fn status(&self) -> Result<()> {
        if let Some(err) = &self.first_error {
            return Err(err.clone());
        }
        if !self.reqs.is_empty() && self.success == 0 {
            return Err(VolumeError::Unavailable);
        }
        Ok(())
    }

    /// Successful replies with the stripe they came from, in stripe order.
    pub fn replies(&self) -> impl Iterator<Item = (&SubRequest<T>, &T)> {
        self.reqs
            .iter()
            .filter_map(|r| r.reply.as_ref().map(|reply| (r, reply)))
    }
}
