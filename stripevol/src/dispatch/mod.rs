//! Dispatch of request sets against target connections.
//!
//! Two modes share one request-set shape:
//! - sequential: sub-requests run one after another in stripe order and the
//!   caller awaits the whole set;
//! - batched: sub-requests are handed to a caller-owned [`CallSet`] together
//!   with a continuation that finalizes the set once every call has settled.
//!
//! In both modes the connection handle is copied out of the volume under its
//! lock and the remote call runs unlocked; a connection-loss error marks the
//! target inactive afterwards.

pub mod callset;

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Result, VolumeError};
use crate::request::{RequestSet, SubRequest};
use crate::target::TargetExport;
use crate::volume::Volume;

pub use callset::{AsyncReply, CallSet};

/// What to do with the remaining sub-requests after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Attempt every sub-request; the first error is reported.
    Continue,
    /// Stop at the first failure.
    Abort,
}

/// What to do with a sub-request whose target is inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivePolicy {
    /// Leave the stripe out of the operation.
    Skip,
    /// The stripe is required: fail it with unavailable.
    Fail,
}

/// Builds the remote call for one sub-request. The future owns everything
/// it needs so it can outlive the borrow of the request set.
pub(crate) type CallFn<'a, T> =
    dyn FnMut(Arc<dyn TargetExport>, &SubRequest<T>) -> BoxFuture<'static, Result<T>> + Send + 'a;

/// Outcome of dispatching a single sub-request.
pub(crate) enum Dispatched {
    Done(Result<()>),
    Skipped,
}

/// Runs sub-request `pos` and records its outcome in `set`.
pub(crate) async fn dispatch_one<T>(
    volume: &Volume,
    set: &mut RequestSet<T>,
    pos: usize,
    inactive: InactivePolicy,
    call: &mut CallFn<'_, T>,
) -> Dispatched {
    let idx = set.reqs[pos].target_idx;
    let res = match volume.snapshot(idx) {
        Some((export, true)) => {
            let res = call(export, &set.reqs[pos]).await;
            if let Some(err) = res.as_ref().err().cloned() {
                volume.record_failure(idx, &err).await;
            }
            res
        }
        _ if inactive == InactivePolicy::Skip => {
            set.skip(pos);
            return Dispatched::Skipped;
        }
        _ => Err(VolumeError::Unavailable),
    };
    Dispatched::Done(set.update(pos, res))
}

/// Sequential mode: stripe order, blocking on each target in turn.
pub(crate) async fn run_sequential<T>(
    volume: &Volume,
    set: &mut RequestSet<T>,
    errors: ErrorPolicy,
    inactive: InactivePolicy,
    call: &mut CallFn<'_, T>,
) -> Result<()> {
    for pos in 0..set.reqs.len() {
        if let Dispatched::Done(Err(_)) = dispatch_one(volume, set, pos, inactive, call).await {
            if errors == ErrorPolicy::Abort {
                debug!(op = %set.op, object = set.object_id, pos, "aborting after first failure");
                break;
            }
        }
    }
    set.status()
}

/// Batched mode.
///
/// Every sub-request is resolved to a connection before anything is
/// enqueued; when one cannot be (a required stripe on an inactive target)
/// the set is dropped and nothing reaches `call_set`. The continuation
/// collects the per-stripe outcomes, then hands the set and the call-set
/// status to `finish`, whose result is what the returned [`AsyncReply`]
/// resolves to.
pub(crate) fn dispatch_async<T, R, Fin>(
    volume: Arc<Volume>,
    mut set: RequestSet<T>,
    inactive: InactivePolicy,
    call_set: &mut CallSet,
    call: &mut CallFn<'_, T>,
    finish: Fin,
) -> Result<AsyncReply<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    Fin: FnOnce(RequestSet<T>, Result<()>) -> BoxFuture<'static, Result<R>> + Send + 'static,
{
    let mut exports = Vec::with_capacity(set.reqs.len());
    for pos in 0..set.reqs.len() {
        match volume.snapshot(set.reqs[pos].target_idx) {
            Some((export, true)) => exports.push((pos, export)),
            _ if inactive == InactivePolicy::Skip => set.skip(pos),
            _ => {
                debug!(op = %set.op, object = set.object_id, pos, "required stripe inactive, batch not queued");
                return Err(VolumeError::Unavailable);
            }
        }
    }
    if exports.is_empty() && !set.is_empty() {
        return Err(VolumeError::Unavailable);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Result<T>)>();
    let mut calls = Vec::with_capacity(exports.len());
    for (pos, export) in exports {
        let idx = set.reqs[pos].target_idx;
        let fut = call(export, &set.reqs[pos]);
        let tx = tx.clone();
        let volume = volume.clone();
        calls.push(
            async move {
                let res = fut.await;
                let status = match res.as_ref().err().cloned() {
                    None => Ok(()),
                    Some(err) => {
                        volume.record_failure(idx, &err).await;
                        Err(err)
                    }
                };
                let _ = tx.send((pos, res));
                status
            }
            .boxed(),
        );
    }
    drop(tx);
    for c in calls {
        call_set.add(c);
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    call_set.set_interpret(Box::new(move |set_rc| {
        async move {
            while let Some((pos, res)) = rx.recv().await {
                let _ = set.update(pos, res);
            }
            let result = finish(set, set_rc).await;
            let status = match &result {
                Ok(_) => Ok(()),
                Err(err) => Err(err.clone()),
            };
            let _ = reply_tx.send(result);
            status
        }
        .boxed()
    }));
    Ok(AsyncReply::new(reply_rx))
}
