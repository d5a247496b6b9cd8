use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::Volume;
use crate::aggregate::fini_read;
use crate::dispatch::{AsyncReply, CallSet, ErrorPolicy, InactivePolicy, dispatch_async, run_sequential};
use crate::error::{Result, VolumeError};
use crate::layout::StripeLayout;
use crate::request::SubRequest;
use crate::request::builder::prep_brw_set;
use crate::target::{TargetExport, TargetOp};

fn write_call(exp: Arc<dyn TargetExport>, req: &SubRequest<()>) -> BoxFuture<'static, Result<()>> {
    let (sub_id, io) = (req.sub_id(), req.io.clone());
    async move { exp.write(sub_id, io).await }.boxed()
}

fn read_call(
    exp: Arc<dyn TargetExport>,
    req: &SubRequest<Vec<Bytes>>,
) -> BoxFuture<'static, Result<Vec<Bytes>>> {
    let (sub_id, io) = (req.sub_id(), req.io.clone());
    async move { exp.read(sub_id, io).await }.boxed()
}

impl Volume {
    /// Fails with unavailable when any stripe touched by
    /// `[offset, offset + len)` sits on an inactive target.
    pub fn check_io(&self, layout: &StripeLayout, offset: u64, len: usize) -> Result<()> {
        layout.check_magic()?;
        let end = offset.saturating_add(len as u64);
        for (stripe, info) in layout.stripes().iter().enumerate() {
            if layout.intersecting_range(stripe, offset, end).is_none() {
                continue;
            }
            if !self.is_active(info.target_idx) {
                return Err(VolumeError::Unavailable);
            }
        }
        Ok(())
    }

    /// Writes `data` at logical `offset`. Every touched stripe is required;
    /// the first failing stripe ends the write.
    pub async fn write(&self, layout: &Arc<StripeLayout>, offset: u64, data: Bytes) -> Result<()> {
        layout.check_magic()?;
        let mut set = prep_brw_set(TargetOp::Write, layout, offset, data.len(), Some(&data))?;
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Abort,
            InactivePolicy::Fail,
            &mut write_call,
        )
        .await
    }

    /// Reads `len` bytes at logical `offset`; holes read back as zeros.
    pub async fn read(&self, layout: &Arc<StripeLayout>, offset: u64, len: usize) -> Result<Bytes> {
        layout.check_magic()?;
        let mut set = prep_brw_set(TargetOp::Read, layout, offset, len, None)?;
        run_sequential(
            self,
            &mut set,
            ErrorPolicy::Abort,
            InactivePolicy::Fail,
            &mut read_call,
        )
        .await?;
        fini_read(&set, offset, len)
    }

    pub fn write_async(
        &self,
        layout: &Arc<StripeLayout>,
        offset: u64,
        data: Bytes,
        call_set: &mut CallSet,
    ) -> Result<AsyncReply<()>> {
        layout.check_magic()?;
        let volume = self.arc().ok_or(VolumeError::NotConnected)?;
        let set = prep_brw_set(TargetOp::Write, layout, offset, data.len(), Some(&data))?;
        dispatch_async(
            volume,
            set,
            InactivePolicy::Fail,
            call_set,
            &mut write_call,
            |set, set_rc| {
                async move {
                    if let Err(err) = set_rc {
                        return Err(set.first_error().cloned().unwrap_or(err));
                    }
                    set.status()
                }
                .boxed()
            },
        )
    }

    pub fn read_async(
        &self,
        layout: &Arc<StripeLayout>,
        offset: u64,
        len: usize,
        call_set: &mut CallSet,
    ) -> Result<AsyncReply<Bytes>> {
        layout.check_magic()?;
        let volume = self.arc().ok_or(VolumeError::NotConnected)?;
        let set = prep_brw_set(TargetOp::Read, layout, offset, len, None)?;
        dispatch_async(
            volume,
            set,
            InactivePolicy::Fail,
            call_set,
            &mut read_call,
            move |set, set_rc| {
                async move {
                    if let Err(err) = set_rc {
                        return Err(set.first_error().cloned().unwrap_or(err));
                    }
                    fini_read(&set, offset, len)
                }
                .boxed()
            },
        )
    }
}
