use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Volume;
use crate::config::VolumeDesc;
use crate::error::{Result, VolumeError};
use crate::layout::{LayoutView, StripeLayout};

pub const KEY_LAST_ID: &str = "last_id";
pub const KEY_NEXT_ID: &str = "next_id";
pub const KEY_MDS_CONN: &str = "mds_conn";
pub const KEY_UNLINKED: &str = "unlinked";

/// Control requests understood by [`Volume::iocontrol`].
#[derive(Debug, Clone)]
pub enum IoctlCmd {
    /// Volume description plus per-target state.
    GetConfig,
    /// Placement of one object.
    GetStripe(Arc<StripeLayout>),
    /// Opaque request broadcast to every active target.
    Passthrough { code: u32, buf: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub uuid: Uuid,
    pub active: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigReport {
    pub desc: VolumeDesc,
    pub active_count: usize,
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    Config(ConfigReport),
    Stripe(LayoutView),
    /// Replies of the targets that answered, by target index.
    Passthrough(Vec<(usize, Bytes)>),
}

#[derive(Debug, Clone)]
pub enum InfoQuery {
    /// Which stripe of `layout` a lock on `sub_id` at `target_idx` covers.
    LockToStripe {
        layout: Arc<StripeLayout>,
        target_idx: usize,
        sub_id: u64,
    },
    /// Sub-object size of `stripe` for a logical size.
    SizeToStripe {
        layout: Arc<StripeLayout>,
        stripe: usize,
        size: u64,
    },
    /// Last object id allocated on a target.
    LastId { target_idx: usize },
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    Stripe(usize),
    Size(u64),
    LastId(u64),
    Desc(VolumeDesc),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetInfo {
    /// Next object id for every target, in target order.
    NextId(Vec<u64>),
    /// Metadata-server connection established; to one target or all active.
    MdsConn { target: Option<Uuid> },
    /// Unlinked-object processing; to one target or all active.
    Unlinked { target: Option<Uuid> },
}

impl Volume {
    pub async fn iocontrol(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        if self.target_count() == 0 {
            return Err(VolumeError::NotSupported);
        }
        match cmd {
            IoctlCmd::GetConfig => Ok(IoctlReply::Config(self.config_report())),
            IoctlCmd::GetStripe(layout) => {
                layout.check_magic()?;
                Ok(IoctlReply::Stripe(layout.view()))
            }
            IoctlCmd::Passthrough { code, buf } => {
                let mut replies = Vec::new();
                let mut first_err = None;
                for idx in 0..self.target_count() {
                    let Some((export, true)) = self.snapshot(idx) else {
                        continue;
                    };
                    match export.iocontrol(code, buf.clone()).await {
                        Ok(reply) => replies.push((idx, reply)),
                        Err(err) => {
                            self.record_failure(idx, &err).await;
                            warn!(volume = %self.desc.name, idx, code, %err, "iocontrol failed on target");
                            first_err.get_or_insert(err);
                        }
                    }
                }
                if replies.is_empty() {
                    return Err(first_err.unwrap_or(VolumeError::Io(
                        "no target accepted the control request".into(),
                    )));
                }
                Ok(IoctlReply::Passthrough(replies))
            }
        }
    }

    fn config_report(&self) -> ConfigReport {
        let state = self.state();
        ConfigReport {
            desc: self.desc.clone(),
            active_count: state.active_count,
            targets: state
                .targets
                .iter()
                .map(|t| TargetStatus {
                    uuid: t.uuid,
                    active: t.active,
                    connected: t.export.is_some(),
                })
                .collect(),
        }
    }

    pub async fn get_info(&self, query: InfoQuery) -> Result<InfoValue> {
        match query {
            InfoQuery::LockToStripe {
                layout,
                target_idx,
                sub_id,
            } => layout
                .stripes()
                .iter()
                .position(|s| s.target_idx == target_idx && s.sub_id == sub_id)
                .map(InfoValue::Stripe)
                .ok_or(VolumeError::NoSuchStripe),
            InfoQuery::SizeToStripe {
                layout,
                stripe,
                size,
            } => {
                if stripe >= layout.stripe_count() {
                    return Err(VolumeError::invalid(format!("no stripe {stripe}")));
                }
                Ok(InfoValue::Size(layout.size_to_stripe(stripe, size)))
            }
            InfoQuery::LastId { target_idx } => {
                if target_idx >= self.target_count() {
                    return Err(VolumeError::invalid(format!("no target {target_idx}")));
                }
                let Some((export, true)) = self.snapshot(target_idx) else {
                    return Err(VolumeError::Unavailable);
                };
                match export.get_info(KEY_LAST_ID).await {
                    Ok(id) => Ok(InfoValue::LastId(id)),
                    Err(err) => {
                        self.record_failure(target_idx, &err).await;
                        Err(err)
                    }
                }
            }
            InfoQuery::Desc => Ok(InfoValue::Desc(self.desc.clone())),
        }
    }

    pub async fn set_info(&self, info: SetInfo) -> Result<()> {
        match info {
            SetInfo::NextId(ids) => {
                if ids.len() != self.target_count() {
                    return Err(VolumeError::invalid(format!(
                        "{} next ids for {} targets",
                        ids.len(),
                        self.target_count()
                    )));
                }
                let mut rc = Ok(());
                for (idx, next) in ids.into_iter().enumerate() {
                    // sent to every connected target, active or not
                    let Some((export, _)) = self.snapshot(idx) else {
                        continue;
                    };
                    if let Err(err) = export.set_info(KEY_NEXT_ID, Some(next)).await {
                        warn!(volume = %self.desc.name, idx, %err, "set next_id failed");
                        if rc.is_ok() {
                            rc = Err(err);
                        }
                    }
                }
                rc
            }
            SetInfo::MdsConn { target } => self.broadcast_info(KEY_MDS_CONN, target).await,
            SetInfo::Unlinked { target } => self.broadcast_info(KEY_UNLINKED, target).await,
        }
    }

    /// Sends a valueless key to one named target or to every active one.
    async fn broadcast_info(&self, key: &str, target: Option<Uuid>) -> Result<()> {
        let indices: Vec<usize> = match target {
            Some(uuid) => {
                let idx = self
                    .target_index(&uuid)
                    .ok_or(VolumeError::UnknownTarget(uuid))?;
                if !self.is_active(idx) {
                    return Err(VolumeError::Unavailable);
                }
                vec![idx]
            }
            None => self.active_targets(),
        };
        let mut rc = Ok(());
        for idx in indices {
            let Some((export, true)) = self.snapshot(idx) else {
                debug!(idx, key, "set_info: target went inactive");
                continue;
            };
            if let Err(err) = export.set_info(key, None).await {
                self.record_failure(idx, &err).await;
                warn!(volume = %self.desc.name, idx, key, %err, "set_info failed");
                if rc.is_ok() {
                    rc = Err(err);
                }
            }
        }
        rc
    }
}
