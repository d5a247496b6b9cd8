use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::layout::StripeLayout;

pub type Result<T, E = VolumeError> = std::result::Result<T, E>;

/// Error produced by the volume layer or reported back by a target.
///
/// Values are cloned into per-stripe async-error slots and into batched
/// call-set statuses, so every variant stays cheap to copy and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VolumeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("target {0} is not configured in this volume")]
    UnknownTarget(Uuid),

    #[error("target {0} is not ready: {1}")]
    NotReady(Uuid, String),

    #[error("no active target can serve the request")]
    Unavailable,

    #[error("target connection is gone")]
    NotConnected,

    #[error("remote call timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("object {0:#x} not found")]
    NotFound(u64),

    #[error("no space left on target")]
    NoSpace,

    #[error("operation not supported")]
    NotSupported,

    #[error("no stripe is backed by that target")]
    NoSuchStripe,

    #[error("bad address")]
    Fault,

    #[error("remote error {0}")]
    Remote(i32),
}

impl VolumeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// POSIX errno equivalent, for callers that speak return codes.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::UnknownTarget(_) => libc::EINVAL,
            Self::NotReady(..) => libc::ENODEV,
            Self::Unavailable | Self::Io(_) => libc::EIO,
            Self::NotConnected => libc::ENOTCONN,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::NotSupported => libc::ENOTTY,
            Self::NoSuchStripe => libc::ENXIO,
            Self::Fault => libc::EFAULT,
            Self::Remote(code) => *code,
        }
    }

    /// Errors after which the target should no longer be assumed live.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::NotConnected | Self::TimedOut)
    }
}

impl From<std::io::Error> for VolumeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::TimedOut,
            std::io::ErrorKind::NotConnected => Self::NotConnected,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// A create that could not place every stripe.
///
/// When the failure happened after dispatch, `layout` carries the stripes
/// that were attempted: successful sub-objects are kept and the failed
/// stripes hold their error in the async-error slot, ready for
/// [`Volume::recreate`](crate::volume::Volume::recreate).
#[derive(Debug, Error)]
#[error("create of object {object_id:#x} failed: {source}")]
pub struct CreateError {
    pub object_id: u64,
    #[source]
    pub source: VolumeError,
    pub layout: Option<Arc<StripeLayout>>,
}

impl CreateError {
    pub(crate) fn before_dispatch(object_id: u64, source: VolumeError) -> Self {
        Self {
            object_id,
            source,
            layout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VolumeError::invalid("x").errno(), libc::EINVAL);
        assert_eq!(VolumeError::Unavailable.errno(), libc::EIO);
        assert_eq!(VolumeError::NotSupported.errno(), libc::ENOTTY);
        assert_eq!(VolumeError::Remote(-42).errno(), -42);
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(VolumeError::NotConnected.is_connection_loss());
        assert!(VolumeError::TimedOut.is_connection_loss());
        assert!(!VolumeError::Io("disk".into()).is_connection_loss());

        let e: VolumeError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(e, VolumeError::TimedOut);
    }
}
