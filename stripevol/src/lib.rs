// Library crate for stripevol: one logical object namespace striped over
// independent storage targets.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod registry;
pub mod request;
pub mod target;
pub mod types;
pub mod volume;

pub use aggregate::AttrMergePolicy;
pub use config::{VolumeConfig, VolumeDesc, load_config};
pub use dispatch::{AsyncReply, CallSet};
pub use error::{CreateError, Result, VolumeError};
pub use layout::StripeLayout;
pub use registry::{DeviceTable, Profile, ProfileTable, TargetDevice};
pub use target::{MemTarget, TargetExport, TargetObserver, TargetOp};
pub use volume::{ConnState, StripeOptions, Volume, VolumeHandle};
