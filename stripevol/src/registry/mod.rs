//! Process-wide registries, made explicit.
//!
//! - `device`: the devices a volume can reach by target UUID
//! - `profile`: named volume profiles clients mount by name
//!
//! Neither table is global; whoever builds volumes owns an instance and
//! passes it in, so tests construct isolated tables.

pub mod device;
pub mod profile;

pub use device::{DeviceTable, TargetDevice};
pub use profile::{Profile, ProfileTable};
