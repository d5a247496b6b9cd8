use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::aggregate::AttrMergePolicy;
use crate::error::{Result, VolumeError};
use crate::layout::check_stripe_width;

/// Smallest stripe unit the volume accepts; smaller values are raised.
pub const MIN_TRANSFER_SIZE: u64 = 64 * 1024;

/// Stripe size used when the configuration leaves it out.
pub const DEFAULT_STRIPE_SIZE: u64 = 1024 * 1024;

fn default_stripe_size() -> u64 {
    DEFAULT_STRIPE_SIZE
}

/// Volume configuration as written by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    /// Number of targets the volume was described with; must match `targets`.
    pub target_count: usize,
    #[serde(default = "default_stripe_size")]
    pub default_stripe_size: u64,
    /// Stripes per new object; 0 stripes over every active target.
    #[serde(default)]
    pub default_stripe_count: usize,
    pub targets: Vec<Uuid>,
    #[serde(default)]
    pub attr_merge: AttrMergePolicy,
    /// Profile to register the volume under, if any.
    #[serde(default)]
    pub profile: Option<String>,
}

/// Validated volume description, fixed for the volume's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDesc {
    pub name: String,
    pub volume_id: Uuid,
    pub default_stripe_size: u64,
    pub default_stripe_count: usize,
    pub targets: Vec<Uuid>,
    pub attr_merge: AttrMergePolicy,
}

impl VolumeDesc {
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

impl VolumeConfig {
    pub fn new(name: impl Into<String>, targets: Vec<Uuid>) -> Self {
        Self {
            name: name.into(),
            target_count: targets.len(),
            default_stripe_size: DEFAULT_STRIPE_SIZE,
            default_stripe_count: 0,
            targets,
            attr_merge: AttrMergePolicy::default(),
            profile: None,
        }
    }

    pub fn validate(&self) -> Result<VolumeDesc> {
        if self.targets.is_empty() {
            return Err(VolumeError::invalid("volume has no targets"));
        }
        if self.target_count != self.targets.len() {
            return Err(VolumeError::invalid(format!(
                "target_count {} does not match {} configured targets",
                self.target_count,
                self.targets.len()
            )));
        }
        let mut seen = HashSet::with_capacity(self.targets.len());
        for uuid in &self.targets {
            if !seen.insert(uuid) {
                return Err(VolumeError::invalid(format!("target {uuid} listed twice")));
            }
        }

        let mut stripe_size = self.default_stripe_size;
        if stripe_size < MIN_TRANSFER_SIZE {
            warn!(
                volume = %self.name,
                stripe_size,
                "stripe size below minimum, raising to {MIN_TRANSFER_SIZE}"
            );
            stripe_size = MIN_TRANSFER_SIZE;
        }
        let stripes = if self.default_stripe_count == 0 {
            self.targets.len()
        } else {
            self.default_stripe_count
        };
        check_stripe_width(stripe_size, stripes as u64)?;

        Ok(VolumeDesc {
            name: self.name.clone(),
            volume_id: Uuid::new_v4(),
            default_stripe_size: stripe_size,
            default_stripe_count: self.default_stripe_count,
            targets: self.targets.clone(),
            attr_merge: self.attr_merge,
        })
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<VolumeConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read volume config from {}", path.display()))?;
    let cfg: VolumeConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML volume config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn uuids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_small_stripe_size_is_raised() {
        let mut cfg = VolumeConfig::new("v", uuids(2));
        cfg.default_stripe_size = 4096;
        let desc = cfg.validate().unwrap();
        assert_eq!(desc.default_stripe_size, MIN_TRANSFER_SIZE);
    }

    #[test]
    fn test_rejects_bad_target_lists() {
        assert!(VolumeConfig::new("v", vec![]).validate().is_err());

        let mut cfg = VolumeConfig::new("v", uuids(3));
        cfg.target_count = 4;
        assert!(matches!(cfg.validate(), Err(VolumeError::InvalidArgument(_))));

        let id = Uuid::new_v4();
        assert!(VolumeConfig::new("v", vec![id, id]).validate().is_err());
    }

    #[test]
    fn test_rejects_width_overflow() {
        let mut cfg = VolumeConfig::new("v", uuids(4));
        cfg.default_stripe_size = u64::MAX / 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_yaml() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: vol0\ntarget_count: 2\ndefault_stripe_count: 1\ntargets:\n  - {a}\n  - {b}\nattr_merge: latest\n"
        )
        .unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.name, "vol0");
        assert_eq!(cfg.targets, vec![a, b]);
        assert_eq!(cfg.default_stripe_size, DEFAULT_STRIPE_SIZE);
        assert_eq!(cfg.attr_merge, AttrMergePolicy::Latest);
        assert!(cfg.profile.is_none());
    }
}
