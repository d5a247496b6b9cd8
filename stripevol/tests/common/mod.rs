#![allow(dead_code)]

use std::sync::Arc;

use stripevol::types::Credentials;
use stripevol::{DeviceTable, MemTarget, TargetOp, Volume, VolumeConfig, VolumeHandle};

pub const STRIPE: u64 = 64 * 1024;

pub struct Fixture {
    pub volume: Arc<Volume>,
    pub targets: Vec<MemTarget>,
    pub devices: Arc<DeviceTable>,
}

impl Fixture {
    pub fn target(&self, idx: usize) -> &MemTarget {
        &self.targets[idx]
    }

    pub fn calls(&self, op: TargetOp) -> Vec<usize> {
        self.targets.iter().map(|t| t.calls(op)).collect()
    }

    pub async fn connect(&self) -> VolumeHandle {
        self.volume.connect(&creds()).await.unwrap()
    }
}

pub fn creds() -> Credentials {
    Credentials::new("test-client")
}

pub fn make_targets(n: usize) -> Vec<MemTarget> {
    (0..n).map(|i| MemTarget::new(format!("ost{i}"))).collect()
}

pub fn make_config(targets: &[MemTarget], stripe_count: usize) -> VolumeConfig {
    use stripevol::TargetDevice;
    let mut cfg = VolumeConfig::new("testvol", targets.iter().map(|t| t.uuid()).collect());
    cfg.default_stripe_size = STRIPE;
    cfg.default_stripe_count = stripe_count;
    cfg
}

pub fn fixture_with(targets: Vec<MemTarget>, cfg: &VolumeConfig) -> Fixture {
    let devices = Arc::new(DeviceTable::new());
    for t in &targets {
        devices.attach(Arc::new(t.clone())).unwrap();
    }
    let volume = Volume::setup(cfg, devices.clone()).unwrap();
    Fixture {
        volume,
        targets,
        devices,
    }
}

pub fn fixture(n: usize, stripe_count: usize) -> Fixture {
    let targets = make_targets(n);
    let cfg = make_config(&targets, stripe_count);
    fixture_with(targets, &cfg)
}
