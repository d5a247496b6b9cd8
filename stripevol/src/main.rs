use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stripevol::types::{Credentials, Extent, ObjectAttr};
use stripevol::{
    DeviceTable, MemTarget, Profile, ProfileTable, StripeOptions, Volume, load_config,
};

#[derive(Parser, Debug)]
#[command(name = "stripevol", version, about = "Striped volume over independent storage targets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a volume config and print the resulting description
    ShowConfig {
        #[arg(short, long, env = "STRIPEVOL_CONFIG")]
        config: PathBuf,
    },
    /// Run a create/write/read round over in-memory targets
    Demo {
        #[arg(short, long, env = "STRIPEVOL_CONFIG")]
        config: PathBuf,

        /// Logical object id to create
        #[arg(long, default_value_t = 0x1000)]
        object_id: u64,

        /// Bytes to write
        #[arg(long, default_value_t = 3 * 1024 * 1024)]
        size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::ShowConfig { config } => {
            let cfg = load_config(&config)?;
            let desc = cfg.validate().context("invalid volume config")?;
            print!("{}", serde_yaml::to_string(&desc)?);
        }
        Commands::Demo {
            config,
            object_id,
            size,
        } => demo(config, object_id, size).await?,
    }
    Ok(())
}

async fn demo(config: PathBuf, object_id: u64, size: usize) -> anyhow::Result<()> {
    let cfg = load_config(&config)?;
    let devices = Arc::new(DeviceTable::new());
    for (i, uuid) in cfg.targets.iter().enumerate() {
        devices.attach(Arc::new(MemTarget::with_uuid(*uuid, format!("mem{i}"))))?;
    }
    let volume = Volume::setup(&cfg, devices)?;

    let profiles = ProfileTable::new();
    if let Some(name) = &cfg.profile {
        profiles.add(Profile {
            name: name.clone(),
            volume: cfg.name.clone(),
            metadata: None,
        })?;
        info!(profile = %name, "profile registered");
    }

    let handle = volume.connect(&Credentials::new("stripevol-demo")).await?;
    let layout = volume
        .create(&ObjectAttr::with_id(object_id), &StripeOptions::default())
        .await?;
    println!("layout: {:?}", layout.view());

    let data: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    volume.write(&layout, 0, data.clone()).await?;
    let back = volume.read(&layout, 0, size).await?;
    anyhow::ensure!(back == data, "read back differs from what was written");

    let attr = volume.getattr(&layout).await?;
    println!("object {:#x}: size {} blocks {}", attr.id, attr.size, attr.blocks);
    println!("statfs: {:?}", volume.statfs().await?);

    volume
        .punch(&layout, &ObjectAttr::with_id(object_id), Extent::whole())
        .await?;
    volume.destroy(&layout, &ObjectAttr::with_id(object_id)).await?;
    volume.disconnect(handle).await?;
    info!(volume = volume.name(), "demo finished");
    Ok(())
}
