//! `a3s-build image-config` command.

use std::sync::Arc;

use a3s_build_cache::image::{
    ImageConfigResolver, LocalContentStore, Platform, RegistryAuth, RegistryResolver,
};
use a3s_build_cache::lease::{LeaseReleaseQueue, LocalLeaseManager};
use a3s_build_core::{CacheConfig, Digest};
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct ImageConfigArgs {
    /// Image reference (e.g., alpine:3.20 or ghcr.io/org/app@sha256:...)
    pub reference: String,

    /// Target platform as os/arch[/variant] (default: linux on the host architecture)
    #[arg(long)]
    pub platform: Option<String>,

    /// Print the config exactly as stored instead of pretty-printed
    #[arg(long)]
    pub raw: bool,
}

pub async fn execute(args: ImageConfigArgs, config: &CacheConfig) -> Result<(), Box<dyn std::error::Error>> {
    let platform = args.platform.as_deref().map(Platform::parse).transpose()?;

    let store = Arc::new(LocalContentStore::open(&config.content_dir())?);
    let leases = Arc::new(LocalLeaseManager::new());
    let queue = Arc::new(LeaseReleaseQueue::new());
    let resolver = ImageConfigResolver::new(store, config.image.clone())
        .with_leases(leases, queue.clone());
    let registry = RegistryResolver::with_auth(RegistryAuth::from_env());

    let result = resolver
        .resolve_config(&args.reference, &registry, platform.as_ref())
        .await;
    let failures = queue.flush().await;
    if failures > 0 {
        tracing::warn!(failures, "Some leases could not be released");
    }
    let (digest, data) = result?;

    println!("Digest: {}", digest);
    println!(
        "Config: {}",
        output::short_digest(Digest::from_bytes(&data).as_str())
    );
    if args.raw {
        println!("{}", String::from_utf8_lossy(&data));
    } else {
        let value: serde_json::Value = serde_json::from_slice(&data)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
