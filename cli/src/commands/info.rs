//! `a3s-build info` command.

use a3s_build_cache::image::LocalContentStore;
use a3s_build_cache::snapshot::LocalRefManager;
use a3s_build_core::CacheConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct InfoArgs {
    /// List every snapshot ref
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn execute(args: InfoArgs, config: &CacheConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-build version {}", a3s_build_core::VERSION);
    println!("State directory: {}", config.state_dir.display());
    println!(
        "Session timeout: {:?}, progress interval: {:?}",
        config.local.session_timeout(),
        config.local.progress_interval()
    );
    println!(
        "Image fetches: {} concurrent, {} attempts, lease ttl {:?}",
        config.image.fetch_concurrency,
        config.image.fetch_retries,
        config.image.lease_ttl()
    );

    let snapshots_dir = config.snapshots_dir();
    let refs = if snapshots_dir.exists() {
        Some(LocalRefManager::new(&snapshots_dir)?)
    } else {
        None
    };
    match &refs {
        Some(refs) => {
            let records = refs.list();
            let mutable = records.iter().filter(|r| r.mutable).count();
            println!(
                "Refs: {} mutable, {} snapshots ({})",
                mutable,
                records.len() - mutable,
                output::format_bytes(refs.total_size())
            );
        }
        None => println!("Refs: 0 mutable, 0 snapshots"),
    }

    let content_dir = config.content_dir();
    if content_dir.exists() {
        let store = LocalContentStore::open(&content_dir)?;
        println!(
            "Blobs: {} ({})",
            store.list().await.len(),
            output::format_bytes(store.total_size().await)
        );
    } else {
        println!("Blobs: 0");
    }

    if args.verbose {
        if let Some(refs) = refs {
            println!();
            let mut table = output::new_table(&["ID", "KIND", "POLICY", "SIZE", "DESCRIPTION"]);
            for record in refs.list() {
                let kind = if record.mutable { "mutable" } else { "snapshot" };
                table.add_row(vec![
                    record.id.clone(),
                    kind.to_string(),
                    format!("{:?}", record.policy).to_lowercase(),
                    output::format_bytes(record.size_bytes),
                    record.description.clone(),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}
