use tracing::{error, info, warn};

use chandrive::{format_size, BlobStore, ChunkPlanner, Config, Database};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = chandrive::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        chandrive::logging::init_console_only(&config.logging.level);
    }

    info!("chandrive - channel drive catalog");

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let planner = match ChunkPlanner::from_config(&config.storage) {
        Ok(planner) => planner,
        Err(e) => {
            error!("Invalid tier table: {}", e);
            std::process::exit(1);
        }
    };
    for tier in planner.tiers().iter() {
        info!("Tier {}: {} per message", tier.name, format_size(tier.ceiling));
    }
    info!(
        "Largest upload: {} ({} chunks)",
        format_size(planner.capacity()),
        config.storage.max_chunks_per_blob
    );

    let db = match Database::open(&config.database.path).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open catalog {}: {}", config.database.path, e);
            std::process::exit(1);
        }
    };

    let store = BlobStore::new(db.pool());
    match (store.count().await, store.list_orphaned(i64::MAX).await) {
        (Ok(total), Ok(orphans)) => {
            let orphaned_bytes: u64 = orphans.iter().map(|b| b.size).sum();
            info!("Catalog holds {} blobs", total);
            if !orphans.is_empty() {
                warn!(
                    "{} blobs ({}) are unreferenced and awaiting reclamation",
                    orphans.len(),
                    format_size(orphaned_bytes)
                );
            }
        }
        (Err(e), _) | (_, Err(e)) => error!("Failed to read catalog: {}", e),
    }
}
