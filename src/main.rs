//! CloudMount cache maintenance tool
//!
//! Inspects and maintains the local content cache used by CloudMount volumes.

use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudmount_cache::{CacheConfig, ContentCache};

/// Environment variable pointing at a JSON config file
const ENV_CONFIG: &str = "CLOUDMOUNT_CACHE_CONFIG";

/// CLI command
#[derive(Debug)]
enum Command {
    /// Rebuild the index and report what was found (default)
    Scan,
    /// Print every entry as JSON
    List,
    /// Print pinned-but-missing and dirty resource ids
    Backlog,
    /// Make room for a number of bytes
    Evict { bytes: u64 },
    /// Delete every cached file
    Clear,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"CloudMount Cache - inspect and maintain the local content cache

USAGE:
    cloudmount-cache                     # Same as scan
    cloudmount-cache scan
    cloudmount-cache list
    cloudmount-cache backlog
    cloudmount-cache evict <bytes>
    cloudmount-cache clear
    cloudmount-cache help

COMMANDS:
    scan     Rebuild the index from disk, repairing stale files
    list     Print every cache entry as one JSON object per line
    backlog  Print resources waiting to be fetched or uploaded
    evict    Evict tmp files if <bytes> more wouldn't fit
    clear    Delete every cached file (downloads are kept)
    help     Show this help message

ENVIRONMENT:
    CLOUDMOUNT_CACHE_CONFIG          JSON config file
    CLOUDMOUNT_CACHE_DIR             Cache root directory
    CLOUDMOUNT_CACHE_RESERVED_BYTES  Free space to keep on the volume
    RUST_LOG                         Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Scan);
    }

    match args[1].as_str() {
        "scan" => Ok(Command::Scan),
        "list" => Ok(Command::List),
        "backlog" => Ok(Command::Backlog),
        "evict" => {
            let bytes = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: cloudmount-cache evict <bytes>"))?
                .parse()
                .map_err(|e| anyhow!("Invalid byte count: {}", e))?;
            Ok(Command::Evict { bytes })
        }
        "clear" => Ok(Command::Clear),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

fn load_config() -> Result<CacheConfig> {
    match env::var(ENV_CONFIG) {
        Ok(path) => CacheConfig::load(&PathBuf::from(path)),
        Err(_) => CacheConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = load_config()?;
    let cache = ContentCache::start(&config)?;

    let summary = match cache.initialize().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(root = %config.root.display(), error = %e, "Failed to initialize cache");
            return Err(e.into());
        }
    };

    match command {
        Command::Scan => {
            println!(
                "{}: {} entries ({} stale files removed, {} repaired)",
                cache.layout().base().display(),
                summary.entries,
                summary.removed,
                summary.repaired
            );
        }
        Command::List => {
            for entry in cache.entries().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Backlog => {
            let (to_fetch, to_upload) = cache.get_resource_ids_of_backlog().await?;
            if to_fetch.is_empty() && to_upload.is_empty() {
                println!("Backlog is empty.");
            }
            for id in to_fetch {
                println!("fetch  {}", id);
            }
            for id in to_upload {
                println!("upload {}", id);
            }
        }
        Command::Evict { bytes } => {
            if cache.free_disk_space_if_needed_for(bytes).await? {
                println!("{} bytes fit.", bytes);
            } else {
                println!("Not enough space for {} bytes even after eviction.", bytes);
            }
        }
        Command::Clear => {
            cache.clear_all().await?;
            info!("Cache cleared");
        }
        Command::Help => {}
    }

    Ok(())
}
