use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use formats::FormatRegistry;
use library::{config_path_from_env, ConfigStore, Library, ScanPhase};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut watch = false;
    let directories: Vec<PathBuf> = env::args()
        .skip(1)
        .filter(|arg| {
            if arg == "--watch" {
                watch = true;
                false
            } else {
                true
            }
        })
        .map(PathBuf::from)
        .collect();
    if directories.is_empty() && !watch {
        return Err("usage: chorale_scan [--watch] <directory>...".into());
    }
    let data_dir = PathBuf::from(env::var("CHORALE_DATA").unwrap_or_else(|_| "data".to_string()));

    let (config, created) = ConfigStore::load_or_create(&config_path_from_env())?;
    if created {
        println!("Created default configuration");
    }
    let registry = Arc::new(FormatRegistry::with_default_formats());
    let library = Library::open(config, registry, &data_dir);

    if watch {
        library.start().await?;
    }
    for directory in directories {
        let handle = library.scan_directory(&directory);
        match handle.wait().await {
            ScanPhase::Completed => println!("Scanned {:?}", handle.directory()),
            phase => println!("Scan of {:?} ended in {:?}", handle.directory(), phase),
        }
    }
    println!("Library contains {} tracks", library.len());

    if watch {
        println!("Watching for changes, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }
    library.flush()?;
    Ok(())
}
