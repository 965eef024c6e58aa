//! pixloader CLI - fetch images through the cache pipeline.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use pixloader::{Loader, LoaderConfig, SystemDirProvider};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pixloader")]
#[command(about = "Load remote images through a two-tier cache", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Override the disk cache budget in MiB
    #[arg(long)]
    disk_budget_mib: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a URL through the cache pipeline
    Fetch {
        /// Image URL to load
        url: String,

        /// Maximum decoded width (0 = no downsampling)
        #[arg(long, default_value = "0")]
        width: u32,

        /// Maximum decoded height (0 = no downsampling)
        #[arg(long, default_value = "0")]
        height: u32,

        /// Write the decoded image to this PNG file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete the on-disk cache contents
    Clear,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = LoaderConfig::new();
    if let Some(mib) = args.disk_budget_mib {
        config = config.with_disk_budget_bytes(mib * 1024 * 1024);
    }

    match args.command {
        Command::Fetch {
            url,
            width,
            height,
            output,
        } => fetch(config, url, width, height, output),
        Command::Clear => clear(),
    }
}

fn fetch(config: LoaderConfig, url: String, width: u32, height: u32, output: Option<PathBuf>) {
    let loader = Arc::new(Loader::build(config));
    if !loader.disk_enabled() {
        eprintln!("note: disk cache disabled, downloads will not persist");
    }

    // The constructing thread is the consumer thread; run the blocking
    // load on a worker instead.
    let worker = {
        let loader = Arc::clone(&loader);
        let url = url.clone();
        thread::spawn(move || loader.load_pixmap(&url, width, height))
    };
    let pixmap = match worker.join() {
        Ok(Some(pixmap)) => pixmap,
        Ok(None) => {
            eprintln!("error: no image could be loaded from {url}");
            process::exit(1);
        }
        Err(_) => {
            eprintln!("error: load worker panicked");
            process::exit(1);
        }
    };

    println!("{url}: {}x{} ({} KiB decoded)", pixmap.width(), pixmap.height(), pixmap.weight_kb());

    let stats = loader.stats();
    println!(
        "cache: memory {} hit / {} miss, disk {} hit / {} miss, {} bytes downloaded",
        stats.memory_hits,
        stats.memory_misses,
        stats.disk_hits,
        stats.disk_misses,
        stats.bytes_downloaded
    );

    if let Some(path) = output {
        let image = image::RgbaImage::from_raw(
            pixmap.width(),
            pixmap.height(),
            pixmap.data().to_vec(),
        )
        .expect("pixmap buffer matches its dimensions");
        if let Err(err) = image.save(&path) {
            eprintln!("error: failed to write {}: {err}", path.display());
            process::exit(1);
        }
        println!("wrote {}", path.display());
    }
}

fn clear() {
    let directory = {
        use pixloader::CacheDirProvider;
        SystemDirProvider::default().cache_dir()
    };
    if !directory.exists() {
        println!("nothing to clear at {}", directory.display());
        return;
    }
    match std::fs::remove_dir_all(&directory) {
        Ok(()) => println!("cleared {}", directory.display()),
        Err(err) => {
            eprintln!("error: failed to clear {}: {err}", directory.display());
            process::exit(1);
        }
    }
}
