//! Read zip archives through a cache that closes them lazily.
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, error};
use zip_reaper::diagnostics::AsyncDiagnostics;
use zip_reaper::{Config, HandleCache, ZipProvider};

mod app_config;
mod trc;

use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    author = "Marko Vejnovic",
    about = "Read zip archives through a delayed-close archive cache."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a zip-reaper config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print one entry of an archive to stdout.
    Read {
        /// The archive to read from.
        archive: PathBuf,
        /// The entry name within the archive.
        entry: String,
    },

    /// List the entries of an archive.
    List {
        /// The archive to list.
        archive: PathBuf,
    },

    /// Open and close archives repeatedly, then print the cache's state.
    Stats {
        /// Archives to cycle through.
        #[arg(required = true)]
        archives: Vec<PathBuf>,

        /// How many times each archive is opened and closed.
        #[arg(short, long, default_value_t = 10)]
        rounds: u32,

        /// Pause between rounds, in milliseconds.
        #[arg(short, long, default_value_t = 50)]
        pause_ms: u64,
    },

    /// Print the effective configuration as TOML.
    Config,
}

type Cache = HandleCache<ZipProvider>;

fn read_entry(cache: &Cache, archive: &Path, entry: &str) -> Result<(), Box<dyn std::error::Error>> {
    let handle = cache.handle(archive)?;
    let zip = handle.open()?;
    let result = handle
        .entry_stream(&zip, entry)
        .map_err(Box::<dyn std::error::Error>::from)
        .and_then(|mut stream| {
            io::copy(&mut stream, &mut io::stdout().lock())?;
            Ok(())
        });
    drop(zip);
    handle.close()?;
    result
}

fn list_entries(cache: &Cache, archive: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let handle = cache.handle(archive)?;
    let zip = handle.open()?;
    let mut out = io::stdout().lock();
    debug!(entries = zip.entry_count(), "Listing archive.");
    for name in zip.entry_names() {
        writeln!(out, "{name}")?;
    }
    drop(zip);
    handle.close()?;
    Ok(())
}

fn cycle(
    cache: &Cache,
    archives: &[PathBuf],
    rounds: u32,
    pause: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let handles = archives
        .iter()
        .map(|path| cache.handle(path))
        .collect::<Result<Vec<_>, _>>()?;
    for round in 0..rounds {
        for handle in &handles {
            let zip = handle.open()?;
            drop(zip);
            handle.close()?;
        }
        debug!(round, "Finished round.");
        std::thread::sleep(pause);
    }
    Ok(())
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    if let Err(e) = Trc::default().init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    let config: Config = app_config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if matches!(args.command, Command::Config) {
        match app_config::render(&config) {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                error!("Failed to render configuration: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let sink = match AsyncDiagnostics::spawn() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("Failed to start the diagnostics thread: {e}");
            std::process::exit(1);
        }
    };
    let cache = HandleCache::new(ZipProvider, &config, sink).unwrap_or_else(|e| {
        error!("Failed to start the archive cache: {e}");
        std::process::exit(1);
    });

    let result = match &args.command {
        Command::Read { archive, entry } => read_entry(&cache, archive, entry),
        Command::List { archive } => list_entries(&cache, archive),
        Command::Stats {
            archives,
            rounds,
            pause_ms,
        } => cycle(&cache, archives, *rounds, Duration::from_millis(*pause_ms)).map(|()| {
            print!("{}", cache.introspect());
        }),
        Command::Config => Ok(()),
    };

    cache.shutdown();
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
    debug!("Done.");
}
