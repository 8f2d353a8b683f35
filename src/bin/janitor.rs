use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Cache entries untouched for this long are eligible for deletion.
const MAX_AGE: Duration = Duration::from_secs(10 * 24 * 3600);

/// Safety rail: only ever sweep below this prefix.
const ALLOWED_PREFIX: &str = "/data/tmp_improxy/cache";

/// Offline sweeper for the improxy disk cache: walks the cache tree and
/// deletes files whose mtime is older than ten days. Reads refresh
/// mtimes, so this is an LRU expiry.
#[derive(Debug, Parser)]
#[command(name = "janitor", version)]
struct Args {
    /// Image cache directory to sweep.
    #[arg(long, default_value = ALLOWED_PREFIX)]
    dir: String,

    /// Actually delete; without this flag the sweep only reports.
    #[arg(long)]
    delete: bool,

    /// Log file path; stdout when empty.
    #[arg(long, default_value = "")]
    log: String,

    /// Log level filter, e.g. info or debug.
    #[arg(long, default_value = "debug")]
    level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if !args.dir.starts_with(ALLOWED_PREFIX) {
        eprintln!("dir must begin with: {ALLOWED_PREFIX}");
        return Ok(());
    }

    let filter = EnvFilter::try_new(&args.level).unwrap_or_else(|_| "debug".into());
    if args.log.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.log)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc_handler(move || running.store(false, Ordering::SeqCst))?;
    }

    let now = SystemTime::now();
    let mut delete_count: u64 = 0;
    let mut total_size: u64 = 0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    for entry in WalkDir::new(&args.dir) {
        if !running.load(Ordering::SeqCst) {
            tracing::info!("stopped by signal");
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "walk error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok());
        let Some(age) = age else { continue };

        if age > MAX_AGE {
            delete_count += 1;
            total_size += meta.len();
            tracing::info!(
                num = delete_count,
                size_gb = total_size as f64 / GB,
                path = %entry.path().display(),
                "deleting stale cache file"
            );
            if args.delete {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %err, "delete failed");
                }
            }
            // Pace the sweep so a huge backlog doesn't saturate the disk.
            if delete_count % 1000 == 0 {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }

    tracing::info!(
        deleted = delete_count,
        size_gb = total_size as f64 / GB,
        "sweep complete"
    );
    Ok(())
}

fn ctrlc_handler<F: FnMut() + Send + 'static>(
    mut f: F,
) -> Result<(), Box<dyn std::error::Error>> {
    // A dedicated runtime thread just for signal delivery keeps the
    // sweep itself synchronous.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    std::thread::spawn(move || {
        rt.block_on(async {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            f();
        });
    });
    Ok(())
}
