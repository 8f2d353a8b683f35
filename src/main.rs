use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use improxy::cache::{Cache, CachingTransport, DiskCache, NopCache};
use improxy::config::{comma_list, load_secrets, CliArgs, ProxyConfig};
use improxy::fetch::{HttpObjectStore, ObjectStore, DEFAULT_MAX_ORIGIN_BYTES};
use improxy::handler::{router, Proxy};
use improxy::transport::TransformingTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    init_tracing(&args.logfile)?;

    let secrets = load_secrets()?;

    let cache: Arc<dyn Cache> = if args.cache.is_empty() {
        Arc::new(NopCache)
    } else {
        let path = std::path::Path::new(&args.cache);
        tracing::info!(path = %path.display(), "disk cache enabled");
        Arc::new(DiskCache::new(path))
    };

    let client = reqwest::Client::builder()
        .user_agent(concat!("improxy/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
        client.clone(),
        secrets.store_endpoint.clone(),
        secrets.store_bucket.clone(),
    ));

    let inner = TransformingTransport::new(client, store, cache.clone(), DEFAULT_MAX_ORIGIN_BYTES);
    let outer = CachingTransport::new(Arc::new(inner), cache);

    let config = ProxyConfig {
        whitelist: comma_list(&args.whitelist),
        referrers: comma_list(&args.referrers),
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        secrets,
        ..ProxyConfig::default()
    };

    let app = router(Proxy::new(Arc::new(outer), config)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    tracing::info!(">>>>> improxy listening on {}", args.addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("<<<<< improxy terminated");
    Ok(())
}

fn init_tracing(logfile: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "improxy=info,tower_http=warn".into());
    if logfile.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    }
    Ok(())
}

/// Stop accepting connections on SIGINT or SIGTERM; axum then drains
/// in-flight requests before `serve` returns.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("<<<<< caught shutdown signal, draining");
}
