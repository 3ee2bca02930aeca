use std::process;
use std::sync::Arc;

use tokio::signal;

use dns_resolver::blocklist::AllowAll;
use dns_resolver::cache::SharedCache;
use dns_resolver::context::Context;
use dns_resolver::forwarder::Forwarder;
use dns_resolver::resolver::Resolver;
use dns_resolver::zonecache::ZoneCache;

use resolved::logging;
use resolved::metrics::{self, PrometheusMetrics};
use resolved::settings::Settings;
use resolved::transport::UdpTransport;
use resolved::zones::load_zones;

const METRICS_PORT: u16 = 9000;

#[tokio::main]
async fn main() {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            process::exit(1);
        }
    };

    logging::init(&settings);

    tracing::info!(
        port = settings.port,
        cache_size = settings.cache_size,
        disable_cache = settings.disable_cache,
        zone_dir = %settings.zone_dir.display(),
        "starting up"
    );

    let zones = load_zones(&settings.zone_dir);
    tracing::info!(zone_count = zones.len(), "loaded authoritative zones");
    let zone_cache = Arc::new(ZoneCache::new());
    for apex in zones.apices() {
        if let Some(zone) = zones.get(&apex) {
            zone_cache.put_zone(zone.clone());
        }
    }

    let cache = if settings.disable_cache {
        None
    } else {
        Some(SharedCache::new(settings.cache_size))
    };

    let forwarder = Forwarder::new(settings.servers.clone(), std::time::Duration::from_secs(5), true);

    let resolver = Arc::new(
        Resolver::new(
            Arc::new(AllowAll),
            zone_cache,
            cache,
            forwarder,
            Arc::new(PrometheusMetrics),
        )
        .with_max_recursion(settings.max_recursion),
    );

    let ctx = Context::background();

    let metrics_addr = format!("0.0.0.0:{METRICS_PORT}").parse().unwrap();
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = metrics::serve(metrics_addr).await {
            tracing::error!(%err, "metrics endpoint failed");
        }
    });

    let transport = UdpTransport::new(format!("0.0.0.0:{}", settings.port).parse().unwrap());
    let transport_ctx = ctx.clone();
    let transport_resolver = resolver.clone();
    let transport_task = tokio::spawn(async move {
        transport
            .run(transport_ctx, move |ctx, question, client_addr| {
                let resolver = transport_resolver.clone();
                async move { resolver.handle_query(&ctx, &question, client_addr).await }
            })
            .await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    ctx.cancel();

    if let Err(err) = transport_task.await {
        tracing::error!(%err, "transport task panicked");
    }
    metrics_task.abort();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
