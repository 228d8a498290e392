// Gateway entrypoint (Axum + Tokio)
//
// This file wires up shared services (KV, fanout bus, follow graph, presence
// store, reaper), builds the HTTP router from the route modules, attaches
// middleware layers (trace, timeout, CORS), and starts listening with
// graceful shutdown.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::Router;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use bus::Bus;
use graph::{CachedGraph, MemGraph};
use kv::Kv;
use presence::{PresenceConfig, PresenceStore, Reaper};

mod routes;
mod session;
mod state;

use crate::state::{AppState, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // 1) Construct shared services. Everything is passed by handle into the
    //    components that need it; nothing is discovered through globals, so
    //    tests can assemble the same pieces around fakes.
    let cfg = Arc::new(PresenceConfig::from_env());

    let kv_addr = std::env::var("KV_ADDR").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let kv = Arc::new(Kv::connect(&kv_addr).await?);

    let bus_addr =
        std::env::var("BUS_PUB_ADDR").unwrap_or_else(|_| "tcp://127.0.0.1:7777".to_string());
    let bus = Arc::new(Bus::bind(&bus_addr)?);

    let graph = Arc::new(CachedGraph::new(MemGraph::new()));
    let presence = Arc::new(PresenceStore::new(Arc::clone(&kv), Arc::clone(&cfg)));

    // 2) The reaper is the single source of offline transitions; one loop
    //    per process covers all shards.
    let reaper = Arc::new(Reaper::spawn(Arc::clone(&presence), Arc::clone(&bus)));

    let state = AppState {
        kv,
        bus,
        graph,
        presence,
        registry: Arc::new(SessionRegistry::new()),
        cfg,
    };

    // 3) Build route tree from the modules and attach our `AppState`.
    let dev_routes = std::env::var("DEV_ROUTES").ok().as_deref() == Some("1");
    if dev_routes {
        tracing::warn!("dev routes enabled; do not expose this instance");
    }
    let base: Router<_> = routes::all(dev_routes).with_state(state.clone());

    // 4) Middleware: request tracing, a handler timeout (the WS upgrade
    //    response itself is quick; the upgraded stream is unaffected), and
    //    permissive CORS for browser clients.
    let app = base
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(CorsLayer::permissive());

    // 5) Bind and serve with graceful shutdown.
    let addr: SocketAddr = std::env::var("GATEWAY_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:7000".to_string())
        .parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "presence gateway listening");

    let reaper_for_shutdown = Arc::clone(&reaper);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            reaper_for_shutdown.shutdown().await;
        })
        .await?;

    Ok(())
}
