use std::sync::Arc;

use anyhow::Context;

use switchyard_api::app::{AppServices, build_app};
use switchyard_infra::SwitchyardConfig;
use switchyard_infra::archive::{ArchivalSink, SqliteSnapshotStore};
use switchyard_infra::channel::Channels;
use switchyard_infra::store::SharedStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SwitchyardConfig::from_args().context("failed to load configuration")?;
    switchyard_observability::init_with(&config.log.filter, config.log.json);

    let (sink_store, admin_store) = open_stores(&config)?;

    let snapshots = Arc::new(
        SqliteSnapshotStore::open(&config.archive.path).with_context(|| {
            format!(
                "failed to open snapshot store at {}",
                config.archive.path.display()
            )
        })?,
    );

    let sink = ArchivalSink::new(
        Channels::with_priority(sink_store, config.channel.priority),
        snapshots.clone(),
        config.sink_config(),
    )
    .spawn();

    if config.admin.port == 0 {
        tracing::info!("admin http disabled; waiting for ctrl-c");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    } else {
        let services = AppServices::new(
            Channels::with_priority(admin_store, config.channel.priority),
            snapshots,
        );
        let app = build_app(services);

        let addr = format!("0.0.0.0:{}", config.admin.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        tracing::info!("listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("http server failed")?;
    }

    tracing::info!("shutting down archival sink");
    tokio::task::spawn_blocking(move || sink.shutdown())
        .await
        .context("archival sink did not shut down cleanly")?;

    Ok(())
}

/// One handle for the sink and one for the admin surface: the sink's
/// blocking reads must not stall admin requests.
#[cfg(feature = "redis")]
fn open_stores(config: &SwitchyardConfig) -> anyhow::Result<(SharedStore, SharedStore)> {
    let open = || -> anyhow::Result<SharedStore> {
        let store = switchyard_infra::store::RedisStore::open(&config.store)
            .with_context(|| format!("invalid store address {}", config.store.url))?;
        Ok(Arc::new(store))
    };
    Ok((open()?, open()?))
}

#[cfg(not(feature = "redis"))]
fn open_stores(_config: &SwitchyardConfig) -> anyhow::Result<(SharedStore, SharedStore)> {
    tracing::warn!("built without redis support; using a process-local in-memory store");
    let store: SharedStore = Arc::new(switchyard_infra::store::InMemoryStore::new());
    Ok((store.clone(), store))
}
