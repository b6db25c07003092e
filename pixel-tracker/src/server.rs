use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use pixel_common::metrics::setup_metrics_recorder;
use pixel_common::readiness::PixelReadinessRegistry;
use pixel_common::storage::{FileStorage, MemoryStorage, SessionStorage};
use pixel_common::time::SystemTime;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::adapters::AdapterSet;
use crate::analytics::AnalyticsClient;
use crate::config::Config;
use crate::destinations::StaticDestinations;
use crate::hooks::{HookRegistry, HttpForwardHook};
use crate::router;
use crate::sessions::SessionManager;
use crate::tracker::TrackerContext;

/// Build the tracker from `config` and serve the relay API on `listener` until `shutdown`
/// resolves.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let hooks = Arc::new(HookRegistry::new());
    for (platform, url) in &config.hook_endpoints.0 {
        let hook = HttpForwardHook::new(*platform, url, config.hook_timeout_ms.0)
            .with_context(|| format!("failed to build hook for {platform}"))?;
        hooks.install(*platform, Arc::new(hook));
    }

    let settings = config.tracker_settings();
    let analytics = config
        .analytics_url
        .as_ref()
        .map(|url| AnalyticsClient::new(url.as_str(), config.hook_timeout_ms.0))
        .transpose()
        .context("failed to build analytics client")?;
    let storage: Arc<dyn SessionStorage> = match &config.storage_dir {
        Some(dir) => Arc::new(
            FileStorage::new(dir.as_str()).context("failed to open dedup storage directory")?,
        ),
        None => Arc::new(MemoryStorage::new()),
    };

    let context = Arc::new(TrackerContext::new(
        Arc::new(PixelReadinessRegistry::new(config.max_retries)),
        hooks.clone(),
        AdapterSet::for_all_platforms(hooks, &settings.default_currency),
        Arc::new(StaticDestinations::from(config.destinations.clone())),
        analytics,
        config.retry_policy(),
        settings,
        config.hasher().context("invalid HASH_KEY")?,
        Arc::new(SystemTime {}),
    ));
    context.load_destinations().await;

    let sessions = Arc::new(SessionManager::new(
        context.clone(),
        storage,
        config.session_idle_timeout(),
    ));

    let recorder_handle = if config.export_prometheus {
        match setup_metrics_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to install prometheus recorder, /metrics disabled");
                None
            }
        }
    } else {
        None
    };
    let app = router::router(sessions, recorder_handle);

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    context.shutdown();
    Ok(())
}
