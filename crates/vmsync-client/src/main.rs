use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vmsync_client::features::actions::repo::{ActionEvent, ActionEventKind};
use vmsync_client::features::observability::controller::global_observability_controller;
use vmsync_client::shared::config::SyncConfig;
use vmsync_client::shared::types::{ResourceId, Snapshot};
use vmsync_client::SyncSession;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vmsync_client=info,info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = SyncConfig::from_env();
    info!(
        base_url = %config.base_url,
        list_interval_secs = config.cadence.list.as_secs(),
        "Starting vmsync watcher"
    );

    let session = SyncSession::connect(config)?;

    if let Ok(raw) = std::env::var("VMSYNC_LIVE_MODE") {
        let live_mode = matches!(raw.trim(), "1" | "true" | "yes");
        if let Err(error) = session.settings().set_live_mode(live_mode) {
            warn!(error = %error, "Failed to persist live mode");
        }
    }

    let _completions = session
        .bus()
        .subscribe(ActionEventKind::Completed, |event| {
            if let ActionEvent::Completed(result) = event {
                info!(
                    resource_id = result.resource_id,
                    action = %result.action,
                    success = result.is_success(),
                    error = ?result.error,
                    "Action completed"
                );
            }
        });

    let list = session.start_list_polling();

    let detail = match std::env::var("VMSYNC_WATCH_DETAIL") {
        Ok(raw) => match raw.trim().parse::<ResourceId>() {
            Ok(id) => {
                info!(resource_id = id, "Watching resource detail");
                Some(session.mount_detail(id)?)
            }
            Err(_) => {
                warn!(value = %raw, "VMSYNC_WATCH_DETAIL is not a resource id, ignoring");
                None
            }
        },
        Err(_) => None,
    };

    let mut snapshots = session.store().subscribe();
    let mut previous: Arc<Snapshot> = snapshots.borrow_and_update().clone();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = snapshots.borrow_and_update().clone();
                log_snapshot_change(&previous, &current);
                previous = current;
            }
        }
    }

    if let Some(detail) = &detail {
        detail.teardown();
    }
    list.teardown();
    session.teardown();

    match global_observability_controller().render_metrics() {
        Ok(metrics) => debug!(metrics = %metrics, "Final metrics"),
        Err(error) => warn!(error = %error, "Failed to render metrics"),
    }

    info!("vmsync watcher stopped");
    Ok(())
}

fn log_snapshot_change(previous: &Snapshot, current: &Snapshot) {
    let changed: Vec<ResourceId> = current
        .iter()
        .filter(|resource| {
            previous
                .get(resource.id)
                .map(|before| !Arc::ptr_eq(before, resource))
                .unwrap_or(true)
        })
        .map(|resource| resource.id)
        .collect();
    let removed = previous
        .iter()
        .filter(|resource| !current.contains(resource.id))
        .count();

    info!(
        version = current.version(),
        resources = current.len(),
        changed = changed.len(),
        removed,
        "Snapshot updated"
    );

    for id in changed {
        if let Some(resource) = current.get(id) {
            debug!(resource_id = id, status = %resource.status, name = %resource.name, "Resource changed");
        }
    }
}
